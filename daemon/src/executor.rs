//! Running a claimed task.
//!
//! The polling loop hands each claimed task to an `Executor`. Production uses
//! `CommandExecutor`, which runs the job's command through the shell; tests
//! substitute an executor that never spawns processes.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use common::{frames, Job, Task};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

/// Everything an executor needs to render one task.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub job: Job,
    pub task: Task,
    /// Per-task output log inside the queue's log directory.
    pub log_path: PathBuf,
    pub database: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// The render ran but reported errors.
    Failed(String),
    /// Stopped before it finished; the task should go back to the queue.
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub outcome: Outcome,
    pub elapsed: Duration,
}

pub trait Executor: Send + Sync {
    /// Render a task until it finishes or `cancel` flips to `true`.
    fn execute(
        &self,
        request: RenderRequest,
        cancel: watch::Receiver<bool>,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionReport>> + Send + '_>>;
}

/// Runs the job's `command` field (plus optional `args`) with `sh -c`.
///
/// `{frames}`, `{start}`, `{end}`, `{job}` and `{task}` in the command line
/// are replaced with the task's values. The same values are exported as
/// `RQ_*` environment variables.
pub struct CommandExecutor {
    /// How long a cancelled render gets between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(5),
        }
    }
}

impl Executor for CommandExecutor {
    fn execute(
        &self,
        request: RenderRequest,
        cancel: watch::Receiver<bool>,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionReport>> + Send + '_>> {
        let kill_grace = self.kill_grace;
        Box::pin(async move {
            let started = Instant::now();
            let outcome = run_command(&request, cancel, kill_grace).await?;
            Ok(ExecutionReport {
                outcome,
                elapsed: started.elapsed(),
            })
        })
    }
}

async fn run_command(request: &RenderRequest, mut cancel: watch::Receiver<bool>, kill_grace: Duration) -> Result<Outcome> {
    let task_id = request.task.id();
    let command_line = match command_line(&request.job, &request.task) {
        Some(line) => line,
        None => {
            return Ok(Outcome::Failed(format!(
                "job {} has no command to run",
                request.job.id
            )))
        }
    };

    log::info!("Rendering task {}: {}", task_id, command_line);

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&command_line);
    cmd.envs(task_env(request));
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            log::error!("Failed to spawn task {}: {}", task_id, e);
            return Ok(Outcome::Failed(format!("failed to spawn: {}", e)));
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, tx.clone());
    }
    drop(tx);
    let writer = tokio::spawn(write_task_log(request.log_path.clone(), task_id.to_string(), rx));

    let outcome = tokio::select! {
        status = child.wait() => {
            let status = status.with_context(|| format!("Failed to wait for task {}", task_id))?;
            log::info!("Task {} finished with status: {}", task_id, status);
            if status.success() {
                Outcome::Completed
            } else {
                Outcome::Failed(format!("render exited with {}", status))
            }
        }
        _ = cancelled(&mut cancel) => {
            log::warn!("Interrupting task {}", task_id);
            terminate(&mut child, kill_grace).await;
            Outcome::Interrupted
        }
    };

    match writer.await {
        Ok(Err(e)) => log::warn!("Incomplete output log for task {}: {:#}", task_id, e),
        Err(e) => log::warn!("Output writer for task {} panicked: {}", task_id, e),
        Ok(Ok(())) => {}
    }
    Ok(outcome)
}

/// Expand the job's command template for one task.
pub fn command_line(job: &Job, task: &Task) -> Option<String> {
    let command = job.field("command")?.trim();
    if command.is_empty() {
        return None;
    }

    let mut line = command.to_string();
    match job.extra.get("args") {
        Some(serde_json::Value::Array(args)) => {
            for arg in args.iter().filter_map(|a| a.as_str()) {
                line.push(' ');
                line.push_str(arg);
            }
        }
        Some(serde_json::Value::String(args)) if !args.is_empty() => {
            line.push(' ');
            line.push_str(args);
        }
        _ => {}
    }

    let (start, end) = frames::bounds(&task.frames)
        .map(|(s, e)| (s.to_string(), e.to_string()))
        .unwrap_or_default();
    Some(
        line.replace("{frames}", &task.frames)
            .replace("{start}", &start)
            .replace("{end}", &end)
            .replace("{job}", &job.id.0)
            .replace("{task}", &task.task_no.to_string()),
    )
}

fn task_env(request: &RenderRequest) -> Vec<(String, String)> {
    let (start, end) = frames::bounds(&request.task.frames)
        .map(|(s, e)| (s.to_string(), e.to_string()))
        .unwrap_or_default();
    vec![
        ("RQ_JOB_ID".into(), request.job.id.to_string()),
        ("RQ_JOB_NAME".into(), request.job.name.clone()),
        ("RQ_JOB_TYPE".into(), request.job.job_type.clone()),
        ("RQ_TASK_ID".into(), request.task.id().to_string()),
        ("RQ_TASK_NO".into(), request.task.task_no.to_string()),
        ("RQ_FRAMES".into(), request.task.frames.clone()),
        ("RQ_START_FRAME".into(), start),
        ("RQ_END_FRAME".into(), end),
        (common::DATABASE_ENV.into(), request.database.to_string_lossy().into_owned()),
    ]
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

async fn write_task_log(path: PathBuf, task_id: String, mut rx: mpsc::UnboundedReceiver<String>) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("Failed to open task log {:?}", path))?;

    while let Some(line) = rx.recv().await {
        log::info!(target: "task_output", "{}: {}", task_id, line);
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
    }
    file.flush().await?;
    Ok(())
}

/// Resolves once `cancel` reads `true`. Never resolves if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                return;
            }
            log::warn!("Process {} ignored SIGTERM for {:?}, killing", pid, grace);
        }
    }
    if let Err(e) = child.kill().await {
        log::error!("Failed to kill render process: {}", e);
    }
}
