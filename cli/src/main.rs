use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use common::{frames, Job, JobId, RenderQueue, SelectionPolicy, Transition, WorkerId, WorkerStatus};

#[derive(Parser)]
#[command(author, version, about = "Submit and manage render jobs in a shared render queue", long_about = None)]
struct Cli {
    /// Root of the shared queue directory
    #[arg(short, long, global = true, env = common::DATABASE_ENV, default_value = common::DEFAULT_DATABASE_PATH)]
    database: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a new job
    Submit {
        /// Name of the job
        #[arg(short, long)]
        name: String,
        /// Job type, e.g. Maya or Nuke
        #[arg(short = 't', long = "type", default_value = "Generic")]
        job_type: String,
        /// Frame range, e.g. "1-100" or "1-100x2, 150"
        #[arg(short, long, default_value = frames::UNKNOWN)]
        frames: String,
        /// Frames per task
        #[arg(long, default_value_t = 10)]
        task_size: usize,
        /// 0 (paused) to 100 (most urgent)
        #[arg(short, long, default_value_t = 50, value_parser = clap::value_parser!(u8).range(0..=100))]
        priority: u8,
        #[arg(long, default_value = "")]
        comment: String,
        /// Command line run by workers; supports {frames}, {start}, {end}, {job} and {task}
        #[arg(short, long)]
        command: Option<String>,
        /// Extra job field, as key=value
        #[arg(long = "set", value_parser = parse_key_val)]
        fields: Vec<(String, String)>,
        /// Arguments appended to the command
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// List all jobs
    Jobs,
    /// Show a job and its tasks
    Tasks { job: String },
    /// Show the progress of a job
    Progress { job: String },
    /// Set a job's priority (0 pauses it)
    Priority { job: String, priority: i64 },
    /// Delete a job and all of its tasks
    DeleteJob {
        job: String,
        /// Delete even if workers are rendering some of its tasks
        #[arg(long)]
        force: bool,
    },
    /// Send every task of a job back to the queue
    RequeueJob { job: String },
    /// Mark a task as done
    Complete { job: String, task: u32 },
    /// Mark a task as failed
    Fail { job: String, task: u32 },
    /// Send a task back to the queue
    Requeue { job: String, task: u32 },
    /// Show the task a worker would claim next
    Next {
        /// Consider lower priority jobs when the top job has nothing queued
        #[arg(long)]
        fallthrough: bool,
    },
    /// List all workers
    Workers,
    /// Register a worker
    AddWorker {
        #[arg(short, long)]
        name: String,
        #[arg(long, default_value = "None")]
        pool: String,
        #[arg(long, default_value = "")]
        comment: String,
        /// Register as Idle instead of Disabled
        #[arg(long)]
        enabled: bool,
    },
    /// Set a worker's status (disabled, idle)
    WorkerStatus { worker: String, status: WorkerStatus },
    /// Remove a worker
    DeleteWorker {
        worker: String,
        /// Send its claimed tasks back to the queue first
        #[arg(long)]
        requeue: bool,
    },
    /// Send a worker's claimed tasks back to the queue
    RequeueWorker { worker: String },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let rq = RenderQueue::open(&cli.database)
        .with_context(|| format!("Failed to open render queue at {}", cli.database.display()))?;

    match cli.command {
        Commands::Submit {
            name,
            job_type,
            frames: range,
            task_size,
            priority,
            comment,
            command,
            fields,
            args,
        } => {
            let (range, task_frames) = split_frames(&range, task_size)?;
            let mut job = Job::new(name, job_type, range);
            job.priority = priority;
            job.comment = comment;
            job.username = current_username();
            if let Some(command) = command {
                job.set_field("command", command)?;
            }
            if !args.is_empty() {
                job.set_field("args", args)?;
            }
            for (key, value) in fields {
                job.set_field(key, value)?;
            }

            let job_id = rq.new_job(job, &task_frames)?;
            println!("Submitted job {} with {} task(s)", job_id, task_frames.len());
        }
        Commands::Jobs => print_jobs(&rq)?,
        Commands::Tasks { job } => print_tasks(&rq, &JobId(job))?,
        Commands::Progress { job } => {
            let job_id = JobId(job);
            let progress = rq.job_progress(&job_id)?;
            let total = progress
                .total_frames
                .map(|n| n.to_string())
                .unwrap_or_else(|| frames::UNKNOWN.to_string());
            println!("Status:    {}", progress.status);
            println!("Frames:    {} done, {} rendering, {} total", progress.completed_frames, progress.in_progress_frames, total);
            println!("Tasks:     {} rendering of {}", progress.tasks_rendering, progress.tasks_total);
            println!("Time:      {}", format_elapsed(progress.total_time));
        }
        Commands::Priority { job, priority } => {
            let job_id = JobId(job);
            rq.set_priority(&job_id, priority)?;
            println!("Job {} priority is now {}", job_id, rq.get_priority(&job_id)?);
        }
        Commands::DeleteJob { job, force } => {
            let job_id = JobId(job);
            let rendering: Vec<_> = rq
                .get_tasks(&job_id)?
                .into_iter()
                .filter(|record| record.status.is_working())
                .collect();
            if !rendering.is_empty() && !force {
                for record in &rendering {
                    eprintln!("Task {} is {}", record.task.id(), record.status);
                }
                bail!("{} task(s) of job {} are rendering; use --force to delete anyway", rendering.len(), job_id);
            }
            let report = rq.delete_job(&job_id)?;
            if !report.job_removed && report.tasks_removed.is_empty() {
                bail!("Job {} not found", job_id);
            }
            println!("Deleted job {} and {} task(s)", job_id, report.tasks_removed.len());
        }
        Commands::RequeueJob { job } => {
            let requeued = rq.requeue_job(&JobId(job))?;
            println!("Requeued {} task(s)", requeued.len());
        }
        Commands::Complete { job, task } => report(rq.complete_task(&JobId(job), task)?, "completed"),
        Commands::Fail { job, task } => report(rq.fail_task(&JobId(job), task)?, "failed"),
        Commands::Requeue { job, task } => report(rq.requeue_task(&JobId(job), task)?, "queued"),
        Commands::Next { fallthrough } => {
            let rq = if fallthrough { rq.with_policy(SelectionPolicy::Fallthrough) } else { rq };
            match rq.get_task_to_render()? {
                Some(task) => {
                    let job = rq.get_job(&task.job_id)?;
                    println!("{} (frames {}) from {}", task.id(), task.frames, job.name);
                }
                None => println!("Nothing to render"),
            }
        }
        Commands::Workers => print_workers(&rq)?,
        Commands::AddWorker { name, pool, comment, enabled } => {
            let mut worker = common::Worker::new(name);
            worker.pool = pool;
            worker.comment = comment;
            worker.username = current_username();
            if enabled {
                worker.status = WorkerStatus::Idle;
            }
            let worker = rq.new_worker(worker)?;
            println!("Registered worker {} as {}", worker.id, worker.name);
        }
        Commands::WorkerStatus { worker, status } => {
            if status == WorkerStatus::Rendering {
                bail!("Rendering is set by the worker itself");
            }
            let worker_id = find_worker(&rq, &worker)?;
            if rq.set_worker_status(&worker_id, status)? {
                println!("Worker {} is now {}", worker, status);
            } else {
                println!("Worker {} is already {}", worker, status);
            }
        }
        Commands::DeleteWorker { worker, requeue } => {
            let worker_id = find_worker(&rq, &worker)?;
            if requeue {
                let requeued = rq.requeue_worker_tasks(&worker_id)?;
                println!("Requeued {} task(s)", requeued.len());
            }
            let report = rq.delete_worker(&worker_id)?;
            for task in &report.orphaned {
                eprintln!("Warning: task {} was deleted with the worker", task);
            }
            println!("Deleted worker {}", worker);
        }
        Commands::RequeueWorker { worker } => {
            let worker_id = find_worker(&rq, &worker)?;
            let requeued = rq.requeue_worker_tasks(&worker_id)?;
            println!("Requeued {} task(s)", requeued.len());
        }
    }

    Ok(())
}

/// Normalize a frame range and split it into per-task frame ranges.
fn split_frames(range: &str, task_size: usize) -> Result<(String, Vec<String>)> {
    if frames::is_unknown(range) {
        return Ok((frames::UNKNOWN.to_string(), vec![frames::UNKNOWN.to_string()]));
    }
    let expanded = frames::expand(range)?;
    let tasks = frames::chunk(&expanded, task_size)
        .iter()
        .map(|chunk| frames::collapse(chunk))
        .collect();
    Ok((frames::collapse(&expanded), tasks))
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, _)) if Job::is_reserved_field(key.trim()) => {
            Err(format!("`{}` has its own option and cannot be passed with --set", key.trim()))
        }
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("invalid field `{}`, expected key=value", s)),
    }
}

/// Accept a worker id or its display name.
fn find_worker(rq: &RenderQueue, key: &str) -> Result<WorkerId> {
    let id = WorkerId(key.to_string());
    if rq.get_worker(&id).is_ok() {
        return Ok(id);
    }
    rq.get_workers()?
        .into_iter()
        .find(|view| view.worker.name == key)
        .map(|view| view.worker.id)
        .with_context(|| format!("No worker with id or name {:?}", key))
}

fn report(transition: Transition, state: &str) {
    match transition {
        Transition::Moved => println!("Task is now {}", state),
        Transition::Unchanged => println!("Task was already {}", state),
    }
}

fn current_username() -> String {
    nix::unistd::User::from_uid(nix::unistd::Uid::current())
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_default()
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

fn print_jobs(rq: &RenderQueue) -> Result<()> {
    let mut jobs = rq.get_jobs()?;
    jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.submit_time.cmp(&b.submit_time)));

    let mut table = new_table(vec!["ID", "Name", "Type", "Frames", "Priority", "Status", "Submitted", "User"]);
    for job in jobs {
        let status = match rq.job_progress(&job.id) {
            Ok(progress) => progress.status,
            Err(e) => format!("? ({})", e),
        };
        let priority = if job.is_paused() { "Paused".to_string() } else { job.priority.to_string() };
        table.add_row(vec![
            job.id.to_string(),
            job.name,
            job.job_type,
            job.frames,
            priority,
            status,
            job.submit_time,
            job.username,
        ]);
    }
    println!("{table}");
    Ok(())
}

fn print_tasks(rq: &RenderQueue, job_id: &JobId) -> Result<()> {
    let job = rq.get_job(job_id)?;
    println!("Job:       {} ({})", job.name, job.id);
    println!("Type:      {}", job.job_type);
    println!("Frames:    {}", job.frames);
    println!("Priority:  {}", job.priority);
    println!("Submitted: {} by {}", job.submit_time, job.username);
    if let Some(command) = job.field("command") {
        println!("Command:   {}", command);
    }
    if !job.comment.is_empty() {
        println!("Comment:   {}", job.comment);
    }

    let now = common::now_epoch();
    let mut table = new_table(vec!["Task", "Frames", "Status", "Started", "Elapsed"]);
    for record in rq.get_tasks(job_id)? {
        let started = record.task.start_time.map(format_epoch).unwrap_or_default();
        let elapsed = match record.task.start_time {
            Some(_) => format_elapsed(record.task.elapsed(now)),
            None => String::new(),
        };
        table.add_row(vec![
            format!("{:04}", record.task.task_no),
            record.task.frames.clone(),
            record.status.to_string(),
            started,
            elapsed,
        ]);
    }
    println!("{table}");
    Ok(())
}

fn print_workers(rq: &RenderQueue) -> Result<()> {
    let mut table = new_table(vec!["Name", "Status", "Host", "Pool", "User", "ID", "Comment"]);
    for view in rq.get_workers()? {
        table.add_row(vec![
            view.worker.name,
            view.display_status,
            view.worker.hostname,
            view.worker.pool,
            view.worker.username,
            view.worker.id.to_string(),
            view.worker.comment,
        ]);
    }
    println!("{table}");
    Ok(())
}

fn format_epoch(secs: f64) -> String {
    chrono::DateTime::from_timestamp(secs as i64, 0)
        .map(|dt| dt.with_timezone(&chrono::Local).format(common::SUBMIT_TIME_FORMAT).to_string())
        .unwrap_or_default()
}

fn format_elapsed(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, total % 3600 / 60, total % 60)
}
