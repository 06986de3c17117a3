//! The worker's polling loop: claim, render, settle, repeat.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use common::{ClaimOutcome, QueueError, RenderQueue, Task, Transition, Worker, WorkerId, WorkerStatus};
use rand::Rng;
use tokio::sync::watch;

use crate::config::Config;
use crate::executor::{Executor, Outcome, RenderRequest};
use crate::metrics::MetricsCollector;

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub poll_interval: Duration,
    pub poll_jitter: Duration,
    pub stop_after_task: bool,
    pub metrics_file: Option<PathBuf>,
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.worker.poll_interval_ms),
            poll_jitter: Duration::from_millis(config.worker.poll_jitter_ms),
            stop_after_task: config.worker.stop_after_task,
            metrics_file: config.metrics.file.clone(),
        }
    }
}

/// What a single poll did.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The worker is disabled or already busy.
    NotIdle,
    NoWork,
    /// The offered task was claimed by someone else.
    Contended,
    Rendered(Outcome),
}

/// Host facts recorded on the worker document at registration.
#[derive(Debug, Clone, Default)]
pub struct HostIdentity {
    pub hostname: String,
    pub username: String,
}

pub struct RenderWorker<E: Executor> {
    rq: RenderQueue,
    worker_id: WorkerId,
    executor: E,
    metrics: Arc<MetricsCollector>,
    settings: LoopSettings,
    shutdown: watch::Receiver<bool>,
}

impl<E: Executor> RenderWorker<E> {
    pub fn new(
        rq: RenderQueue,
        worker_id: WorkerId,
        executor: E,
        metrics: Arc<MetricsCollector>,
        settings: LoopSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            rq,
            worker_id,
            executor,
            metrics,
            settings,
            shutdown,
        }
    }

    /// Poll until shutdown is signalled, then leave the worker disabled.
    pub async fn run(&mut self) -> Result<()> {
        log::info!(
            "Worker {} polling {} every {:?}",
            self.worker_id,
            self.rq.root().display(),
            self.settings.poll_interval
        );

        while !*self.shutdown.borrow() {
            let wait = match self.poll_once().await {
                // Look for the next task straight away.
                Ok(PollOutcome::Rendered(_)) | Ok(PollOutcome::Contended) => None,
                Ok(PollOutcome::NotIdle) | Ok(PollOutcome::NoWork) => Some(self.next_delay()),
                Err(e) => {
                    let removed = matches!(e.downcast_ref::<QueueError>(), Some(QueueError::WorkerNotFound(_)));
                    if removed {
                        return Err(e.context("worker was removed from the queue"));
                    }
                    log::error!("Poll failed: {:#}", e);
                    Some(self.next_delay())
                }
            };

            if let Some(delay) = wait {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = self.shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        log::info!("Worker {} shutting down", self.worker_id);
        match self.rq.set_worker_status(&self.worker_id, WorkerStatus::Disabled) {
            Ok(_) | Err(QueueError::WorkerNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Claim and render at most one task.
    pub async fn poll_once(&mut self) -> Result<PollOutcome> {
        self.metrics.record_poll();

        if self.rq.get_worker_status(&self.worker_id)? != WorkerStatus::Idle {
            return Ok(PollOutcome::NotIdle);
        }
        let Some(candidate) = self.rq.get_task_to_render()? else {
            return Ok(PollOutcome::NoWork);
        };

        let task = match self.rq.dequeue_task(&candidate.job_id, candidate.task_no, &self.worker_id)? {
            ClaimOutcome::Claimed(task) => task,
            ClaimOutcome::Contended => {
                self.metrics.record_contention();
                return Ok(PollOutcome::Contended);
            }
        };
        self.metrics.record_claim(&task.job_id.0);
        self.rq.set_worker_status(&self.worker_id, WorkerStatus::Rendering)?;

        // Settle even when rendering failed, or the worker stays Rendering
        // and never claims again.
        let rendered = self.render(task).await;
        let settled = self.settle(matches!(rendered, Ok(Outcome::Interrupted)));
        let outcome = rendered?;
        settled?;

        match self.rq.get_jobs() {
            Ok(jobs) => {
                let live: HashSet<String> = jobs.into_iter().map(|job| job.id.0).collect();
                self.metrics.retain_jobs(|job_id| live.contains(job_id));
            }
            Err(e) => log::warn!("Failed to list jobs for metrics: {}", e),
        }
        if let Some(path) = &self.settings.metrics_file {
            if let Err(e) = self.metrics.write_to(path) {
                log::warn!("{:#}", e);
            }
        }
        Ok(PollOutcome::Rendered(outcome))
    }

    async fn render(&mut self, task: Task) -> Result<Outcome> {
        let id = task.id();
        let job = match self.rq.get_job(&task.job_id) {
            Ok(job) => job,
            Err(QueueError::JobNotFound(_)) => {
                log::error!("Task {} belongs to a job that no longer exists", id);
                self.finish(&task, self.rq.fail_task(&task.job_id, task.task_no))?;
                self.metrics.record_failure(&task.job_id.0);
                return Ok(Outcome::Failed("job no longer exists".into()));
            }
            Err(e) => {
                self.finish(&task, self.rq.requeue_task(&task.job_id, task.task_no))?;
                return Err(e).context("Failed to load job for claimed task");
            }
        };

        let request = RenderRequest {
            log_path: self.rq.task_log_path(&id),
            database: self.rq.root().to_path_buf(),
            job,
            task: task.clone(),
        };
        let outcome = match self.executor.execute(request, self.shutdown.clone()).await {
            Ok(report) => {
                log::info!("Task {} ran for {:.1}s: {:?}", id, report.elapsed.as_secs_f64(), report.outcome);
                if report.outcome == Outcome::Completed {
                    self.metrics
                        .record_completion(&task.job_id.0, report.elapsed.as_millis() as u64);
                }
                report.outcome
            }
            Err(e) => {
                log::error!("Executor failed on task {}: {:#}", id, e);
                Outcome::Failed(e.to_string())
            }
        };

        if !self.rq.worker_tasks(&self.worker_id)?.contains(&id) {
            log::warn!("Task {} was taken from this worker while rendering, dropping its result", id);
            return Ok(outcome);
        }

        let transition = match &outcome {
            Outcome::Completed => self.rq.complete_task(&task.job_id, task.task_no),
            Outcome::Failed(reason) => {
                log::warn!("Task {} failed: {}", id, reason);
                self.metrics.record_failure(&task.job_id.0);
                self.rq.fail_task(&task.job_id, task.task_no)
            }
            Outcome::Interrupted => {
                self.metrics.record_interruption(&task.job_id.0);
                self.rq.requeue_task(&task.job_id, task.task_no)
            }
        };
        if let Err(e) = self.finish(&task, transition) {
            if outcome != Outcome::Interrupted {
                self.release(&task);
            }
            return Err(e);
        }
        Ok(outcome)
    }

    /// Return a task whose result could not be recorded to the queue.
    fn release(&self, task: &Task) {
        // The transition may have moved it before failing; leave it there.
        match self.rq.worker_tasks(&self.worker_id) {
            Ok(held) if held.contains(&task.id()) => {}
            _ => return,
        }
        match self.rq.requeue_task(&task.job_id, task.task_no) {
            Ok(_) => log::warn!("Requeued task {} after its result could not be recorded", task.id()),
            Err(e) => log::error!("Task {} is stuck on worker {}: {}", task.id(), self.worker_id, e),
        }
    }

    /// Tolerate a task that was deleted out from under the render.
    fn finish(&self, task: &Task, result: common::Result<Transition>) -> Result<()> {
        match result {
            Ok(_) => Ok(()),
            Err(QueueError::TaskNotFound(_)) => {
                log::warn!("Task {} disappeared while rendering", task.id());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Back to Idle, unless the task was interrupted, the worker is set to
    /// stop after one task, or someone disabled it mid-render.
    fn settle(&self, interrupted: bool) -> Result<()> {
        let current = self.rq.get_worker_status(&self.worker_id)?;
        let next = if interrupted
            || self.settings.stop_after_task
            || current == WorkerStatus::Disabled
        {
            WorkerStatus::Disabled
        } else {
            WorkerStatus::Idle
        };
        self.rq.set_worker_status(&self.worker_id, next)?;
        Ok(())
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.settings.poll_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.settings.poll_interval + Duration::from_millis(jitter)
    }
}

/// Find this host's registered worker, or register a new one.
///
/// The worker id is kept in `state_file` so a restarted daemon keeps its
/// identity and can recover tasks a previous run left behind.
pub fn resolve_worker(rq: &RenderQueue, config: &Config, host: &HostIdentity, state_file: &Path) -> Result<Worker> {
    let start_status = if config.worker.start_enabled {
        WorkerStatus::Idle
    } else {
        WorkerStatus::Disabled
    };

    if let Ok(saved) = std::fs::read_to_string(state_file) {
        let id = WorkerId(saved.trim().to_string());
        match rq.get_worker(&id) {
            Ok(mut worker) => {
                log::info!("Resuming as worker {} ({})", worker.id, worker.name);
                if config.worker.recover_on_start {
                    for task in rq.requeue_worker_tasks(&worker.id)? {
                        log::warn!("Recovered task {} left behind by a previous run", task);
                    }
                }
                rq.set_worker_status(&worker.id, start_status)?;
                worker.status = start_status;
                return Ok(worker);
            }
            Err(QueueError::WorkerNotFound(_)) => {
                log::warn!("Saved worker {} is no longer registered, registering again", id);
            }
            Err(e) => return Err(e.into()),
        }
    }

    let mut worker = Worker::new(config.worker.name.clone().unwrap_or_else(|| host.hostname.clone()));
    worker.hostname = host.hostname.clone();
    worker.username = host.username.clone();
    worker.ip_address = config.worker.ip_address.clone().unwrap_or_default();
    worker.pool = config.worker.pool.clone();
    worker.comment = config.worker.comment.clone();
    worker.status = start_status;
    let worker = rq.new_worker(worker)?;

    if let Some(parent) = state_file.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
    }
    std::fs::write(state_file, &worker.id.0)
        .with_context(|| format!("Failed to save worker id to {:?}", state_file))?;
    Ok(worker)
}
