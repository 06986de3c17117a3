//! Task selection and the task state transitions.
//!
//! Every transition is one atomic move of the task document. Timestamps are
//! stamped only after the document has arrived at its destination, so a
//! failed or interrupted transition never leaves a modified copy behind in
//! the old location.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::db::{Location, RenderQueue};
use crate::error::{QueueError, Result};
use crate::job::{Job, JobId, Task, TaskId, WorkerId};

/// How many times a transition re-locates a task that moved underneath it.
const LOCATE_ATTEMPTS: usize = 3;

/// What to do when the highest ranked job has nothing queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionPolicy {
    /// Offer nothing; lower priority jobs wait until the top job is
    /// requeued, paused or deleted.
    #[default]
    Strict,
    /// Fall through to the next ranked job.
    Fallthrough,
}

impl std::str::FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Ok(SelectionPolicy::Strict),
            "fallthrough" => Ok(SelectionPolicy::Fallthrough),
            other => Err(format!("invalid selection policy: {other} (expected \"strict\" or \"fallthrough\")")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The task is now inside the worker's subtree.
    Claimed(Task),
    /// Someone else got there first.
    Contended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Moved,
    /// The task was already in the requested state.
    Unchanged,
}

/// Drop paused jobs and order the rest by priority (highest first), then by
/// submit time (earliest first).
pub fn rank_jobs(mut jobs: Vec<Job>) -> Vec<Job> {
    jobs.retain(|job| !job.is_paused());
    jobs.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.submit_time.cmp(&b.submit_time))
    });
    jobs
}

impl RenderQueue {
    /// The next task a worker should claim, if any.
    ///
    /// Only the best ranked job is considered under `SelectionPolicy::Strict`.
    pub fn get_task_to_render(&self) -> Result<Option<Task>> {
        for job in rank_jobs(self.get_jobs()?) {
            if let Some(task) = self.get_queued_tasks(&job.id)?.into_iter().next() {
                return Ok(Some(task));
            }
            if self.policy == SelectionPolicy::Strict {
                log::debug!(
                    "Job {} (priority {}) has no queued tasks; holding lower priority jobs",
                    job.id,
                    job.priority
                );
                return Ok(None);
            }
        }
        Ok(None)
    }

    /// Claim a queued task for a worker by moving it into the worker's
    /// subtree.
    pub fn dequeue_task(&self, job_id: &JobId, task_no: u32, worker_id: &WorkerId) -> Result<ClaimOutcome> {
        let id = TaskId::new(job_id, task_no);
        let worker_dir = self.worker_dir(worker_id);
        if !worker_dir.is_dir() {
            return Err(QueueError::WorkerNotFound(worker_id.to_string()));
        }

        let source = self.store.queued_dir().join(id.file_name());
        let dest = match self.store.move_into(&source, &worker_dir) {
            Ok(dest) => dest,
            Err(QueueError::NotFound(path)) if path == source => {
                log::warn!("Worker {} failed to dequeue task {}: no longer queued", worker_id, id);
                return Ok(ClaimOutcome::Contended);
            }
            Err(e) => return Err(e),
        };

        // An admin may requeue the task between the move and the stamp, so
        // only touch the document while it is still in the worker's subtree.
        let mut claimed: Option<Task> = None;
        let stamped = self.store.update::<Task, _>(&dest, |task| {
            task.start_time = Some(crate::now_epoch());
            task.end_time = None;
            claimed = Some(task.clone());
            true
        });
        match stamped {
            Ok(true) => {}
            Ok(false) => {
                log::warn!("Task {} was taken back from worker {} before it started", id, worker_id);
                return Ok(ClaimOutcome::Contended);
            }
            Err(e) => {
                self.release_claim(&id, &dest, &e);
                return Err(e);
            }
        }
        let Some(task) = claimed else {
            return Ok(ClaimOutcome::Contended);
        };

        log::info!("Worker {} dequeued task {}", worker_id, id);
        Ok(ClaimOutcome::Claimed(task))
    }

    /// Give up a claim that could not be stamped. An unreadable document
    /// goes to failed so it is not offered again; anything else is requeued.
    fn release_claim(&self, id: &TaskId, claimed: &std::path::Path, error: &QueueError) {
        let dest_dir = match error {
            QueueError::Parse { .. } => self.store.failed_dir(),
            _ => self.store.queued_dir(),
        };
        match self.store.move_into(claimed, &dest_dir) {
            Ok(_) => log::error!("Released task {} after a failed claim: {}", id, error),
            Err(e) => log::error!("Task {} is stuck at {:?}: {}", id, claimed, e),
        }
    }

    pub fn complete_task(&self, job_id: &JobId, task_no: u32) -> Result<Transition> {
        let outcome = self.transition(&TaskId::new(job_id, task_no), Location::Completed)?;
        if outcome == Transition::Moved {
            log::info!("Completed task {}", TaskId::new(job_id, task_no));
        }
        Ok(outcome)
    }

    pub fn fail_task(&self, job_id: &JobId, task_no: u32) -> Result<Transition> {
        let outcome = self.transition(&TaskId::new(job_id, task_no), Location::Failed)?;
        if outcome == Transition::Moved {
            log::info!("Failed task {}", TaskId::new(job_id, task_no));
        }
        Ok(outcome)
    }

    /// Put a task back in the queue from wherever it is, clearing its timings.
    pub fn requeue_task(&self, job_id: &JobId, task_no: u32) -> Result<Transition> {
        let outcome = self.transition(&TaskId::new(job_id, task_no), Location::Queued)?;
        if outcome == Transition::Moved {
            log::info!("Requeued task {}", TaskId::new(job_id, task_no));
        }
        Ok(outcome)
    }

    /// Find the single location currently holding a task document.
    pub(crate) fn locate_task(&self, id: &TaskId) -> Result<Option<(Location, PathBuf)>> {
        let file_name = id.file_name();
        for (location, dir) in self.task_dirs()? {
            let path = dir.join(&file_name);
            if path.is_file() {
                return Ok(Some((location, path)));
            }
        }
        Ok(None)
    }

    fn transition(&self, id: &TaskId, target: Location) -> Result<Transition> {
        for _ in 0..LOCATE_ATTEMPTS {
            let Some((location, path)) = self.locate_task(id)? else {
                continue;
            };
            if location == target {
                return Ok(Transition::Unchanged);
            }

            match self.store.move_into(&path, &self.location_dir(&target)) {
                Ok(dest) => {
                    self.stamp(id, &dest, &target)?;
                    return Ok(Transition::Moved);
                }
                // Moved by another actor between locating and moving.
                Err(QueueError::NotFound(missing)) if missing == path => continue,
                Err(e) => return Err(e),
            }
        }
        Err(QueueError::TaskNotFound(id.to_string()))
    }

    fn stamp(&self, id: &TaskId, path: &std::path::Path, target: &Location) -> Result<()> {
        let present = self.store.update::<Task, _>(path, |task| match target {
            Location::Queued => {
                let dirty = task.start_time.is_some() || task.end_time.is_some();
                task.start_time = None;
                task.end_time = None;
                dirty
            }
            Location::Completed | Location::Failed => {
                if task.end_time.is_some() {
                    return false;
                }
                task.end_time = Some(crate::now_epoch());
                true
            }
            Location::Worker(_) => false,
        })?;
        if !present {
            log::debug!("Task {} moved on before its timings were updated", id);
        }
        Ok(())
    }
}
