//! Typed access to jobs and tasks stored in the shared database tree.
//!
//! Values returned here are snapshots. Nothing is cached: every call goes back
//! to the tree, which is the only authority on state.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use crate::error::{QueueError, Result};
use crate::frames;
use crate::job::{Job, JobId, JobProgress, Task, TaskId, TaskRecord, TaskStatus, WorkerId};
use crate::scheduler::{SelectionPolicy, Transition};
use crate::store::Store;

/// Where a task document currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Location {
    Queued,
    Worker(WorkerId),
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteJobReport {
    pub job_removed: bool,
    pub tasks_removed: Vec<TaskId>,
    /// Tasks that were claimed by a worker at the time of deletion.
    pub in_flight: Vec<(TaskId, WorkerId)>,
}

#[derive(Debug, Clone)]
pub struct RenderQueue {
    pub(crate) store: Store,
    pub(crate) policy: SelectionPolicy,
}

impl RenderQueue {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Store::open(root)?;
        log::debug!("Connected to render queue database at {}", store.root().display());
        Ok(Self {
            store,
            policy: SelectionPolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    pub fn root(&self) -> &Path {
        self.store.root()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn job_datafile(&self, job_id: &JobId) -> PathBuf {
        self.store.jobs_dir().join(format!("{}.json", job_id))
    }

    /// Path of the captured render output for a task.
    pub fn task_log_path(&self, task_id: &TaskId) -> PathBuf {
        self.store.logs_dir().join(format!("{}.log", task_id))
    }

    ////////
    // JOBS
    ////////

    /// Create a job and one queued task per entry of `task_frames`.
    pub fn new_job(&self, mut job: Job, task_frames: &[String]) -> Result<JobId> {
        job.id = JobId::generate();
        if job.submit_time.is_empty() {
            job.submit_time = crate::submit_timestamp();
        }
        job.priority = job.priority.min(100);

        self.store.write(&job, &self.job_datafile(&job.id))?;

        let queued = self.store.queued_dir();
        for (task_no, frames) in task_frames.iter().enumerate() {
            let task = Task::new(&job.id, task_no as u32, frames.clone());
            self.store.write(&task, &queued.join(task.id().file_name()))?;
        }

        log::info!("Created job {} ({})", job.id, job.name);
        log::info!("Created {} task(s) for job {}", task_frames.len(), job.id);
        Ok(job.id)
    }

    pub fn get_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for path in self.store.list_documents(&self.store.jobs_dir())? {
            if let Some(job) = self.read_listed::<Job>(&path)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    pub fn get_job(&self, job_id: &JobId) -> Result<Job> {
        self.store
            .read(&self.job_datafile(job_id))
            .map_err(|e| match e {
                QueueError::NotFound(_) => QueueError::JobNotFound(job_id.to_string()),
                e => e,
            })
    }

    /// All tasks of a job wherever they are, ordered by task number, each
    /// annotated with the status implied by its location.
    pub fn get_tasks(&self, job_id: &JobId) -> Result<Vec<TaskRecord>> {
        let mut found: BTreeMap<u32, TaskRecord> = BTreeMap::new();
        let mut worker_names: HashMap<WorkerId, String> = HashMap::new();

        for (location, dir) in self.task_dirs()? {
            for (id, path) in self.task_documents(&dir)? {
                if id.job_id != *job_id {
                    continue;
                }
                let Some(task) = self.read_listed::<Task>(&path)? else {
                    continue;
                };
                let status = match &location {
                    Location::Queued => TaskStatus::Queued,
                    Location::Completed => TaskStatus::Completed,
                    Location::Failed => TaskStatus::Failed,
                    Location::Worker(worker_id) => {
                        let worker_name = worker_names
                            .entry(worker_id.clone())
                            .or_insert_with(|| self.worker_display_name(worker_id))
                            .clone();
                        TaskStatus::Working {
                            worker_id: worker_id.clone(),
                            worker_name,
                        }
                    }
                };
                // A task that moved forward during the scan is seen twice;
                // the later location wins.
                found.insert(id.task_no, TaskRecord { task, status });
            }
        }

        Ok(found.into_values().collect())
    }

    /// Queued tasks of a job, lowest task number first.
    pub fn get_queued_tasks(&self, job_id: &JobId) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for (id, path) in self.task_documents(&self.store.queued_dir())? {
            if id.job_id != *job_id {
                continue;
            }
            if let Some(task) = self.read_listed::<Task>(&path)? {
                tasks.push(task);
            }
        }
        tasks.sort_by_key(|t| t.task_no);
        Ok(tasks)
    }

    pub fn get_priority(&self, job_id: &JobId) -> Result<u8> {
        Ok(self.get_job(job_id)?.priority)
    }

    /// Set a job's priority, clamped to 0..=100. Returns whether the document
    /// was rewritten; an unchanged value is not written.
    pub fn set_priority(&self, job_id: &JobId, priority: i64) -> Result<bool> {
        let priority = priority.clamp(0, 100) as u8;
        let mut changed = false;

        let present = self.store.update::<Job, _>(&self.job_datafile(job_id), |job| {
            if job.priority == priority {
                return false;
            }
            job.priority = priority;
            changed = true;
            true
        })?;
        if !present {
            return Err(QueueError::JobNotFound(job_id.to_string()));
        }

        if changed {
            log::info!("Set priority of job {} to {}", job_id, priority);
        }
        Ok(changed)
    }

    /// Delete a job document and every task document of the job.
    ///
    /// Tasks claimed by a worker are deleted too; they are listed in the
    /// report so callers can tell the user which renders were cut off.
    pub fn delete_job(&self, job_id: &JobId) -> Result<DeleteJobReport> {
        let mut report = DeleteJobReport {
            job_removed: self.store.remove(&self.job_datafile(job_id))?,
            ..Default::default()
        };

        for (location, dir) in self.task_dirs()? {
            for (id, path) in self.task_documents(&dir)? {
                if id.job_id != *job_id {
                    continue;
                }
                if let Location::Worker(worker_id) = &location {
                    log::warn!(
                        "Task {} is currently rendering on worker {} and cannot be deleted safely",
                        id,
                        worker_id
                    );
                    report.in_flight.push((id.clone(), worker_id.clone()));
                }
                if self.store.remove(&path)? {
                    report.tasks_removed.push(id);
                }
            }
        }

        log::info!("Deleted job {}", job_id);
        Ok(report)
    }

    /// Move every task of the job that is not queued back into the queue.
    pub fn requeue_job(&self, job_id: &JobId) -> Result<Vec<TaskId>> {
        let mut requeued = Vec::new();
        for (location, dir) in self.task_dirs()? {
            if location == Location::Queued {
                continue;
            }
            for (id, _) in self.task_documents(&dir)? {
                if id.job_id != *job_id {
                    continue;
                }
                match self.requeue_task(&id.job_id, id.task_no) {
                    Ok(Transition::Moved) => requeued.push(id),
                    Ok(Transition::Unchanged) => {}
                    // Deleted underneath us.
                    Err(QueueError::TaskNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        log::info!("Requeued {} task(s) of job {}", requeued.len(), job_id);
        Ok(requeued)
    }

    /// Progress of a job in frames (or in tasks when the range is unknown).
    pub fn job_progress(&self, job_id: &JobId) -> Result<JobProgress> {
        let job = self.get_job(job_id)?;
        let tasks = self.get_tasks(job_id)?;
        let now = crate::now_epoch();

        let total_frames = frames::frame_count(&job.frames);
        let mut completed_frames = 0;
        let mut in_progress_frames = 0;
        let mut completed_tasks = 0;
        let mut tasks_rendering = 0;
        let mut total_time = 0.0;

        for record in &tasks {
            total_time += record.task.elapsed(now);
            let count = frames::frame_count(&record.task.frames).unwrap_or(0);
            match record.status {
                TaskStatus::Working { .. } => {
                    tasks_rendering += 1;
                    in_progress_frames += count;
                }
                TaskStatus::Completed => {
                    completed_tasks += 1;
                    completed_frames += count;
                }
                _ => {}
            }
        }

        let (done, active, total) = match total_frames {
            Some(total) => (completed_frames, in_progress_frames, total),
            None => (completed_tasks, tasks_rendering, tasks.len()),
        };
        let (status, percent) = progress_status(done, active, total);

        Ok(JobProgress {
            status,
            percent,
            completed_frames,
            in_progress_frames,
            total_frames,
            tasks_rendering,
            tasks_total: tasks.len(),
            total_time,
        })
    }

    ///////////
    // HELPERS
    ///////////

    pub(crate) fn location_dir(&self, location: &Location) -> PathBuf {
        match location {
            Location::Queued => self.store.queued_dir(),
            Location::Worker(worker_id) => self.worker_dir(worker_id),
            Location::Completed => self.store.completed_dir(),
            Location::Failed => self.store.failed_dir(),
        }
    }

    /// Every directory a task document can live in, in the order tasks move
    /// through them.
    pub(crate) fn task_dirs(&self) -> Result<Vec<(Location, PathBuf)>> {
        let mut dirs = vec![(Location::Queued, self.store.queued_dir())];
        for dir in self.store.list_dirs(&self.store.workers_dir())? {
            if let Some(name) = dir.file_name().and_then(|n| n.to_str()) {
                dirs.push((Location::Worker(WorkerId(name.to_string())), dir.clone()));
            }
        }
        dirs.push((Location::Completed, self.store.completed_dir()));
        dirs.push((Location::Failed, self.store.failed_dir()));
        Ok(dirs)
    }

    /// Task documents in a directory, keyed by the id encoded in the name.
    pub(crate) fn task_documents(&self, dir: &Path) -> Result<Vec<(TaskId, PathBuf)>> {
        Ok(self
            .store
            .list_documents(dir)?
            .into_iter()
            .filter_map(|path| {
                let id = TaskId::parse(path.file_name()?.to_str()?)?;
                Some((id, path))
            })
            .collect())
    }

    /// Read a document found by a directory listing. Vanished documents are
    /// skipped, corrupt ones are skipped with a warning.
    pub(crate) fn read_listed<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match self.store.read(path) {
            Ok(value) => Ok(Some(value)),
            Err(QueueError::NotFound(_)) => Ok(None),
            Err(QueueError::Parse { path, source }) => {
                log::warn!("Skipping unreadable document {}: {}", path.display(), source);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

fn progress_status(done: usize, active: usize, total: usize) -> (String, u32) {
    if done == 0 {
        if active == 0 {
            ("Queued".to_string(), 0)
        } else {
            ("[0%] Working".to_string(), 0)
        }
    } else if done >= total {
        ("Done".to_string(), 100)
    } else {
        let percent = (done * 100 / total) as u32;
        if active == 0 {
            (format!("[{}%] Waiting", percent), percent)
        } else {
            (format!("[{}%] Working", percent), percent)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Worker;
    use tempfile::TempDir;

    fn queue() -> (TempDir, RenderQueue) {
        let tmp = TempDir::new().unwrap();
        let rq = RenderQueue::open(tmp.path()).unwrap();
        (tmp, rq)
    }

    fn frames(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_new_job_writes_job_and_queued_tasks() {
        let (_tmp, rq) = queue();
        let job_id = rq
            .new_job(Job::new("shot010", "Maya", "1-30"), &frames(&["1-10", "11-20", "21-30"]))
            .unwrap();

        assert_eq!(job_id.0.len(), 32);
        let job = rq.get_job(&job_id).unwrap();
        assert_eq!(job.name, "shot010");
        assert!(!job.submit_time.is_empty());

        let queued = rq.get_queued_tasks(&job_id).unwrap();
        assert_eq!(queued.iter().map(|t| t.task_no).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(rq
            .store()
            .queued_dir()
            .join(format!("{}_0002.json", job_id))
            .is_file());
    }

    #[test]
    fn test_get_job_missing() {
        let (_tmp, rq) = queue();
        match rq.get_job(&JobId("nope".into())) {
            Err(QueueError::JobNotFound(id)) => assert_eq!(id, "nope"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_get_tasks_derives_status_from_location() {
        let (_tmp, rq) = queue();
        let job_id = rq.new_job(Job::new("a", "Nuke", "1-3"), &frames(&["1", "2", "3"])).unwrap();
        let worker = rq.new_worker(Worker::new("render01")).unwrap();

        rq.dequeue_task(&job_id, 0, &worker.id).unwrap();
        rq.dequeue_task(&job_id, 1, &worker.id).unwrap();
        rq.complete_task(&job_id, 1).unwrap();

        let tasks = rq.get_tasks(&job_id).unwrap();
        let statuses: Vec<String> = tasks.iter().map(|t| t.status.to_string()).collect();
        assert_eq!(statuses, vec!["Rendering on render01", "Done", "Queued"]);
    }

    #[test]
    fn test_set_priority_clamps_and_skips_unchanged() {
        let (_tmp, rq) = queue();
        let job_id = rq.new_job(Job::new("a", "Maya", "1"), &frames(&["1"])).unwrap();

        assert!(rq.set_priority(&job_id, 250).unwrap());
        assert_eq!(rq.get_priority(&job_id).unwrap(), 100);
        assert!(!rq.set_priority(&job_id, 100).unwrap());
        assert!(rq.set_priority(&job_id, -4).unwrap());
        assert_eq!(rq.get_priority(&job_id).unwrap(), 0);

        assert!(rq.set_priority(&JobId("missing".into()), 10).is_err());
    }

    #[test]
    fn test_delete_job_removes_tasks_everywhere() {
        let (_tmp, rq) = queue();
        let job_id = rq.new_job(Job::new("a", "Maya", "1-3"), &frames(&["1", "2", "3"])).unwrap();
        let other = rq.new_job(Job::new("b", "Maya", "1"), &frames(&["1"])).unwrap();
        let worker = rq.new_worker(Worker::new("render01")).unwrap();

        rq.dequeue_task(&job_id, 1, &worker.id).unwrap();
        rq.dequeue_task(&job_id, 2, &worker.id).unwrap();
        rq.fail_task(&job_id, 2).unwrap();

        let report = rq.delete_job(&job_id).unwrap();
        assert!(report.job_removed);
        assert_eq!(report.tasks_removed.len(), 3);
        assert_eq!(report.in_flight, vec![(TaskId::new(&job_id, 1), worker.id.clone())]);

        assert!(rq.get_tasks(&job_id).unwrap().is_empty());
        assert!(rq.get_job(&job_id).is_err());
        assert_eq!(rq.get_tasks(&other).unwrap().len(), 1);
    }

    #[test]
    fn test_requeue_job_resets_every_task() {
        let (_tmp, rq) = queue();
        let job_id = rq.new_job(Job::new("a", "Maya", "1-3"), &frames(&["1", "2", "3"])).unwrap();
        let worker = rq.new_worker(Worker::new("render01")).unwrap();

        rq.dequeue_task(&job_id, 0, &worker.id).unwrap();
        rq.complete_task(&job_id, 0).unwrap();
        rq.dequeue_task(&job_id, 1, &worker.id).unwrap();
        rq.fail_task(&job_id, 1).unwrap();
        rq.dequeue_task(&job_id, 2, &worker.id).unwrap();

        let requeued = rq.requeue_job(&job_id).unwrap();
        assert_eq!(requeued.len(), 3);

        let queued = rq.get_queued_tasks(&job_id).unwrap();
        assert_eq!(queued.len(), 3);
        assert!(queued.iter().all(|t| t.start_time.is_none() && t.end_time.is_none()));
    }

    #[test]
    fn test_job_progress() {
        let (_tmp, rq) = queue();
        let job_id = rq
            .new_job(Job::new("a", "Maya", "1-40"), &frames(&["1-10", "11-20", "21-30", "31-40"]))
            .unwrap();
        let worker = rq.new_worker(Worker::new("render01")).unwrap();

        assert_eq!(rq.job_progress(&job_id).unwrap().status, "Queued");

        rq.dequeue_task(&job_id, 0, &worker.id).unwrap();
        assert_eq!(rq.job_progress(&job_id).unwrap().status, "[0%] Working");

        rq.complete_task(&job_id, 0).unwrap();
        let progress = rq.job_progress(&job_id).unwrap();
        assert_eq!(progress.status, "[25%] Waiting");
        assert_eq!(progress.completed_frames, 10);

        rq.dequeue_task(&job_id, 1, &worker.id).unwrap();
        assert_eq!(rq.job_progress(&job_id).unwrap().status, "[25%] Working");

        for task_no in 1..4 {
            rq.complete_task(&job_id, task_no).unwrap();
        }
        // Tasks 2 and 3 were never claimed; completing them straight from the
        // queue is allowed.
        let progress = rq.job_progress(&job_id).unwrap();
        assert_eq!(progress.status, "Done");
        assert_eq!(progress.percent, 100);
    }

    #[test]
    fn test_corrupt_job_is_skipped_in_listing() {
        let (_tmp, rq) = queue();
        rq.new_job(Job::new("good", "Maya", "1"), &frames(&["1"])).unwrap();
        std::fs::write(rq.store().jobs_dir().join("bad.json"), "{").unwrap();

        let jobs = rq.get_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "good");
    }
}
