//! Worker registry: one subdirectory per worker holding its info document
//! and whatever task it has claimed.

use std::collections::HashSet;
use std::path::PathBuf;

use crate::db::RenderQueue;
use crate::error::{QueueError, Result};
use crate::job::{Task, TaskId, Worker, WorkerId, WorkerStatus, WorkerView};

/// Stands in for one level of `" (N)"` suffix while names are compared.
const MARK: char = '\0';

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteWorkerReport {
    pub removed: bool,
    /// Tasks that were claimed by the worker and went with its subtree.
    pub orphaned: Vec<TaskId>,
}

impl RenderQueue {
    pub fn worker_dir(&self, worker_id: &WorkerId) -> PathBuf {
        self.store.workers_dir().join(&worker_id.0)
    }

    pub fn worker_datafile(&self, worker_id: &WorkerId) -> PathBuf {
        self.worker_dir(worker_id).join(crate::WORKER_INFO_FILE)
    }

    fn names_dir(&self) -> PathBuf {
        self.store.workers_dir().join(crate::NAMES_DIR)
    }

    fn name_marker(&self, name: &str) -> PathBuf {
        let encoded: String = name.bytes().map(|b| format!("{:02x}", b)).collect();
        self.names_dir().join(encoded)
    }

    /// Register a worker under a fresh id, disambiguating its display name
    /// against every registered worker.
    pub fn new_worker(&self, mut worker: Worker) -> Result<Worker> {
        worker.id = WorkerId::generate();
        self.store.create_dir(&self.names_dir())?;

        let requested = worker.name.clone();
        let mut taken = self.get_worker_names()?;
        loop {
            let name = disambiguate(&requested, &taken);
            if self.store.create_exclusive(&self.name_marker(&name), &worker.id.0)? {
                worker.name = name;
                break;
            }
            log::debug!("Worker name {:?} was reserved concurrently, trying the next suffix", name);
            taken.push(name);
        }

        self.store.create_dir(&self.worker_dir(&worker.id))?;
        self.store.write(&worker, &self.worker_datafile(&worker.id))?;

        log::info!("Created worker {} ({})", worker.id, worker.name);
        Ok(worker)
    }

    pub fn get_worker(&self, worker_id: &WorkerId) -> Result<Worker> {
        self.store
            .read(&self.worker_datafile(worker_id))
            .map_err(|e| match e {
                QueueError::NotFound(_) => QueueError::WorkerNotFound(worker_id.to_string()),
                e => e,
            })
    }

    /// Every registered worker with the task it currently holds, if any.
    pub fn get_workers(&self) -> Result<Vec<WorkerView>> {
        let mut views = Vec::new();
        for dir in self.store.list_dirs(&self.store.workers_dir())? {
            let Some(worker) = self.read_listed::<Worker>(&dir.join(crate::WORKER_INFO_FILE))? else {
                continue;
            };

            let mut current_task = None;
            let mut display_status = worker.status.to_string();
            for (id, path) in self.task_documents(&dir)? {
                let Some(task) = self.read_listed::<Task>(&path)? else {
                    continue;
                };
                match self.get_job(&id.job_id) {
                    Ok(job) => {
                        display_status = format!("Rendering frame(s) {} from {}", task.frames, job.name);
                    }
                    Err(QueueError::JobNotFound(_)) => {
                        log::warn!("Worker {} holds task {} of a missing job", worker.id, id);
                    }
                    Err(e) => return Err(e),
                }
                current_task = Some(id);
                break;
            }

            views.push(WorkerView {
                worker,
                current_task,
                display_status,
            });
        }
        Ok(views)
    }

    pub fn get_worker_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for dir in self.store.list_dirs(&self.store.workers_dir())? {
            if let Some(worker) = self.read_listed::<Worker>(&dir.join(crate::WORKER_INFO_FILE))? {
                names.push(worker.name);
            }
        }
        Ok(names)
    }

    pub fn get_worker_status(&self, worker_id: &WorkerId) -> Result<WorkerStatus> {
        Ok(self.get_worker(worker_id)?.status)
    }

    /// Returns whether the stored status changed.
    pub fn set_worker_status(&self, worker_id: &WorkerId, status: WorkerStatus) -> Result<bool> {
        let mut changed = false;
        let present = self.store.update::<Worker, _>(&self.worker_datafile(worker_id), |worker| {
            if worker.status == status {
                return false;
            }
            worker.status = status;
            changed = true;
            true
        })?;
        if !present {
            return Err(QueueError::WorkerNotFound(worker_id.to_string()));
        }
        if changed {
            log::info!("Worker {} is now {}", worker_id, status);
        }
        Ok(changed)
    }

    /// Tasks currently claimed by a worker.
    pub fn worker_tasks(&self, worker_id: &WorkerId) -> Result<Vec<TaskId>> {
        let dir = self.worker_dir(worker_id);
        if !dir.is_dir() {
            return Err(QueueError::WorkerNotFound(worker_id.to_string()));
        }
        Ok(self.task_documents(&dir)?.into_iter().map(|(id, _)| id).collect())
    }

    /// Remove a worker's whole subtree, claimed tasks included.
    ///
    /// Claimed tasks are not released; call `requeue_worker_tasks` first to
    /// keep them.
    pub fn delete_worker(&self, worker_id: &WorkerId) -> Result<DeleteWorkerReport> {
        let dir = self.worker_dir(worker_id);
        if !dir.is_dir() {
            return Ok(DeleteWorkerReport::default());
        }

        let orphaned = self.worker_tasks(worker_id)?;
        for id in &orphaned {
            log::warn!("Deleting worker {} discards claimed task {}", worker_id, id);
        }
        let name = self.get_worker(worker_id).ok().map(|w| w.name);

        let removed = self.store.remove(&dir)?;
        if let Some(name) = name {
            self.release_name(&name, worker_id)?;
        }

        log::info!("Deleted worker {}", worker_id);
        Ok(DeleteWorkerReport { removed, orphaned })
    }

    /// Put every task parked under a worker back in the queue.
    pub fn requeue_worker_tasks(&self, worker_id: &WorkerId) -> Result<Vec<TaskId>> {
        let mut requeued = Vec::new();
        for id in self.worker_tasks(worker_id)? {
            match self.requeue_task(&id.job_id, id.task_no) {
                Ok(_) => requeued.push(id),
                Err(QueueError::TaskNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(requeued)
    }

    /// Display name for a worker id, falling back to the id itself.
    pub(crate) fn worker_display_name(&self, worker_id: &WorkerId) -> String {
        match self.get_worker(worker_id) {
            Ok(worker) => worker.name,
            Err(_) => worker_id.to_string(),
        }
    }

    fn release_name(&self, name: &str, worker_id: &WorkerId) -> Result<()> {
        let marker = self.name_marker(name);
        match std::fs::read_to_string(&marker) {
            Ok(owner) if owner == worker_id.0 => {
                self.store.remove(&marker)?;
            }
            Ok(_) => log::debug!("Name {:?} is reserved by another worker", name),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(QueueError::io(&marker)(e)),
        }
        Ok(())
    }
}

/// Pick a display name for `requested` that collides with none of
/// `existing`, appending `" (N)"` with the smallest free N.
///
/// Names are compared with their numeric suffix expanded into N marks, so
/// `"a (2)"` blocks exactly the slot `"a"` would take after two collisions.
pub fn disambiguate(requested: &str, existing: &[String]) -> String {
    let taken: HashSet<String> = existing.iter().map(|n| to_marks(n)).collect();
    let mut candidate = to_marks(requested);
    while taken.contains(&candidate) {
        candidate.push(MARK);
    }
    from_marks(&candidate)
}

fn to_marks(name: &str) -> String {
    if let Some((base, rest)) = name.rsplit_once(" (") {
        if let Some(digits) = rest.strip_suffix(')') {
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(count) = digits.parse::<usize>() {
                    let mut marked = base.to_string();
                    marked.extend(std::iter::repeat(MARK).take(count));
                    return marked;
                }
            }
        }
    }
    name.to_string()
}

fn from_marks(marked: &str) -> String {
    let base = marked.trim_end_matches(MARK);
    let count = marked.len() - base.len();
    if count == 0 {
        base.to_string()
    } else {
        format!("{} ({})", base, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::scheduler::ClaimOutcome;
    use tempfile::TempDir;

    fn queue() -> (TempDir, RenderQueue) {
        let tmp = TempDir::new().unwrap();
        let rq = RenderQueue::open(tmp.path()).unwrap();
        (tmp, rq)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_disambiguate() {
        assert_eq!(disambiguate("render01", &[]), "render01");
        assert_eq!(disambiguate("render01", &names(&["render01"])), "render01 (1)");
        assert_eq!(disambiguate("render01", &names(&["render01", "render01 (1)"])), "render01 (2)");
        // A free lower slot is reused.
        assert_eq!(disambiguate("render01", &names(&["render01", "render01 (2)"])), "render01 (1)");
        assert_eq!(disambiguate("render01 (1)", &names(&["render01 (1)"])), "render01 (2)");
        assert_eq!(disambiguate("other", &names(&["render01"])), "other");
        assert_eq!(disambiguate("odd (x)", &names(&["odd (x)"])), "odd (x) (1)");
    }

    #[test]
    fn test_new_worker_names_are_unique() {
        let (_tmp, rq) = queue();
        let a = rq.new_worker(Worker::new("render01")).unwrap();
        let b = rq.new_worker(Worker::new("render01")).unwrap();
        let c = rq.new_worker(Worker::new("render01")).unwrap();

        assert_eq!(a.name, "render01");
        assert_eq!(b.name, "render01 (1)");
        assert_eq!(c.name, "render01 (2)");
        assert_ne!(a.id, b.id);

        let mut listed = rq.get_worker_names().unwrap();
        listed.sort();
        assert_eq!(listed, names(&["render01", "render01 (1)", "render01 (2)"]));
    }

    #[test]
    fn test_reserved_name_is_skipped() {
        let (_tmp, rq) = queue();
        rq.new_worker(Worker::new("render01")).unwrap();
        // A reservation whose registration never completed.
        rq.store().create_exclusive(&rq.name_marker("render01 (1)"), "crashed").unwrap();

        let w = rq.new_worker(Worker::new("render01")).unwrap();
        assert_eq!(w.name, "render01 (2)");
    }

    #[test]
    fn test_deleted_name_is_released() {
        let (_tmp, rq) = queue();
        let a = rq.new_worker(Worker::new("render01")).unwrap();
        rq.delete_worker(&a.id).unwrap();

        let b = rq.new_worker(Worker::new("render01")).unwrap();
        assert_eq!(b.name, "render01");
    }

    #[test]
    fn test_set_worker_status_writes_only_changes() {
        let (_tmp, rq) = queue();
        let w = rq.new_worker(Worker::new("w")).unwrap();
        assert_eq!(rq.get_worker_status(&w.id).unwrap(), WorkerStatus::Disabled);

        assert!(rq.set_worker_status(&w.id, WorkerStatus::Idle).unwrap());
        assert!(!rq.set_worker_status(&w.id, WorkerStatus::Idle).unwrap());
        assert_eq!(rq.get_worker_status(&w.id).unwrap(), WorkerStatus::Idle);

        let missing = rq.set_worker_status(&WorkerId("ghost".into()), WorkerStatus::Idle);
        assert!(matches!(missing, Err(QueueError::WorkerNotFound(_))));
    }

    #[test]
    fn test_get_workers_reports_current_task() {
        let (_tmp, rq) = queue();
        let job_id = rq.new_job(Job::new("shot010", "Maya", "1-10"), &names(&["1-5", "6-10"])).unwrap();
        let busy = rq.new_worker(Worker::new("busy")).unwrap();
        let idle = rq.new_worker(Worker::new("idle")).unwrap();
        rq.set_worker_status(&idle.id, WorkerStatus::Idle).unwrap();
        assert!(matches!(rq.dequeue_task(&job_id, 0, &busy.id).unwrap(), ClaimOutcome::Claimed(_)));

        let views = rq.get_workers().unwrap();
        let busy_view = views.iter().find(|v| v.worker.id == busy.id).unwrap();
        assert_eq!(busy_view.display_status, "Rendering frame(s) 1-5 from shot010");
        assert_eq!(busy_view.current_task, Some(TaskId::new(&job_id, 0)));

        let idle_view = views.iter().find(|v| v.worker.id == idle.id).unwrap();
        assert_eq!(idle_view.display_status, "Idle");
        assert_eq!(idle_view.current_task, None);
    }

    #[test]
    fn test_task_of_deleted_job_keeps_stored_status() {
        let (_tmp, rq) = queue();
        let job_id = rq.new_job(Job::new("gone", "Maya", "1"), &names(&["1"])).unwrap();
        let w = rq.new_worker(Worker::new("w")).unwrap();
        rq.set_worker_status(&w.id, WorkerStatus::Rendering).unwrap();
        rq.dequeue_task(&job_id, 0, &w.id).unwrap();
        std::fs::remove_file(rq.job_datafile(&job_id)).unwrap();

        let views = rq.get_workers().unwrap();
        assert_eq!(views[0].display_status, "Rendering");
        assert_eq!(views[0].current_task, Some(TaskId::new(&job_id, 0)));
    }

    #[test]
    fn test_delete_worker_reports_orphans() {
        let (_tmp, rq) = queue();
        let job_id = rq.new_job(Job::new("a", "Maya", "1"), &names(&["1"])).unwrap();
        let w = rq.new_worker(Worker::new("w")).unwrap();
        rq.dequeue_task(&job_id, 0, &w.id).unwrap();

        let report = rq.delete_worker(&w.id).unwrap();
        assert!(report.removed);
        assert_eq!(report.orphaned, vec![TaskId::new(&job_id, 0)]);
        assert!(!rq.worker_dir(&w.id).exists());
        assert!(rq.locate_task(&TaskId::new(&job_id, 0)).unwrap().is_none());

        assert_eq!(rq.delete_worker(&w.id).unwrap(), DeleteWorkerReport::default());
    }

    #[test]
    fn test_requeue_worker_tasks() {
        let (_tmp, rq) = queue();
        let job_id = rq.new_job(Job::new("a", "Maya", "1-2"), &names(&["1", "2"])).unwrap();
        let w = rq.new_worker(Worker::new("w")).unwrap();
        rq.dequeue_task(&job_id, 0, &w.id).unwrap();
        rq.dequeue_task(&job_id, 1, &w.id).unwrap();

        let requeued = rq.requeue_worker_tasks(&w.id).unwrap();
        assert_eq!(requeued.len(), 2);
        assert!(rq.worker_tasks(&w.id).unwrap().is_empty());
        assert_eq!(rq.get_queued_tasks(&job_id).unwrap().len(), 2);

        let ghost = rq.requeue_worker_tasks(&WorkerId("ghost".into()));
        assert!(matches!(ghost, Err(QueueError::WorkerNotFound(_))));
    }
}
