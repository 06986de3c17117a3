use common::{frames, ClaimOutcome, Job, QueueError, RenderQueue, TaskStatus, Transition, Worker, WorkerStatus};
use tempfile::TempDir;

fn submit(rq: &RenderQueue, name: &str, range: &str, task_size: usize, priority: u8) -> common::JobId {
    submit_at(rq, name, range, task_size, priority, "")
}

fn submit_at(
    rq: &RenderQueue,
    name: &str,
    range: &str,
    task_size: usize,
    priority: u8,
    submit_time: &str,
) -> common::JobId {
    let expanded = frames::expand(range).unwrap();
    let task_frames: Vec<String> = frames::chunk(&expanded, task_size)
        .iter()
        .map(|chunk| frames::collapse(chunk))
        .collect();
    let mut job = Job::new(name, "Maya", range);
    job.priority = priority;
    job.submit_time = submit_time.to_string();
    rq.new_job(job, &task_frames).unwrap()
}

#[test]
fn test_job_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let rq = RenderQueue::open(tmp.path()).unwrap();

    let job_id = submit(&rq, "shot010", "1-10", 4, 50);
    let tasks = rq.get_tasks(&job_id).unwrap();
    let task_frames: Vec<&str> = tasks.iter().map(|r| r.task.frames.as_str()).collect();
    assert_eq!(task_frames, vec!["1-4", "5-8", "9-10"]);
    assert_eq!(rq.job_progress(&job_id).unwrap().status, "Queued");

    let worker = rq.new_worker(Worker::new("render01")).unwrap();
    rq.set_worker_status(&worker.id, WorkerStatus::Idle).unwrap();

    let next = rq.get_task_to_render().unwrap().unwrap();
    assert_eq!(next.task_no, 0);
    let ClaimOutcome::Claimed(claimed) = rq.dequeue_task(&job_id, next.task_no, &worker.id).unwrap() else {
        panic!("claim should succeed with no competition");
    };
    assert!(claimed.start_time.is_some());
    rq.set_worker_status(&worker.id, WorkerStatus::Rendering).unwrap();

    let tasks = rq.get_tasks(&job_id).unwrap();
    assert_eq!(
        tasks[0].status,
        TaskStatus::Working {
            worker_id: worker.id.clone(),
            worker_name: "render01".into()
        }
    );
    assert_eq!(tasks[0].status.to_string(), "Rendering on render01");
    assert_eq!(rq.job_progress(&job_id).unwrap().status, "[0%] Working");

    assert_eq!(rq.complete_task(&job_id, 0).unwrap(), Transition::Moved);
    rq.set_worker_status(&worker.id, WorkerStatus::Idle).unwrap();
    let progress = rq.job_progress(&job_id).unwrap();
    assert_eq!(progress.status, "[40%] Waiting");
    assert_eq!(progress.completed_frames, 4);

    rq.dequeue_task(&job_id, 1, &worker.id).unwrap();
    assert_eq!(rq.fail_task(&job_id, 1).unwrap(), Transition::Moved);
    assert_eq!(rq.get_tasks(&job_id).unwrap()[1].status, TaskStatus::Failed);

    // Manual resubmission of the failed task.
    assert_eq!(rq.requeue_task(&job_id, 1).unwrap(), Transition::Moved);
    for task_no in [1, 2] {
        rq.dequeue_task(&job_id, task_no, &worker.id).unwrap();
        rq.complete_task(&job_id, task_no).unwrap();
    }

    let progress = rq.job_progress(&job_id).unwrap();
    assert_eq!(progress.status, "Done");
    assert_eq!(progress.percent, 100);
    assert_eq!(rq.get_task_to_render().unwrap(), None);

    let report = rq.delete_job(&job_id).unwrap();
    assert!(report.job_removed);
    assert_eq!(report.tasks_removed.len(), 3);
    assert!(report.in_flight.is_empty());
    assert!(matches!(rq.get_job(&job_id), Err(QueueError::JobNotFound(_))));
}

#[test]
fn test_priority_changes_reorder_work() {
    let tmp = TempDir::new().unwrap();
    let rq = RenderQueue::open(tmp.path()).unwrap();

    let first = submit_at(&rq, "first", "1-2", 1, 50, "2024/03/01 09:00:00");
    let second = submit_at(&rq, "second", "1-2", 1, 50, "2024/03/01 09:05:00");
    assert_eq!(rq.get_task_to_render().unwrap().unwrap().job_id, first);

    rq.set_priority(&second, 90).unwrap();
    assert_eq!(rq.get_task_to_render().unwrap().unwrap().job_id, second);

    // Pausing removes the job from consideration entirely.
    rq.set_priority(&second, 0).unwrap();
    rq.set_priority(&first, 0).unwrap();
    assert_eq!(rq.get_task_to_render().unwrap(), None);
}

#[test]
fn test_crashed_worker_tasks_can_be_recovered() {
    let tmp = TempDir::new().unwrap();
    let rq = RenderQueue::open(tmp.path()).unwrap();
    let job_id = submit(&rq, "shot", "1-3", 1, 50);

    let crashed = rq.new_worker(Worker::new("crashed")).unwrap();
    rq.dequeue_task(&job_id, 0, &crashed.id).unwrap();

    // Nothing times out on its own.
    assert_eq!(rq.get_task_to_render().unwrap().unwrap().task_no, 1);

    rq.requeue_worker_tasks(&crashed.id).unwrap();
    assert_eq!(rq.get_task_to_render().unwrap().unwrap().task_no, 0);
    assert!(rq.get_tasks(&job_id).unwrap().iter().all(|r| r.status == TaskStatus::Queued));
}
