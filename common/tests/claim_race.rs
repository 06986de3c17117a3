use std::sync::{Arc, Barrier};
use std::thread;

use common::{ClaimOutcome, Job, RenderQueue, TaskId, Worker};
use tempfile::TempDir;

const CLAIMANTS: usize = 8;

#[test]
fn test_exactly_one_claimant_wins() {
    let tmp = TempDir::new().unwrap();
    let setup = RenderQueue::open(tmp.path()).unwrap();
    let job_id = setup
        .new_job(Job::new("race", "Nuke", "1"), &["1".to_string()])
        .unwrap();

    let barrier = Arc::new(Barrier::new(CLAIMANTS));
    let handles: Vec<_> = (0..CLAIMANTS)
        .map(|i| {
            let root = tmp.path().to_path_buf();
            let barrier = Arc::clone(&barrier);
            let job_id = job_id.clone();
            thread::spawn(move || {
                // Each claimant is an independent handle on the same tree.
                let rq = RenderQueue::open(root).unwrap();
                let worker = rq.new_worker(Worker::new(format!("node{i}"))).unwrap();
                barrier.wait();
                (worker.id.clone(), rq.dequeue_task(&job_id, 0, &worker.id).unwrap())
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<_> = results
        .iter()
        .filter(|(_, outcome)| matches!(outcome, ClaimOutcome::Claimed(_)))
        .collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(
        results.iter().filter(|(_, o)| *o == ClaimOutcome::Contended).count(),
        CLAIMANTS - 1
    );

    // The task document exists in exactly one place: the winner's subtree.
    let id = TaskId::new(&job_id, 0);
    let (winner, _) = winners[0];
    assert_eq!(setup.worker_tasks(winner).unwrap(), vec![id.clone()]);
    assert!(setup.get_queued_tasks(&job_id).unwrap().is_empty());
    for (worker_id, _) in results.iter().filter(|(w, _)| w != winner) {
        assert!(setup.worker_tasks(worker_id).unwrap().is_empty());
    }
}

#[test]
fn test_concurrent_registration_yields_distinct_names() {
    let tmp = TempDir::new().unwrap();
    RenderQueue::open(tmp.path()).unwrap();

    let barrier = Arc::new(Barrier::new(CLAIMANTS));
    let handles: Vec<_> = (0..CLAIMANTS)
        .map(|_| {
            let root = tmp.path().to_path_buf();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let rq = RenderQueue::open(root).unwrap();
                barrier.wait();
                rq.new_worker(Worker::new("render01")).unwrap().name
            })
        })
        .collect();

    let mut names: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), CLAIMANTS);
}

#[test]
fn test_workers_drain_queue_without_duplicates() {
    let tmp = TempDir::new().unwrap();
    let setup = RenderQueue::open(tmp.path()).unwrap();
    let frames: Vec<String> = (1..=40).map(|f| f.to_string()).collect();
    let job_id = setup.new_job(Job::new("drain", "Maya", "1-40"), &frames).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let root = tmp.path().to_path_buf();
            thread::spawn(move || {
                let rq = RenderQueue::open(root).unwrap();
                let worker = rq.new_worker(Worker::new(format!("node{i}"))).unwrap();
                let mut done = Vec::new();
                while let Some(task) = rq.get_task_to_render().unwrap() {
                    if let ClaimOutcome::Claimed(task) =
                        rq.dequeue_task(&task.job_id, task.task_no, &worker.id).unwrap()
                    {
                        rq.complete_task(&task.job_id, task.task_no).unwrap();
                        done.push(task.task_no);
                    }
                }
                done
            })
        })
        .collect();

    let mut completed: Vec<u32> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    completed.sort();
    assert_eq!(completed, (0..40).collect::<Vec<u32>>());

    let progress = setup.job_progress(&job_id).unwrap();
    assert_eq!(progress.status, "Done");
}
