pub mod db;
pub mod error;
pub mod frames;
pub mod job;
pub mod scheduler;
pub mod store;
pub mod workers;

pub use db::{DeleteJobReport, RenderQueue};
pub use error::{QueueError, Result};
pub use job::{Job, JobId, JobProgress, Task, TaskId, TaskRecord, TaskStatus, Worker, WorkerId,
             WorkerStatus, WorkerView};
pub use scheduler::{ClaimOutcome, SelectionPolicy, Transition};
pub use store::Store;
pub use workers::DeleteWorkerReport;

// Database layout, relative to the configured root.
pub const JOBS_DIR: &str = "jobs";
pub const TASKS_DIR: &str = "tasks";
pub const QUEUED_DIR: &str = "queued";
pub const COMPLETED_DIR: &str = "completed";
pub const FAILED_DIR: &str = "failed";
pub const WORKERS_DIR: &str = "workers";
pub const LOGS_DIR: &str = "logs";
pub const WORKER_INFO_FILE: &str = "workerinfo.json";
pub const NAMES_DIR: &str = ".names";
pub const HOSTS_DIR: &str = ".hosts";
pub const QUEUE_LOG_FILE: &str = "renderqueue.log";
pub const TASK_OUTPUT_LOG_FILE: &str = "tasks.log";

// Production paths
pub const DEFAULT_DATABASE_PATH: &str = "/var/lib/renderqueue";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/renderqueue/worker.yaml";

// Fallback paths for non-root users
pub const USER_DATABASE_PATH: &str = "renderqueue";
pub const USER_CONFIG_PATH: &str = "~/.config/renderqueue/worker.yaml";

pub const DATABASE_ENV: &str = "RQ_DATABASE";

/// Format of `submitTime`; sorts lexically in submission order.
pub const SUBMIT_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Current time as fractional epoch seconds, as stored in `startTime`/`endTime`.
pub fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

pub fn submit_timestamp() -> String {
    chrono::Local::now().format(SUBMIT_TIME_FORMAT).to_string()
}
