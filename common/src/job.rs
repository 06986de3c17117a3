use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::frames;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Fresh 128-bit identifier, hex encoded without dashes.
    pub fn generate() -> Self {
        JobId(Uuid::new_v4().simple().to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn generate() -> Self {
        WorkerId(Uuid::new_v4().simple().to_string())
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Composite task identifier: `<jobID>_<NNNN>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    pub job_id: JobId,
    pub task_no: u32,
}

impl TaskId {
    pub fn new(job_id: &JobId, task_no: u32) -> Self {
        Self {
            job_id: job_id.clone(),
            task_no,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self)
    }

    /// Parse a task document file name (`<jobID>_<NNNN>.json`) or bare id.
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".json").unwrap_or(name);
        let (job, number) = stem.rsplit_once('_')?;
        if job.is_empty() || number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            job_id: JobId(job.to_string()),
            task_no: number.parse().ok()?,
        })
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{:04}", self.job_id, self.task_no)
    }
}

fn unknown_frames() -> String {
    frames::UNKNOWN.to_string()
}

/// A submitted render. Renderer specific fields (scene, project, flags,
/// command) are kept opaque in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    #[serde(rename = "jobID", default)]
    pub id: JobId,
    #[serde(rename = "jobName")]
    pub name: String,
    #[serde(rename = "jobType", default)]
    pub job_type: String,
    #[serde(default = "unknown_frames")]
    pub frames: String,
    /// 0 pauses the job, 100 is the most urgent.
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub username: String,
    #[serde(rename = "submitTime", default)]
    pub submit_time: String,
    #[serde(default)]
    pub comment: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    pub fn new(name: impl Into<String>, job_type: impl Into<String>, frames: impl Into<String>) -> Self {
        Self {
            id: JobId::default(),
            name: name.into(),
            job_type: job_type.into(),
            frames: frames.into(),
            priority: 50,
            username: String::new(),
            submit_time: String::new(),
            comment: String::new(),
            extra: Map::new(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.priority == 0
    }

    /// Opaque string field, e.g. `command` or `mayaScene`.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    /// Set an opaque field. Built-in keys would be written twice and make
    /// the document unreadable, so they are refused.
    pub fn set_field(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        if Self::is_reserved_field(&key) {
            return Err(QueueError::ReservedField(key));
        }
        self.extra.insert(key, value.into());
        Ok(())
    }

    pub fn is_reserved_field(key: &str) -> bool {
        JOB_FIELDS.contains(&key)
    }
}

/// Keys the job document stores in typed fields.
const JOB_FIELDS: &[&str] = &[
    "jobID",
    "jobName",
    "jobType",
    "frames",
    "priority",
    "username",
    "submitTime",
    "comment",
];

/// One schedulable chunk of a job. Where the document lives is its state;
/// there is no status or worker field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    #[serde(rename = "jobID")]
    pub job_id: JobId,
    #[serde(rename = "taskNo")]
    pub task_no: u32,
    #[serde(default = "unknown_frames")]
    pub frames: String,
    #[serde(rename = "startTime", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(rename = "endTime", default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    pub fn new(job_id: &JobId, task_no: u32, frames: impl Into<String>) -> Self {
        Self {
            job_id: job_id.clone(),
            task_no,
            frames: frames.into(),
            start_time: None,
            end_time: None,
            extra: Map::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        TaskId::new(&self.job_id, self.task_no)
    }

    /// Seconds spent on the task so far.
    pub fn elapsed(&self, now: f64) -> f64 {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => (end - start).max(0.0),
            (Some(start), None) => (now - start).max(0.0),
            _ => 0.0,
        }
    }
}

/// Task state as implied by the directory holding the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Working { worker_id: WorkerId, worker_name: String },
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_working(&self) -> bool {
        matches!(self, TaskStatus::Working { .. })
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "Queued"),
            TaskStatus::Working { worker_name, .. } => write!(f, "Rendering on {}", worker_name),
            TaskStatus::Completed => write!(f, "Done"),
            TaskStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Snapshot of a task together with its derived status.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task: Task,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerStatus {
    #[default]
    Disabled,
    Idle,
    Rendering,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Disabled => write!(f, "Disabled"),
            WorkerStatus::Idle => write!(f, "Idle"),
            WorkerStatus::Rendering => write!(f, "Rendering"),
        }
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "disabled" => Ok(WorkerStatus::Disabled),
            "idle" => Ok(WorkerStatus::Idle),
            "rendering" => Ok(WorkerStatus::Rendering),
            other => Err(format!("invalid worker status: {other} (expected disabled, idle or rendering)")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Worker {
    #[serde(default)]
    pub id: WorkerId,
    pub name: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub status: WorkerStatus,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub comment: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: WorkerId::default(),
            name: name.into(),
            hostname: String::new(),
            ip_address: String::new(),
            status: WorkerStatus::Disabled,
            username: String::new(),
            pool: "None".to_string(),
            comment: String::new(),
            extra: Map::new(),
        }
    }
}

/// A worker as shown to viewers: the stored document plus whatever it is
/// currently rendering, discovered from its subtree.
#[derive(Debug, Clone)]
pub struct WorkerView {
    pub worker: Worker,
    pub current_task: Option<TaskId>,
    pub display_status: String,
}

/// Aggregated progress for a job, derived from where its tasks live.
#[derive(Debug, Clone, PartialEq)]
pub struct JobProgress {
    pub status: String,
    pub percent: u32,
    pub completed_frames: usize,
    pub in_progress_frames: usize,
    pub total_frames: Option<usize>,
    pub tasks_rendering: usize,
    pub tasks_total: usize,
    pub total_time: f64,
}
