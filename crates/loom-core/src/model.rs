//! Plan/task/status types for the data model in `SPEC_FULL.md` §3.
//!
//! The status enums follow a `Display`/`FromStr`-plus-dedicated-error-type
//! idiom rather than a database-column type derive, since task/job state
//! here lives in broker hash fields, not database rows.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Status of a single task within a job.
///
/// `FailedDependency` is not fully terminal: `SPEC_FULL.md` §4.5 has the
/// orchestrator re-sweep it on every later completion event, dispatching it
/// normally once its dependencies are all `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Dispatched,
    Completed,
    Failed,
    FailedDependency,
}

impl TaskStatus {
    /// Whether the orchestrator should skip this task on a dispatch sweep:
    /// either already in flight, or truly terminal.
    pub fn blocks_redispatch(self) -> bool {
        matches!(self, Self::Dispatched | Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::FailedDependency => "failed_dependency",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "dispatched" => Ok(Self::Dispatched),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "failed_dependency" => Ok(Self::FailedDependency),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

/// Status of a job as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = JobStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(JobStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JobStatus`] string.
#[derive(Debug, Clone)]
pub struct JobStatusParseError(pub String);

impl fmt::Display for JobStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job status: {:?}", self.0)
    }
}

impl std::error::Error for JobStatusParseError {}

/// One node of a plan, bound to exactly one agent role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub agent: String,
    /// Detail values: literal scalars, or a `data_from:{task}.{field}`
    /// reference string resolved before dispatch.
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// An immutable DAG description of a job, as produced by a planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub job_id: String,
    pub goal: String,
    pub tasks: Vec<Task>,
}

impl Plan {
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }
}
