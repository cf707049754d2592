//! Background job model.
//!
//! Long-running daemon methods return a job id instead of a result. The job
//! is then observed through `core.job.query`, whose result is a list of job
//! objects; the first entry is taken as authoritative.

use crate::error::ProtocolError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Method used to query job status.
pub const JOB_QUERY_METHOD: &str = "core.job.query";

/// Identifier of a daemon-side job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobHandle {
    Id(i64),
    Name(String),
}

impl JobHandle {
    /// Extracts a job handle from a method result.
    ///
    /// Only a bare integer counts; any other shape is an inline result.
    pub fn from_result(result: &Value) -> Option<Self> {
        result.as_i64().map(JobHandle::Id)
    }

    /// Query filter selecting this job: `[[["id", "=", <id>]]]`.
    pub fn query_params(&self) -> Value {
        json!([[["id", "=", self]]])
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobHandle::Id(id) => write!(f, "{}", id),
            JobHandle::Name(name) => write!(f, "{}", name),
        }
    }
}

impl From<i64> for JobHandle {
    fn from(id: i64) -> Self {
        JobHandle::Id(id)
    }
}

impl From<&str> for JobHandle {
    fn from(name: &str) -> Self {
        JobHandle::Name(name.to_string())
    }
}

impl From<String> for JobHandle {
    fn from(name: String) -> Self {
        JobHandle::Name(name)
    }
}

impl std::str::FromStr for JobHandle {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<i64>() {
            Ok(id) => JobHandle::Id(id),
            Err(_) => JobHandle::Name(s.to_string()),
        })
    }
}

/// Job state as reported by the daemon.
///
/// Unrecognized strings are kept verbatim and treated as non-terminal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobState {
    Waiting,
    Running,
    Success,
    Failed,
    Aborted,
    Other(String),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failed | JobState::Aborted)
    }

    /// Terminal and unsuccessful.
    pub fn is_failure(&self) -> bool {
        matches!(self, JobState::Failed | JobState::Aborted)
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobState::Waiting => "WAITING",
            JobState::Running => "RUNNING",
            JobState::Success => "SUCCESS",
            JobState::Failed => "FAILED",
            JobState::Aborted => "ABORTED",
            JobState::Other(s) => s,
        }
    }
}

impl From<String> for JobState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "WAITING" => JobState::Waiting,
            "RUNNING" => JobState::Running,
            "SUCCESS" => JobState::Success,
            "FAILED" => JobState::Failed,
            "ABORTED" => JobState::Aborted,
            _ => JobState::Other(s),
        }
    }
}

impl From<JobState> for String {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress reported by a running job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Percent complete, 0-100.
    #[serde(default)]
    pub percent: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Snapshot of one job at one poll tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JobHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub state: JobState,
    #[serde(default, deserialize_with = "null_as_default")]
    pub progress: JobProgress,
    /// Daemon error, present when the job failed or was aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Return value of a finished job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl JobStatus {
    pub fn new(state: JobState) -> Self {
        Self {
            id: None,
            method: None,
            state,
            progress: JobProgress::default(),
            error: None,
            result: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<JobHandle>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<Value>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_progress(mut self, percent: f64, description: impl Into<String>) -> Self {
        self.progress = JobProgress {
            percent: Some(percent),
            description: Some(description.into()),
        };
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Daemon error text, verbatim when it is a string.
    pub fn error_message(&self) -> Option<String> {
        match &self.error {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }

    /// Parses the result of a `core.job.query` call.
    pub fn parse_query_result(result: Value) -> Result<Vec<JobStatus>, ProtocolError> {
        match result {
            Value::Null => Ok(Vec::new()),
            Value::Array(_) => Ok(serde_json::from_value(result)?),
            _ => Err(ProtocolError::InvalidField {
                field: "result",
                expected: "array of jobs",
            }),
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
