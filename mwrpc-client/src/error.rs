//! Client error types.

use mwrpc_protocol::{JobHandle, JobStatus, ProtocolError};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("remote error: {0}")]
    Remote(RemoteError),

    #[error("request timeout")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("not connected")]
    NotConnected,

    #[error("duplicate request id: {0}")]
    DuplicateId(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
}

/// Coarse error category, for callers that map failures onto their own
/// reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Decode,
    Remote,
    Timeout,
    Cancelled,
    ConnectionClosed,
    Config,
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Transport(_) => ErrorKind::Transport,
            ClientError::Protocol(_) | ClientError::Json(_) => ErrorKind::Decode,
            ClientError::Remote(_) => ErrorKind::Remote,
            ClientError::Timeout => ErrorKind::Timeout,
            ClientError::Cancelled => ErrorKind::Cancelled,
            ClientError::ConnectionClosed | ClientError::NotConnected => {
                ErrorKind::ConnectionClosed
            }
            ClientError::DuplicateId(_) | ClientError::InvalidUrl(_) | ClientError::TlsConfig(_) => {
                ErrorKind::Config
            }
        }
    }

    /// Returns whether this error is retryable.
    ///
    /// Remote errors are never retryable here; daemon methods are not
    /// assumed to be idempotent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_) | ClientError::Timeout | ClientError::ConnectionClosed
        )
    }

    /// Daemon-supplied error, if this is a remote failure.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            ClientError::Remote(err) => Some(err),
            _ => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => ClientError::ConnectionClosed,
            WsError::Url(e) => ClientError::InvalidUrl(e.to_string()),
            other => ClientError::Transport(other.to_string()),
        }
    }
}

/// Error reported by the daemon, either as an error response or as the
/// error of a failed job.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    /// Daemon message, verbatim.
    pub message: String,
    /// Numeric error code (errno), if supplied.
    pub errno: Option<i64>,
    /// Symbolic error name, e.g. `ENOENT`.
    pub errname: Option<String>,
    /// Daemon-side exception type.
    pub error_type: Option<String>,
    /// Job that failed, for job errors.
    pub job: Option<JobHandle>,
    /// Raw error payload.
    pub payload: Value,
}

impl RemoteError {
    /// Builds a remote error from an error response payload.
    pub fn from_payload(payload: Value) -> Self {
        let message = match &payload {
            Value::String(s) => s.clone(),
            Value::Object(map) => ["reason", "message", "error"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str))
                .map(str::to_string)
                .unwrap_or_else(|| payload.to_string()),
            Value::Null => "unknown error".to_string(),
            other => other.to_string(),
        };
        let errno = payload
            .get("errno")
            .or_else(|| payload.get("error"))
            .and_then(Value::as_i64);
        let errname = payload
            .get("errname")
            .and_then(Value::as_str)
            .map(str::to_string);
        let error_type = payload
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            message,
            errno,
            errname,
            error_type,
            job: None,
            payload,
        }
    }

    /// Builds a remote error from a failed or aborted job snapshot.
    pub fn from_job(handle: &JobHandle, status: &JobStatus) -> Self {
        let message = status
            .error_message()
            .unwrap_or_else(|| format!("job {} ended in state {}", handle, status.state));
        Self {
            message,
            errno: None,
            errname: None,
            error_type: None,
            job: Some(handle.clone()),
            payload: status.error.clone().unwrap_or(Value::Null),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref job) = self.job {
            write!(f, "job {} failed: ", job)?;
        }
        match self.errname {
            Some(ref name) => write!(f, "[{}] {}", name, self.message),
            None => f.write_str(&self.message),
        }
    }
}
