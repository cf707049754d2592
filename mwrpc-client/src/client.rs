//! High-level client API.

use crate::connection::{Connection, ConnectionConfig, ConnectionState, Unsolicited};
use crate::correlator::deadline_after;
use crate::error::{ClientError, RemoteError};
use crate::poller::{JobPoller, JobStatusSource, PollerConfig};
use mwrpc_protocol::{JobHandle, JobStatus, JOB_QUERY_METHOD};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Default timeout for a single call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    /// Bound on each call, from send to response.
    pub request_timeout: Duration,
    pub poller: PollerConfig,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(url),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            poller: PollerConfig::default(),
        }
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poller = self.poller.with_interval(interval);
        self
    }
}

/// What a call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// Inline result.
    Value(Value),
    /// The method started a background job.
    Job(JobHandle),
}

impl CallOutcome {
    /// Returns the inline value, or the job id as a JSON value.
    pub fn into_value(self) -> Value {
        match self {
            CallOutcome::Value(value) => value,
            CallOutcome::Job(handle) => serde_json::to_value(handle).unwrap_or(Value::Null),
        }
    }

    pub fn job(&self) -> Option<&JobHandle> {
        match self {
            CallOutcome::Job(handle) => Some(handle),
            CallOutcome::Value(_) => None,
        }
    }
}

/// Job-aware RPC client. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct RpcClient {
    conn: Arc<Connection>,
    request_timeout: Duration,
    poller: JobPoller,
}

impl RpcClient {
    /// Creates a new client with the given configuration.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config.connection)),
            request_timeout: config.request_timeout,
            poller: JobPoller::new(config.poller),
        }
    }

    /// Creates a client and connects it.
    pub async fn connect_with(config: ClientConfig) -> Result<Self, ClientError> {
        let client = Self::new(config);
        client.connect().await?;
        Ok(client)
    }

    /// Wraps a connection the caller has already established.
    /// `config.connection` is not used.
    pub fn from_connection(conn: Connection, config: ClientConfig) -> Self {
        Self {
            conn: Arc::new(conn),
            request_timeout: config.request_timeout,
            poller: JobPoller::new(config.poller),
        }
    }

    /// Connects to the daemon.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Closes the connection. Every clone sees it closed.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// Subscribes to pushed events and unmatched responses.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Unsolicited> {
        self.conn.subscribe_events()
    }

    /// Invokes a method.
    ///
    /// A bare integer result is taken to be a job id and comes back as
    /// [`CallOutcome::Job`]; use [`call_value`](Self::call_value) for methods
    /// that return plain integers.
    pub async fn call(&self, method: &str, params: Value) -> Result<CallOutcome, ClientError> {
        let value = self.call_value(method, params).await?;
        match JobHandle::from_result(&value) {
            Some(handle) => {
                tracing::debug!("{} started job {}", method, handle);
                Ok(CallOutcome::Job(handle))
            }
            None => Ok(CallOutcome::Value(value)),
        }
    }

    /// Invokes a method and returns its result as is.
    pub async fn call_value(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let response = self
            .conn
            .request(method, params, self.request_timeout)
            .await?;

        response.into_result().map_err(|payload| {
            let err = RemoteError::from_payload(payload);
            tracing::debug!("{} failed: {}", method, err);
            ClientError::Remote(err)
        })
    }

    /// Runs one status query for `handle`.
    pub async fn query_job(&self, handle: &JobHandle) -> Result<Vec<JobStatus>, ClientError> {
        let result = self
            .call_value(JOB_QUERY_METHOD, handle.query_params())
            .await?;
        Ok(JobStatus::parse_query_result(result)?)
    }

    /// Polls `handle` until it finishes or `max_wait` elapses.
    ///
    /// Returns the terminal snapshot on success. A failed or aborted job
    /// yields [`ClientError::Remote`] carrying the daemon's error text.
    pub async fn await_job(
        &self,
        handle: &JobHandle,
        max_wait: Duration,
    ) -> Result<JobStatus, ClientError> {
        self.await_job_with_cancel(handle, max_wait, std::future::pending())
            .await
    }

    /// Like [`await_job`](Self::await_job), but gives up with
    /// [`ClientError::Cancelled`] as soon as `cancel` completes.
    pub async fn await_job_with_cancel<C>(
        &self,
        handle: &JobHandle,
        max_wait: Duration,
        cancel: C,
    ) -> Result<JobStatus, ClientError>
    where
        C: Future<Output = ()>,
    {
        let deadline = deadline_after(max_wait);
        self.poller.run(self, handle, deadline, cancel).await
    }

    /// Invokes a method and, if it started a job, waits for the job's result.
    pub async fn call_and_wait(
        &self,
        method: &str,
        params: Value,
        max_wait: Duration,
    ) -> Result<Value, ClientError> {
        match self.call(method, params).await? {
            CallOutcome::Value(value) => Ok(value),
            CallOutcome::Job(handle) => {
                let status = self.await_job(&handle, max_wait).await?;
                Ok(status.result.unwrap_or(Value::Null))
            }
        }
    }
}

impl JobStatusSource for RpcClient {
    async fn query_job(&self, handle: &JobHandle) -> Result<Vec<JobStatus>, ClientError> {
        RpcClient::query_job(self, handle).await
    }
}
