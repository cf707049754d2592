//! Background job polling.
//!
//! [`JobPoll`] is the transport-free state machine: it consumes query
//! results and moves from `Polling` to exactly one terminal state.
//! [`JobPoller`] drives it on a fixed cadence against any
//! [`JobStatusSource`], honoring a deadline and a cancellation signal at
//! both the sleep and the query.

use crate::correlator::deadline_after;
use crate::error::{ClientError, RemoteError};
use mwrpc_protocol::{JobHandle, JobState, JobStatus};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Default delay between status queries.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Poller configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Delay before each status query.
    pub interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl PollerConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Where a job's observation stands.
#[derive(Debug, Clone, PartialEq)]
pub enum PollState {
    Polling,
    Succeeded(JobStatus),
    Failed(JobStatus),
    TimedOut,
    Cancelled,
}

impl PollState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PollState::Polling)
    }
}

/// Observation state machine for one job.
#[derive(Debug)]
pub struct JobPoll {
    handle: JobHandle,
    state: PollState,
    queries: u32,
    last: Option<JobStatus>,
}

impl JobPoll {
    pub fn new(handle: JobHandle) -> Self {
        Self {
            handle,
            state: PollState::Polling,
            queries: 0,
            last: None,
        }
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    /// Number of query results observed.
    pub fn queries(&self) -> u32 {
        self.queries
    }

    /// Most recent non-terminal snapshot.
    pub fn last_status(&self) -> Option<&JobStatus> {
        self.last.as_ref()
    }

    /// Applies one query result. Only the first entry is considered; an
    /// empty result means the daemon does not know the job yet.
    ///
    /// Terminal states absorb further input.
    pub fn observe(&mut self, snapshots: Vec<JobStatus>) -> &PollState {
        if self.state.is_terminal() {
            return &self.state;
        }
        self.queries += 1;

        let Some(status) = snapshots.into_iter().next() else {
            return &self.state;
        };

        self.state = match status.state {
            JobState::Success => PollState::Succeeded(status),
            JobState::Failed | JobState::Aborted => PollState::Failed(status),
            _ => {
                self.last = Some(status);
                PollState::Polling
            }
        };
        &self.state
    }

    /// Deadline elapsed.
    pub fn time_out(&mut self) {
        if !self.state.is_terminal() {
            self.state = PollState::TimedOut;
        }
    }

    /// Caller abandoned the wait.
    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            self.state = PollState::Cancelled;
        }
    }

    /// Converts a terminal state into the caller-facing result; `None`
    /// while still polling.
    pub fn into_outcome(self) -> Option<Result<JobStatus, ClientError>> {
        match self.state {
            PollState::Polling => None,
            PollState::Succeeded(status) => Some(Ok(status)),
            PollState::Failed(status) => Some(Err(ClientError::Remote(RemoteError::from_job(
                &self.handle,
                &status,
            )))),
            PollState::TimedOut => Some(Err(ClientError::Timeout)),
            PollState::Cancelled => Some(Err(ClientError::Cancelled)),
        }
    }
}

/// Something that can answer a job status query.
pub trait JobStatusSource {
    fn query_job(
        &self,
        handle: &JobHandle,
    ) -> impl Future<Output = Result<Vec<JobStatus>, ClientError>> + Send;
}

/// Drives [`JobPoll`] against a [`JobStatusSource`].
#[derive(Debug, Clone, Default)]
pub struct JobPoller {
    config: PollerConfig,
}

impl JobPoller {
    pub fn new(config: PollerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Polls until the job is terminal, `deadline` passes, or `cancel`
    /// completes.
    ///
    /// Each query is preceded by one interval. An in-flight query is
    /// abandoned on deadline or cancellation, which revokes its pending
    /// registration. Errors from the query itself end the wait.
    pub async fn run<S, C>(
        &self,
        source: &S,
        handle: &JobHandle,
        deadline: Instant,
        cancel: C,
    ) -> Result<JobStatus, ClientError>
    where
        S: JobStatusSource,
        C: Future<Output = ()>,
    {
        let mut poll = JobPoll::new(handle.clone());
        tokio::pin!(cancel);

        loop {
            let tick = deadline_after(self.config.interval);
            tokio::select! {
                biased;
                _ = &mut cancel => {
                    tracing::debug!("job {}: cancelled while waiting", handle);
                    poll.cancel();
                    break;
                }
                _ = sleep_until(deadline) => {
                    tracing::debug!("job {}: deadline reached", handle);
                    poll.time_out();
                    break;
                }
                _ = sleep_until(tick) => {}
            }

            let snapshots = tokio::select! {
                biased;
                _ = &mut cancel => {
                    tracing::debug!("job {}: cancelled during query", handle);
                    poll.cancel();
                    break;
                }
                _ = sleep_until(deadline) => {
                    tracing::debug!("job {}: deadline reached during query", handle);
                    poll.time_out();
                    break;
                }
                res = source.query_job(handle) => res?,
            };

            match snapshots.first() {
                Some(status) => tracing::debug!(
                    "job {}: state={} percent={:?} description={:?}",
                    handle,
                    status.state,
                    status.progress.percent,
                    status.progress.description
                ),
                None => tracing::debug!("job {}: not known yet", handle),
            }

            if poll.observe(snapshots).is_terminal() {
                break;
            }
        }

        tracing::debug!("job {}: finished after {} queries", handle, poll.queries());
        poll.into_outcome().unwrap_or(Err(ClientError::Cancelled))
    }
}
