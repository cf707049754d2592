//! # mwrpc-client
//!
//! Client library for the middleware daemon's WebSocket API.
//!
//! This crate provides:
//! - A single persistent connection shared by any number of concurrent calls
//! - Correlation of responses to calls by request id
//! - Detection of background jobs and polling until they finish
//! - Optional TLS via rustls

pub mod client;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod poller;
pub mod tls;

#[cfg(test)]
pub(crate) mod testutil;

pub use client::{CallOutcome, ClientConfig, RpcClient, DEFAULT_REQUEST_TIMEOUT};
pub use connection::{
    Connection, ConnectionConfig, ConnectionState, TlsClientConfig, Unsolicited,
};
pub use correlator::{Correlator, DisconnectReason, Dispatch, PendingCall};
pub use error::{ClientError, ErrorKind, RemoteError};
pub use poller::{
    JobPoll, JobPoller, JobStatusSource, PollState, PollerConfig, DEFAULT_POLL_INTERVAL,
};
