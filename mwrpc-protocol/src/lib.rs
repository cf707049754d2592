//! # mwrpc-protocol
//!
//! Wire protocol for the middleware daemon's WebSocket API.
//!
//! This crate provides:
//! - Strongly-typed message envelopes (method calls, responses, events)
//! - A JSON codec that turns one WebSocket text frame into one envelope
//! - The background job model (handles, states, status snapshots)
//! - Protocol error types

pub mod codec;
pub mod error;
pub mod job;
pub mod message;

pub use codec::{Decoder, Encoder};
pub use error::ProtocolError;
pub use job::{JobHandle, JobProgress, JobState, JobStatus, JOB_QUERY_METHOD};
pub use message::{Envelope, Event, EventKind, MessageKind, MethodCall, Response, ResponseBody};

/// Maximum size of a single encoded message (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default WebSocket endpoint path on the daemon.
pub const DEFAULT_WEBSOCKET_PATH: &str = "/websocket";
