//! Request/response correlation.
//!
//! One reader task dispatches every inbound envelope; any number of callers
//! wait on their own [`PendingCall`]. Each registered id leaves the table
//! exactly once: on delivery, on revocation (timeout or drop), or when the
//! table is swept at close.

use crate::error::ClientError;
use mwrpc_protocol::{Envelope, Event, MethodCall, Response};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Why the pending table was swept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed locally.
    Closed,
    /// The transport failed.
    Transport(String),
}

impl From<DisconnectReason> for ClientError {
    fn from(reason: DisconnectReason) -> Self {
        match reason {
            DisconnectReason::Closed => ClientError::ConnectionClosed,
            DisconnectReason::Transport(msg) => ClientError::Transport(msg),
        }
    }
}

type Delivery = Result<Response, DisconnectReason>;

/// Longest wait honored by [`deadline_after`], roughly thirty years.
const MAX_WAIT: Duration = Duration::from_secs(86400 * 365 * 30);

/// Instant `wait` from now. Waits beyond `MAX_WAIT`, such as
/// `Duration::MAX`, are clamped so the addition cannot overflow.
pub fn deadline_after(wait: Duration) -> Instant {
    Instant::now() + wait.min(MAX_WAIT)
}

/// Outcome of dispatching one inbound envelope.
#[derive(Debug)]
pub enum Dispatch {
    /// Handed to the waiting caller.
    Delivered,
    /// No caller is waiting for this id (never registered, or already timed out).
    Unmatched(Response),
    /// Unsolicited event.
    Event(Event),
    /// A method call from the peer; the daemon never sends these.
    Ignored(MethodCall),
}

#[derive(Default)]
struct Table {
    pending: HashMap<String, oneshot::Sender<Delivery>>,
    closed: Option<DisconnectReason>,
}

/// Table of in-flight calls keyed by correlation id.
#[derive(Default)]
pub struct Correlator {
    table: Mutex<Table>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call. Must happen before the request is sent.
    pub fn register(self: &Arc<Self>, id: impl Into<String>) -> Result<PendingCall, ClientError> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();

        {
            let mut table = self.table.lock();
            if let Some(ref reason) = table.closed {
                return Err(reason.clone().into());
            }
            if table.pending.contains_key(&id) {
                return Err(ClientError::DuplicateId(id));
            }
            table.pending.insert(id.clone(), tx);
        }

        tracing::trace!("registered id={}", id);
        Ok(PendingCall {
            id,
            rx,
            correlator: Arc::clone(self),
        })
    }

    /// Routes one inbound envelope.
    pub fn dispatch(&self, envelope: Envelope) -> Dispatch {
        match envelope {
            Envelope::Response(response) => {
                let slot = self.table.lock().pending.remove(&response.id);
                match slot {
                    Some(tx) => {
                        let id = response.id.clone();
                        if tx.send(Ok(response)).is_err() {
                            tracing::debug!("caller for id={} went away before delivery", id);
                        }
                        Dispatch::Delivered
                    }
                    None => {
                        tracing::debug!("no pending call for id={}, discarding", response.id);
                        Dispatch::Unmatched(response)
                    }
                }
            }
            Envelope::Event(event) => Dispatch::Event(event),
            Envelope::Call(call) => {
                tracing::warn!("ignoring inbound method call {}", call.method);
                Dispatch::Ignored(call)
            }
        }
    }

    /// Removes a registration without delivering. Returns whether it was present.
    pub fn revoke(&self, id: &str) -> bool {
        self.table.lock().pending.remove(id).is_some()
    }

    /// Fails every pending call and refuses new registrations.
    ///
    /// Returns the number of calls swept. The first close fixes the reason;
    /// later calls sweep with that same reason.
    pub fn close(&self, reason: DisconnectReason) -> usize {
        let (reason, drained): (_, Vec<_>) = {
            let mut table = self.table.lock();
            let reason = table.closed.get_or_insert(reason).clone();
            (reason, table.pending.drain().collect())
        };

        let count = drained.len();
        for (id, tx) in drained {
            tracing::debug!("failing pending id={} ({:?})", id, reason);
            let _ = tx.send(Err(reason.clone()));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.table.lock().closed.is_some()
    }

    /// Why the table was closed, if it was.
    pub fn close_reason(&self) -> Option<DisconnectReason> {
        self.table.lock().closed.clone()
    }

    /// Returns the number of pending calls.
    pub fn pending_count(&self) -> usize {
        self.table.lock().pending.len()
    }
}

/// A registered call waiting for its response.
///
/// Dropping it revokes the registration, so an abandoned wait never leaves
/// an entry behind.
pub struct PendingCall {
    id: String,
    rx: oneshot::Receiver<Delivery>,
    correlator: Arc<Correlator>,
}

impl PendingCall {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the response for at most `timeout`.
    pub async fn wait(self, timeout: Duration) -> Result<Response, ClientError> {
        self.wait_until(deadline_after(timeout)).await
    }

    /// Waits for the response until `deadline`.
    ///
    /// On deadline the registration is revoked and a late response is
    /// discarded by the dispatcher.
    pub async fn wait_until(mut self, deadline: Instant) -> Result<Response, ClientError> {
        match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(delivery) => Self::unwrap_delivery(delivery),
            Err(_) => {
                if self.correlator.revoke(&self.id) {
                    tracing::debug!("id={} timed out", self.id);
                    return Err(ClientError::Timeout);
                }
                // The dispatcher or the close sweep already claimed the slot
                // and is about to send on it.
                Self::unwrap_delivery((&mut self.rx).await)
            }
        }
    }

    fn unwrap_delivery<E>(delivery: Result<Delivery, E>) -> Result<Response, ClientError> {
        match delivery {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(reason)) => Err(reason.into()),
            Err(_) => Err(ClientError::ConnectionClosed),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.correlator.revoke(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mwrpc_protocol::EventKind;
    use serde_json::json;

    fn correlator() -> Arc<Correlator> {
        Arc::new(Correlator::new())
    }

    #[tokio::test]
    async fn test_out_of_order_delivery() {
        let correlator = correlator();
        let ids: Vec<String> = (0..5).map(|i| format!("req-{}", i)).collect();
        let pending: Vec<_> = ids
            .iter()
            .map(|id| correlator.register(id.clone()).unwrap())
            .collect();

        for (i, id) in ids.iter().enumerate().rev() {
            let delivered = correlator.dispatch(Envelope::Response(Response::ok(id, json!(i))));
            assert!(matches!(delivered, Dispatch::Delivered));
        }

        for (i, call) in pending.into_iter().enumerate() {
            let response = call.wait(Duration::from_secs(1)).await.unwrap();
            assert_eq!(response.id, format!("req-{}", i));
            assert_eq!(response.into_result(), Ok(json!(i)));
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_discarded() {
        let correlator = correlator();
        let slow = correlator.register("slow").unwrap();
        let other = correlator.register("other").unwrap();

        let err = slow.wait(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        assert_eq!(correlator.pending_count(), 1);

        let late = correlator.dispatch(Envelope::Response(Response::ok("slow", json!(1))));
        assert!(matches!(late, Dispatch::Unmatched(r) if r.id == "slow"));

        correlator.dispatch(Envelope::Response(Response::ok("other", json!(2))));
        let response = other.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.into_result(), Ok(json!(2)));
    }

    #[tokio::test]
    async fn test_close_fails_all_pending() {
        let correlator = correlator();
        let pending: Vec<_> = (0..4)
            .map(|i| correlator.register(format!("id-{}", i)).unwrap())
            .collect();

        assert_eq!(correlator.close(DisconnectReason::Closed), 4);
        assert_eq!(correlator.pending_count(), 0);

        for call in pending {
            let err = call.wait(Duration::from_secs(1)).await.unwrap_err();
            assert!(matches!(err, ClientError::ConnectionClosed));
        }
    }

    #[tokio::test]
    async fn test_transport_failure_reason() {
        let correlator = correlator();
        let call = correlator.register("a").unwrap();
        correlator.close(DisconnectReason::Transport("reset by peer".to_string()));

        let err = call.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(msg) if msg == "reset by peer"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_racing_deadline_is_kept() {
        let correlator = correlator();
        let call = correlator.register("race").unwrap();

        // The dispatcher has claimed the slot but not yet sent on it.
        let tx = correlator.table.lock().pending.remove("race").unwrap();
        let waiter = tokio::spawn(call.wait(Duration::from_millis(10)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(Ok(Response::ok("race", json!(7)))).unwrap();

        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response.into_result(), Ok(json!(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_wait() {
        let correlator = correlator();
        let call = correlator.register("forever").unwrap();
        let waiter = tokio::spawn(call.wait(Duration::MAX));

        tokio::time::sleep(Duration::from_secs(3600)).await;
        correlator.dispatch(Envelope::Response(Response::ok("forever", json!(1))));

        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response.into_result(), Ok(json!(1)));
    }

    #[test]
    fn test_deadline_after_clamps() {
        let now = Instant::now();
        assert!(deadline_after(Duration::MAX) >= now + MAX_WAIT);
        assert!(deadline_after(Duration::from_secs(1)) < now + Duration::from_secs(2));
    }

    #[test]
    fn test_later_close_keeps_first_reason() {
        let correlator = correlator();
        let transport = DisconnectReason::Transport("reset".to_string());
        correlator.close(transport.clone());
        assert_eq!(correlator.close(DisconnectReason::Closed), 0);
        assert_eq!(correlator.close_reason(), Some(transport));
    }

    #[test]
    fn test_register_after_close() {
        let correlator = correlator();
        correlator.close(DisconnectReason::Closed);
        assert!(correlator.is_closed());
        assert!(matches!(
            correlator.register("x"),
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let correlator = correlator();
        let _first = correlator.register("dup").unwrap();
        assert!(matches!(
            correlator.register("dup"),
            Err(ClientError::DuplicateId(id)) if id == "dup"
        ));
    }

    #[test]
    fn test_drop_revokes_registration() {
        let correlator = correlator();
        let call = correlator.register("gone").unwrap();
        assert_eq!(correlator.pending_count(), 1);
        drop(call);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_events_and_calls_not_correlated() {
        let correlator = correlator();
        let _call = correlator.register("1").unwrap();

        let event = Event::new(EventKind::Changed, "core.get_jobs").with_id(json!(1));
        assert!(matches!(
            correlator.dispatch(Envelope::Event(event)),
            Dispatch::Event(_)
        ));
        assert!(matches!(
            correlator.dispatch(Envelope::Call(MethodCall::new("1", "core.ping"))),
            Dispatch::Ignored(_)
        ));
        assert_eq!(correlator.pending_count(), 1);
    }
}
