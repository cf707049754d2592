//! Connection management.
//!
//! A [`Connection`] owns one WebSocket. Writes from concurrent callers are
//! serialized behind an async mutex; a single spawned reader task decodes
//! every inbound frame and hands it to the [`Correlator`].

use crate::correlator::{deadline_after, Correlator, DisconnectReason, Dispatch};
use crate::error::ClientError;
use crate::tls;
use futures_util::sink::Sink;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use mwrpc_protocol::{Decoder, Encoder, Envelope, Event, MethodCall, Response, MAX_MESSAGE_SIZE};
use serde_json::Value;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{Connector, WebSocketStream};
use uuid::Uuid;

/// Default capacity for the unsolicited message channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Upper bound on the close handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// TLS configuration for `wss://` connections.
#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// Path to PEM-encoded CA certificate(s) for server verification.
    /// If None, the bundled webpki roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client certificate (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client private key (for mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification (INSECURE - development only).
    pub insecure: bool,
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL, e.g. `wss://nas.local/websocket`.
    pub url: String,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Capacity of the unsolicited message channel.
    pub event_capacity: usize,
    /// TLS configuration, used for `wss://` URLs.
    pub tls: TlsClientConfig,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            event_capacity: EVENT_CHANNEL_CAPACITY,
            tls: TlsClientConfig::default(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = tls_config;
        self
    }

    fn is_secure(&self) -> bool {
        self.url.starts_with("wss://")
    }
}

/// Connection lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Closing,
    Closed,
}

/// Inbound message that no caller was waiting for.
#[derive(Debug, Clone)]
pub enum Unsolicited {
    /// Pushed event.
    Event(Event),
    /// Response whose id is unknown or already abandoned.
    Unmatched(Response),
}

/// A connection to the daemon.
pub struct Connection {
    config: ConnectionConfig,
    /// Write half of the socket.
    writer: Mutex<Option<FrameSink>>,
    /// Pending calls waiting for responses.
    correlator: Arc<Correlator>,
    state: Arc<watch::Sender<ConnectionState>>,
    /// Broadcast channel for events and orphaned responses.
    unsolicited: broadcast::Sender<Unsolicited>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        let (unsolicited, _) = broadcast::channel(config.event_capacity);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            writer: Mutex::new(None),
            correlator: Arc::new(Correlator::new()),
            state: Arc::new(state),
            unsolicited,
            reader: parking_lot::Mutex::new(None),
        }
    }

    /// Subscribes to events and unmatched responses.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Unsolicited> {
        self.unsolicited.subscribe()
    }

    /// Dials the configured URL and starts the reader task.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.ensure_connectable()?;
        tracing::debug!("Connecting to {}...", self.config.url);

        let request = self.config.url.as_str().into_client_request()?;
        let connector = if self.config.is_secure() {
            Some(Connector::Rustls(tls::client_config(&self.config.tls)?))
        } else {
            None
        };

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(MAX_MESSAGE_SIZE);

        let (ws, _) = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async_tls_with_config(
                request,
                Some(ws_config),
                true,
                connector,
            ),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::Timeout
        })?
        .map_err(|e| {
            tracing::debug!("Connection failed: {}", e);
            ClientError::from(e)
        })?;

        tracing::debug!("WebSocket connected");
        self.attach(ws).await
    }

    /// Adopts an already-established WebSocket and starts the reader task.
    pub async fn attach<S>(&self, ws: WebSocketStream<S>) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut writer = self.writer.lock().await;
        self.ensure_connectable()?;

        let (sink, stream) = ws.split();
        *writer = Some(Box::pin(sink));

        let task = tokio::spawn(read_loop(
            stream,
            Arc::clone(&self.correlator),
            self.unsolicited.clone(),
            Arc::clone(&self.state),
        ));
        *self.reader.lock() = Some(task);

        advance(&self.state, ConnectionState::Connected);
        Ok(())
    }

    fn ensure_connectable(&self) -> Result<(), ClientError> {
        match self.state() {
            ConnectionState::Disconnected => Ok(()),
            ConnectionState::Connected => Err(ClientError::Transport(
                "connection already established".to_string(),
            )),
            ConnectionState::Closing | ConnectionState::Closed => {
                Err(ClientError::ConnectionClosed)
            }
        }
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        match self.state() {
            ConnectionState::Disconnected => Err(ClientError::NotConnected),
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => {
                Err(ClientError::ConnectionClosed)
            }
        }
    }

    /// Writes one envelope.
    ///
    /// Frames from concurrent senders never interleave. A send blocked on a
    /// stalled socket fails with `ConnectionClosed` once close begins.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), ClientError> {
        self.ensure_open()?;
        let text = Encoder::encode(envelope)?;
        let mut closing = self.state.subscribe();

        let mut writer = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = closing.wait_for(|s| *s >= ConnectionState::Closing) => {
                return Err(ClientError::ConnectionClosed);
            }
        };
        let sink = writer.as_mut().ok_or(ClientError::ConnectionClosed)?;

        let result = tokio::select! {
            res = sink.send(Message::Text(text.into())) => res,
            _ = closing.wait_for(|s| *s >= ConnectionState::Closing) => {
                return Err(ClientError::ConnectionClosed);
            }
        };

        if let Err(e) = result {
            tracing::debug!("write failed: {}", e);
            writer.take();
            let err = ClientError::from(e);
            let reason = match err {
                ClientError::ConnectionClosed => DisconnectReason::Closed,
                ref other => DisconnectReason::Transport(other.to_string()),
            };
            advance(&self.state, ConnectionState::Closed);
            self.correlator.close(reason);
            return Err(err);
        }
        Ok(())
    }

    /// Sends a method call and waits for its response.
    ///
    /// `timeout` bounds both the write and the wait. Exactly one frame is
    /// written; nothing is retried.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        self.ensure_open()?;
        let deadline = deadline_after(timeout);

        let id = Uuid::new_v4().to_string();
        tracing::debug!("Sending request id={} method={}", id, method);
        let call = MethodCall::new(&id, method).with_params(params);

        // Register before sending so a fast response cannot be missed.
        let pending = self.correlator.register(id.clone())?;

        tokio::time::timeout_at(deadline, self.send(&Envelope::Call(call)))
            .await
            .map_err(|_| {
                tracing::debug!("Request id={} timed out while sending", id);
                ClientError::Timeout
            })??;

        let response = pending.wait_until(deadline).await?;
        tracing::debug!("Request id={} got response", id);
        Ok(response)
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Closes the connection and releases the socket. Idempotent.
    ///
    /// Pending calls fail with `ConnectionClosed`. The write half and the
    /// reader task are released even when the peer already disconnected.
    pub async fn close(&self) -> Result<(), ClientError> {
        if advance(&self.state, ConnectionState::Closing) {
            tracing::debug!("Closing connection...");
        }

        let swept = self.correlator.close(DisconnectReason::Closed);
        tracing::debug!("Failed {} pending requests", swept);

        if let Some(mut sink) = self.writer.lock().await.take() {
            tracing::debug!("Sending close frame");
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
        }

        let reader = self.reader.lock().take();
        if let Some(task) = reader {
            let _ = task.await;
        }

        advance(&self.state, ConnectionState::Closed);
        tracing::debug!("Connection closed");
        Ok(())
    }

    /// Returns the number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.correlator.pending_count()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.reader.get_mut().take() {
            task.abort();
        }
        self.correlator.close(DisconnectReason::Closed);
    }
}

/// Moves the state forward; returns false if `next` is not ahead of the
/// current state.
fn advance(state: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    state.send_if_modified(|current| {
        if next > *current {
            *current = next;
            true
        } else {
            false
        }
    })
}

/// Sole consumer of the inbound stream.
async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    correlator: Arc<Correlator>,
    unsolicited: broadcast::Sender<Unsolicited>,
    state: Arc<watch::Sender<ConnectionState>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::debug!("read_loop started");
    let mut closing = state.subscribe();

    let reason = loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = closing.wait_for(|s| *s >= ConnectionState::Closing) => {
                break DisconnectReason::Closed;
            }
        };

        let decoded = match frame {
            Some(Ok(Message::Text(text))) => Decoder::decode(text.as_str()),
            Some(Ok(Message::Binary(bytes))) => Decoder::decode_bytes(&bytes),
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!("read_loop: peer closed ({:?})", frame);
                break DisconnectReason::Closed;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!("read_loop: transport error: {}", e);
                break DisconnectReason::Transport(e.to_string());
            }
            None => {
                tracing::debug!("read_loop: stream ended");
                break DisconnectReason::Closed;
            }
        };

        let envelope = match decoded {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("read_loop: dropping undecodable frame: {}", e);
                continue;
            }
        };

        match correlator.dispatch(envelope) {
            Dispatch::Delivered | Dispatch::Ignored(_) => {}
            // No receivers is fine.
            Dispatch::Event(event) => {
                let _ = unsolicited.send(Unsolicited::Event(event));
            }
            Dispatch::Unmatched(response) => {
                let _ = unsolicited.send(Unsolicited::Unmatched(response));
            }
        }
    };

    advance(&state, ConnectionState::Closed);
    let swept = correlator.close(reason);
    tracing::debug!("read_loop finished, failed {} pending requests", swept);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockDaemon;
    use mwrpc_protocol::ResponseBody;
    use serde_json::json;

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new("ws://127.0.0.1/websocket");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.event_capacity, EVENT_CHANNEL_CAPACITY);
        assert!(!config.is_secure());
        assert!(ConnectionConfig::new("wss://nas/websocket").is_secure());
    }

    #[test]
    fn test_state_only_moves_forward() {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        assert!(advance(&state, ConnectionState::Connected));
        assert!(advance(&state, ConnectionState::Closed));
        assert!(!advance(&state, ConnectionState::Closing));
        assert_eq!(*state.borrow(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_request_before_connect() {
        let conn = Connection::new(ConnectionConfig::new("ws://127.0.0.1/websocket"));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        let err = conn
            .request("core.ping", Value::Null, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn test_request_response() {
        let (conn, mut daemon) = MockDaemon::pair().await;

        let request = tokio::spawn(async move {
            let resp = conn
                .request("core.ping", Value::Null, Duration::from_secs(5))
                .await;
            (conn, resp)
        });

        let call = daemon.next_call().await;
        assert_eq!(call.method, "core.ping");
        assert_eq!(call.params, Value::Null);
        daemon.reply(Response::ok(&call.id, json!("pong"))).await;

        let (conn, resp) = request.await.unwrap();
        assert_eq!(resp.unwrap().body, ResponseBody::Result(json!("pong")));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (conn, mut daemon) = MockDaemon::pair().await;
        let conn = Arc::new(conn);

        let mut tasks = Vec::new();
        for i in 0..3 {
            let conn = Arc::clone(&conn);
            tasks.push(tokio::spawn(async move {
                conn.request("test.echo", json!([i]), Duration::from_secs(5))
                    .await
            }));
        }

        let mut calls = Vec::new();
        for _ in 0..3 {
            calls.push(daemon.next_call().await);
        }
        for call in calls.iter().rev() {
            daemon.reply(Response::ok(&call.id, call.params[0].clone())).await;
        }

        for (i, task) in tasks.into_iter().enumerate() {
            let resp = task.await.unwrap().unwrap();
            assert_eq!(resp.into_result(), Ok(json!(i)));
        }
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_not_fatal() {
        let (conn, mut daemon) = MockDaemon::pair().await;
        let conn = Arc::new(conn);

        let task = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                conn.request("core.ping", Value::Null, Duration::from_secs(5))
                    .await
            })
        };

        let call = daemon.next_call().await;
        daemon.send_raw("{not json").await;
        daemon.send_raw(r#"{"id":"x","result":1}"#).await;
        daemon.reply(Response::ok(&call.id, json!("pong"))).await;

        assert!(task.await.unwrap().is_ok());
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let (conn, mut daemon) = MockDaemon::pair().await;
        let conn = Arc::new(conn);

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let conn = Arc::clone(&conn);
            tasks.push(tokio::spawn(async move {
                conn.request("slow.method", Value::Null, Duration::from_secs(60))
                    .await
            }));
        }
        for _ in 0..3 {
            daemon.next_call().await;
        }
        assert_eq!(conn.pending_count(), 3);

        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, ClientError::ConnectionClosed));
        }

        let err = conn
            .request("core.ping", Value::Null, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_peer_disconnect_fails_pending_calls() {
        let (conn, mut daemon) = MockDaemon::pair().await;
        let conn = Arc::new(conn);

        let task = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                conn.request("slow.method", Value::Null, Duration::from_secs(60))
                    .await
            })
        };
        daemon.next_call().await;
        drop(daemon);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ClientError::ConnectionClosed | ClientError::Transport(_)
        ));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_after_peer_disconnect_releases_socket() {
        let (conn, daemon) = MockDaemon::pair().await;
        drop(daemon);

        conn.state
            .subscribe()
            .wait_for(|s| *s == ConnectionState::Closed)
            .await
            .unwrap();
        assert!(conn.writer.lock().await.is_some());

        conn.close().await.unwrap();
        assert!(conn.writer.lock().await.is_none());
        assert!(conn.reader.lock().is_none());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_send_fails_on_close() {
        // The daemon never reads, so a frame larger than the pipe stalls.
        let (conn, _daemon) = MockDaemon::pair().await;
        let conn = Arc::new(conn);

        let task = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let blob = "x".repeat(1024 * 1024);
                conn.request("filesystem.put", json!([blob]), Duration::from_secs(60))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());
        assert_eq!(conn.pending_count(), 1);

        conn.close().await.unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_events_and_late_responses_broadcast() {
        let (conn, mut daemon) = MockDaemon::pair().await;
        let mut events = conn.subscribe_events();

        daemon
            .push(Event::new(mwrpc_protocol::EventKind::Changed, "core.get_jobs").with_id(json!(3)))
            .await;
        daemon.reply(Response::ok("nobody-waits", json!(1))).await;

        match events.recv().await.unwrap() {
            Unsolicited::Event(event) => assert_eq!(event.collection, "core.get_jobs"),
            other => panic!("unexpected {:?}", other),
        }
        match events.recv().await.unwrap() {
            Unsolicited::Unmatched(resp) => assert_eq!(resp.id, "nobody-waits"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_attach_twice_rejected() {
        let (conn, _daemon) = MockDaemon::pair().await;
        let (_, other) = MockDaemon::raw_pair().await;
        assert!(conn.attach(other).await.is_err());
    }
}
