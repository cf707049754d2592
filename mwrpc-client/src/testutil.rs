//! In-memory daemon for tests.

use crate::connection::{Connection, ConnectionConfig};
use futures_util::{SinkExt, StreamExt};
use mwrpc_protocol::{Decoder, Encoder, Envelope, Event, MethodCall, Response};
use tokio::io::DuplexStream;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Server side of an in-memory WebSocket.
pub(crate) struct MockDaemon {
    ws: WebSocketStream<DuplexStream>,
}

impl MockDaemon {
    /// Returns a connected client and the daemon end.
    pub async fn pair() -> (Connection, MockDaemon) {
        let conn = Connection::new(ConnectionConfig::new("ws://mock/websocket"));
        let daemon = Self::attach(&conn).await;
        (conn, daemon)
    }

    /// Attaches a fresh in-memory socket to `conn`.
    pub async fn attach(conn: &Connection) -> MockDaemon {
        let (server, client) = Self::raw_pair().await;
        conn.attach(client).await.unwrap();
        MockDaemon { ws: server }
    }

    /// Returns unattached `(server, client)` WebSocket ends.
    pub async fn raw_pair() -> (
        WebSocketStream<DuplexStream>,
        WebSocketStream<DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    /// Waits for the next method call from the client.
    pub async fn next_call(&mut self) -> MethodCall {
        loop {
            let msg = self
                .ws
                .next()
                .await
                .expect("client went away")
                .expect("read failed");
            if let Message::Text(text) = msg {
                if let Ok(Envelope::Call(call)) = Decoder::decode(text.as_str()) {
                    return call;
                }
            }
        }
    }

    pub async fn reply(&mut self, response: Response) {
        self.send_envelope(Envelope::Response(response)).await;
    }

    pub async fn push(&mut self, event: Event) {
        self.send_envelope(Envelope::Event(event)).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .unwrap();
    }

    async fn send_envelope(&mut self, envelope: Envelope) {
        let text = Encoder::encode(&envelope).unwrap();
        self.ws.send(Message::Text(text.into())).await.unwrap();
    }
}
