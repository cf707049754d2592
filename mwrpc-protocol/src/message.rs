//! Message envelopes exchanged with the daemon.
//!
//! On the wire every message is a flat JSON object discriminated by its
//! `msg` field. Decoding resolves that discriminant once into [`Envelope`],
//! so the rest of the client never probes loose maps by key.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Message kind, derived from the wire `msg` discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    MethodCall,
    Result,
    Error,
    Event,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::MethodCall => write!(f, "method-call"),
            MessageKind::Result => write!(f, "result"),
            MessageKind::Error => write!(f, "error"),
            MessageKind::Event => write!(f, "event"),
        }
    }
}

/// One logical message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Call(MethodCall),
    Response(Response),
    Event(Event),
}

impl Envelope {
    pub fn kind(&self) -> MessageKind {
        match self {
            Envelope::Call(_) => MessageKind::MethodCall,
            Envelope::Response(resp) if resp.is_error() => MessageKind::Error,
            Envelope::Response(_) => MessageKind::Result,
            Envelope::Event(_) => MessageKind::Event,
        }
    }

    /// Correlation id, if this kind of message carries one.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Envelope::Call(call) => Some(&call.id),
            Envelope::Response(resp) => Some(&resp.id),
            Envelope::Event(_) => None,
        }
    }
}

impl From<MethodCall> for Envelope {
    fn from(call: MethodCall) -> Self {
        Envelope::Call(call)
    }
}

impl From<Response> for Envelope {
    fn from(response: Response) -> Self {
        Envelope::Response(response)
    }
}

impl From<Event> for Envelope {
    fn from(event: Event) -> Self {
        Envelope::Event(event)
    }
}

/// Outbound method call.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    /// Unique request ID for correlation.
    pub id: String,
    /// Fully qualified method name, e.g. `core.job.query`.
    pub method: String,
    /// Positional parameters (or null).
    pub params: Value,
}

impl MethodCall {
    pub fn new(id: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params: Value::Null,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Response payload; a response carries either a result or an error, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Result(Value),
    Error(Value),
}

/// Inbound response to a method call.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Request ID this response correlates to.
    pub id: String,
    pub body: ResponseBody,
}

impl Response {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            body: ResponseBody::Result(result),
        }
    }

    pub fn error(id: impl Into<String>, error: Value) -> Self {
        Self {
            id: id.into(),
            body: ResponseBody::Error(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.body, ResponseBody::Result(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self.body, ResponseBody::Error(_))
    }

    /// Splits the response into its result or error payload.
    pub fn into_result(self) -> Result<Value, Value> {
        match self.body {
            ResponseBody::Result(value) => Ok(value),
            ResponseBody::Error(error) => Err(error),
        }
    }
}

/// Collection change kinds pushed by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Added,
    Changed,
    Removed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Added => "added",
            EventKind::Changed => "changed",
            EventKind::Removed => "removed",
        }
    }

    fn parse(msg: &str) -> Option<Self> {
        match msg {
            "added" => Some(EventKind::Added),
            "changed" => Some(EventKind::Changed),
            "removed" => Some(EventKind::Removed),
            _ => None,
        }
    }
}

/// Unsolicited event (e.g. `core.get_jobs` progress updates).
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    /// Collection the change belongs to.
    pub collection: String,
    /// Identifier of the changed item, if any.
    pub id: Option<Value>,
    /// Changed fields, if any.
    pub fields: Option<Value>,
}

impl Event {
    pub fn new(kind: EventKind, collection: impl Into<String>) -> Self {
        Self {
            kind,
            collection: collection.into(),
            id: None,
            fields: None,
        }
    }

    pub fn with_id(mut self, id: Value) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }
}

/// Flat on-the-wire shape shared by all message kinds.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
}

impl From<&Envelope> for WireMessage {
    fn from(envelope: &Envelope) -> Self {
        match envelope {
            Envelope::Call(call) => WireMessage {
                msg: Some("method".to_string()),
                id: Some(Value::String(call.id.clone())),
                method: Some(call.method.clone()),
                params: Some(call.params.clone()),
                ..Default::default()
            },
            // Errors use their own kind so a null error payload survives.
            Envelope::Response(resp) => {
                let (msg, result, error) = match &resp.body {
                    ResponseBody::Result(value) => ("result", Some(value.clone()), None),
                    ResponseBody::Error(error) => ("error", None, Some(error.clone())),
                };
                WireMessage {
                    msg: Some(msg.to_string()),
                    id: Some(Value::String(resp.id.clone())),
                    result,
                    error,
                    ..Default::default()
                }
            }
            Envelope::Event(event) => WireMessage {
                msg: Some(event.kind.as_str().to_string()),
                id: event.id.clone(),
                collection: Some(event.collection.clone()),
                fields: event.fields.clone(),
                ..Default::default()
            },
        }
    }
}

impl TryFrom<WireMessage> for Envelope {
    type Error = ProtocolError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let msg = wire.msg.ok_or(ProtocolError::MissingField("msg"))?;

        match msg.as_str() {
            "method" => Ok(Envelope::Call(MethodCall {
                id: string_id(wire.id)?,
                method: wire.method.ok_or(ProtocolError::MissingField("method"))?,
                params: wire.params.unwrap_or(Value::Null),
            })),
            "result" => {
                let id = string_id(wire.id)?;
                // A null error is the same as no error.
                let body = match wire.error {
                    Some(error) if !error.is_null() => ResponseBody::Error(error),
                    _ => ResponseBody::Result(wire.result.unwrap_or(Value::Null)),
                };
                Ok(Envelope::Response(Response { id, body }))
            }
            "error" => Ok(Envelope::Response(Response {
                id: string_id(wire.id)?,
                body: ResponseBody::Error(wire.error.unwrap_or(Value::Null)),
            })),
            other => match EventKind::parse(other) {
                Some(kind) => Ok(Envelope::Event(Event {
                    kind,
                    collection: wire
                        .collection
                        .ok_or(ProtocolError::MissingField("collection"))?,
                    id: wire.id,
                    fields: wire.fields,
                })),
                None => Err(ProtocolError::UnknownKind(other.to_string())),
            },
        }
    }
}

fn string_id(id: Option<Value>) -> Result<String, ProtocolError> {
    match id {
        Some(Value::String(id)) => Ok(id),
        Some(_) => Err(ProtocolError::InvalidField {
            field: "id",
            expected: "string",
        }),
        None => Err(ProtocolError::MissingField("id")),
    }
}
