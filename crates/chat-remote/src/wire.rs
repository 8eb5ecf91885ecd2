//! socket.io v4 framing over the Engine.IO v4 WebSocket transport.
//!
//! Only the packet kinds a chat client needs are modelled: the Engine.IO
//! open/close/ping/pong/message packets and the socket.io connect,
//! disconnect, event and connect-error packets on the default namespace.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Engine.IO pong, sent in reply to every server ping.
pub const PONG: &str = "3";
/// Event name used for chat messages in both directions.
pub const MESSAGE_EVENT: &str = "message";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("empty frame")]
    Empty,
    #[error("unknown engine packet type '{0}'")]
    UnknownEnginePacket(char),
    #[error("unknown socket packet type '{0}'")]
    UnknownSocketPacket(char),
    #[error("invalid packet payload: {0}")]
    Payload(String),
}

/// Parameters announced by the server in the Engine.IO open packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenHandshake),
    Close,
    Ping,
    Pong,
    Message(SocketPacket),
    Noop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    /// Connect acknowledgement, carrying the server payload (`{sid}`).
    Connect(Option<Value>),
    Disconnect,
    Event { name: String, args: Vec<Value> },
    /// Acknowledgement of an emitted event; not used by the chat protocol.
    Ack,
    /// The server refused the namespace connection, usually for auth.
    ConnectError(String),
}

#[derive(Serialize)]
struct ConnectAuth<'a> {
    token: &'a str,
}

/// Decode one text frame.
pub fn decode(frame: &str) -> Result<EnginePacket, WireError> {
    let mut chars = frame.chars();
    let kind = chars.next().ok_or(WireError::Empty)?;
    let rest = chars.as_str();

    match kind {
        '0' => serde_json::from_str(rest)
            .map(EnginePacket::Open)
            .map_err(|err| WireError::Payload(err.to_string())),
        '1' => Ok(EnginePacket::Close),
        '2' => Ok(EnginePacket::Ping),
        '3' => Ok(EnginePacket::Pong),
        '4' => decode_socket(rest).map(EnginePacket::Message),
        '6' => Ok(EnginePacket::Noop),
        other => Err(WireError::UnknownEnginePacket(other)),
    }
}

fn decode_socket(packet: &str) -> Result<SocketPacket, WireError> {
    let mut chars = packet.chars();
    let kind = chars.next().ok_or(WireError::Empty)?;
    let body = strip_ack_id(strip_namespace(chars.as_str()));

    match kind {
        '0' => Ok(SocketPacket::Connect(parse_optional_json(body)?)),
        '1' => Ok(SocketPacket::Disconnect),
        '2' => decode_event(body),
        '3' => Ok(SocketPacket::Ack),
        '4' => Ok(SocketPacket::ConnectError(connect_error_message(body))),
        other => Err(WireError::UnknownSocketPacket(other)),
    }
}

fn decode_event(body: &str) -> Result<SocketPacket, WireError> {
    let value: Value =
        serde_json::from_str(body).map_err(|err| WireError::Payload(err.to_string()))?;
    let Value::Array(mut items) = value else {
        return Err(WireError::Payload("event body is not an array".into()));
    };
    if items.is_empty() {
        return Err(WireError::Payload("event body is empty".into()));
    }
    let Value::String(name) = items.remove(0) else {
        return Err(WireError::Payload("event name is not a string".into()));
    };
    Ok(SocketPacket::Event { name, args: items })
}

fn connect_error_message(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => map
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("connection refused")
            .to_owned(),
        Ok(Value::String(message)) => message,
        _ if body.is_empty() => "connection refused".to_owned(),
        _ => body.to_owned(),
    }
}

// `/admin,{"x":1}` carries a namespace; the default namespace omits it.
fn strip_namespace(body: &str) -> &str {
    if body.starts_with('/') {
        return body.split_once(',').map_or("", |(_, rest)| rest);
    }
    body
}

fn strip_ack_id(body: &str) -> &str {
    body.trim_start_matches(|c: char| c.is_ascii_digit())
}

fn parse_optional_json(body: &str) -> Result<Option<Value>, WireError> {
    if body.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(body)
        .map(Some)
        .map_err(|err| WireError::Payload(err.to_string()))
}

/// socket.io CONNECT on the default namespace with `{token}` auth.
pub fn encode_connect(token: &str) -> Result<String, WireError> {
    let auth = serde_json::to_string(&ConnectAuth { token })
        .map_err(|err| WireError::Payload(err.to_string()))?;
    Ok(format!("40{auth}"))
}

/// socket.io EVENT `[name, payload]`.
pub fn encode_event<T: Serialize>(name: &str, payload: &T) -> Result<String, WireError> {
    let body = serde_json::to_string(&(name, payload))
        .map_err(|err| WireError::Payload(err.to_string()))?;
    Ok(format!("42{body}"))
}
