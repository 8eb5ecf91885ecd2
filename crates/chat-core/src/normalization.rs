//! Validation of wire payloads into canonical messages.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{Message, MessageId, UserId};

const DERIVED_ID_NAMESPACE: Uuid = Uuid::from_u128(0x8f3e_52d1_0c4b_4c7e_9a61_3b2d_7e90_a4c5);

/// Why an inbound live payload was dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InboundRejected {
    #[error("payload does not match the message shape: {0}")]
    Shape(String),
    #[error("payload field '{0}' is missing or empty")]
    MissingField(&'static str),
    #[error("payload timestamp is invalid: {0}")]
    InvalidTimestamp(String),
}

/// A validated live message plus the sender's correlation id, when echoed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub message: Message,
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundPayload {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default, alias = "userId")]
    sender_id: Option<UserId>,
    #[serde(default, alias = "sender")]
    sender_name: Option<String>,
    #[serde(default)]
    timestamp: Option<Value>,
}

/// Outbound live payload, `{clientId, text, senderId, senderName, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundPayload {
    pub client_id: String,
    pub text: String,
    pub sender_id: UserId,
    pub sender_name: String,
    /// RFC 3339 timestamp with millisecond precision.
    pub timestamp: String,
}

impl OutboundPayload {
    pub fn from_provisional(message: &Message) -> Self {
        Self {
            client_id: message.id.as_str().to_owned(),
            text: message.text.clone(),
            sender_id: message.sender_id.clone(),
            sender_name: message.sender_name.clone(),
            timestamp: format_timestamp_ms(message.timestamp_ms),
        }
    }
}

/// Validate one inbound live payload.
///
/// Payloads without a server id get a deterministic id derived from sender,
/// timestamp and text, so a redelivered payload maps to the same id.
pub fn normalize_inbound(payload: &Value) -> Result<InboundMessage, InboundRejected> {
    // Derived struct deserialization would also accept a positional array.
    if !payload.is_object() {
        return Err(InboundRejected::Shape(format!(
            "expected an object, got {}",
            json_kind(payload)
        )));
    }
    let raw = InboundPayload::deserialize(payload)
        .map_err(|err| InboundRejected::Shape(err.to_string()))?;

    let text = raw
        .text
        .filter(|text| !text.trim().is_empty())
        .ok_or(InboundRejected::MissingField("text"))?;
    let sender_id = raw.sender_id.ok_or(InboundRejected::MissingField("senderId"))?;
    let sender_name = raw
        .sender_name
        .filter(|name| !name.trim().is_empty())
        .ok_or(InboundRejected::MissingField("senderName"))?;
    let timestamp = raw
        .timestamp
        .ok_or(InboundRejected::MissingField("timestamp"))?;
    let timestamp_ms = parse_timestamp_value(&timestamp)
        .ok_or_else(|| InboundRejected::InvalidTimestamp(timestamp.to_string()))?;

    let id = match raw.id.as_ref().and_then(server_id_from_value) {
        Some(id) => id,
        None => derived_message_id(&sender_id, timestamp_ms, &text),
    };

    Ok(InboundMessage {
        message: Message {
            id: MessageId::Server(id),
            text,
            sender_id,
            sender_name,
            timestamp_ms,
        },
        client_id: raw.client_id.filter(|id| !id.is_empty()),
    })
}

/// Interpret a JSON id (string or integer) as a server message id.
pub fn server_id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.trim().is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Parse a wire timestamp: RFC 3339 string or integer epoch milliseconds.
pub fn parse_timestamp_value(value: &Value) -> Option<u64> {
    match value {
        Value::String(raw) => parse_rfc3339_ms(raw).or_else(|| raw.trim().parse::<u64>().ok()),
        Value::Number(number) => number.as_u64(),
        _ => None,
    }
}

pub fn parse_rfc3339_ms(raw: &str) -> Option<u64> {
    let parsed = DateTime::parse_from_rfc3339(raw.trim()).ok()?;
    u64::try_from(parsed.timestamp_millis()).ok()
}

pub fn format_timestamp_ms(timestamp_ms: u64) -> String {
    let millis = i64::try_from(timestamp_ms).unwrap_or(i64::MAX);
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn derived_message_id(sender_id: &UserId, timestamp_ms: u64, text: &str) -> String {
    let name = format!("{sender_id}\u{1f}{timestamp_ms}\u{1f}{text}");
    format!(
        "derived-{}",
        Uuid::new_v5(&DERIVED_ID_NAMESPACE, name.as_bytes())
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn accepts_service_field_names() {
        let inbound = normalize_inbound(&json!({
            "id": 17,
            "text": "hello",
            "userId": 3,
            "sender": "alice",
            "timestamp": "2024-01-02T03:04:05.678Z",
        }))
        .expect("payload should normalize");

        assert_eq!(inbound.message.id, MessageId::Server("17".into()));
        assert_eq!(inbound.message.sender_id, UserId::new("3"));
        assert_eq!(inbound.message.sender_name, "alice");
        assert_eq!(inbound.message.timestamp_ms, 1_704_164_645_678);
        assert_eq!(inbound.client_id, None);
    }

    #[test]
    fn derives_stable_id_when_server_omits_it() {
        let payload = json!({
            "text": "hi",
            "senderId": "3",
            "senderName": "alice",
            "timestamp": 1_700_000_000_000_u64,
            "clientId": "tx-1",
        });
        let first = normalize_inbound(&payload).expect("first");
        let second = normalize_inbound(&payload).expect("second");
        assert_eq!(first.message.id, second.message.id);
        assert!(first.message.id.as_str().starts_with("derived-"));
        assert_eq!(first.client_id.as_deref(), Some("tx-1"));

        let other = normalize_inbound(&json!({
            "text": "hi again",
            "senderId": "3",
            "senderName": "alice",
            "timestamp": 1_700_000_000_000_u64,
        }))
        .expect("other");
        assert_ne!(first.message.id, other.message.id);
    }

    #[test]
    fn rejects_missing_or_blank_fields() {
        let missing_text = normalize_inbound(&json!({
            "senderId": 1, "senderName": "a", "timestamp": 1
        }));
        assert_eq!(missing_text, Err(InboundRejected::MissingField("text")));

        let blank_text = normalize_inbound(&json!({
            "text": "   ", "senderId": 1, "senderName": "a", "timestamp": 1
        }));
        assert_eq!(blank_text, Err(InboundRejected::MissingField("text")));

        let missing_sender = normalize_inbound(&json!({
            "text": "x", "senderName": "a", "timestamp": 1
        }));
        assert_eq!(
            missing_sender,
            Err(InboundRejected::MissingField("senderId"))
        );

        let bad_time = normalize_inbound(&json!({
            "text": "x", "senderId": 1, "senderName": "a", "timestamp": "yesterday"
        }));
        assert!(matches!(bad_time, Err(InboundRejected::InvalidTimestamp(_))));

        assert!(matches!(
            normalize_inbound(&json!(["not", "an", "object"])),
            Err(InboundRejected::Shape(_))
        ));
    }

    #[test]
    fn rejects_positional_arrays_and_scalars() {
        let positional = json!([5, null, "hi", 2, "bob", 1_000]);
        assert_eq!(
            normalize_inbound(&positional),
            Err(InboundRejected::Shape("expected an object, got an array".into()))
        );
        assert_eq!(
            normalize_inbound(&json!(null)),
            Err(InboundRejected::Shape("expected an object, got null".into()))
        );
        assert!(matches!(
            normalize_inbound(&json!("hi")),
            Err(InboundRejected::Shape(_))
        ));
    }

    #[test]
    fn outbound_payload_uses_wire_field_names() {
        let message = Message {
            id: MessageId::Local("tx-9".into()),
            text: "hello".into(),
            sender_id: UserId::new("3"),
            sender_name: "alice".into(),
            timestamp_ms: 1_704_164_645_678,
        };
        let value = serde_json::to_value(OutboundPayload::from_provisional(&message))
            .expect("payload should serialize");
        assert_eq!(
            value,
            json!({
                "clientId": "tx-9",
                "text": "hello",
                "senderId": "3",
                "senderName": "alice",
                "timestamp": "2024-01-02T03:04:05.678Z",
            })
        );
    }

    #[test]
    fn timestamp_formats_round_trip_through_parser() {
        let formatted = format_timestamp_ms(1_731_000_000_123);
        assert_eq!(parse_rfc3339_ms(&formatted), Some(1_731_000_000_123));
        assert_eq!(parse_timestamp_value(&json!("1731000000123")), Some(1_731_000_000_123));
        assert_eq!(parse_timestamp_value(&json!(null)), None);
    }
}
