//! Wire envelope encode/decode (spec §4.1).
//!
//! The outer frame is always `{"event": ..., "channel"?: ..., "data": ...}`.
//! On the wire `data` is a JSON-encoded *string* even when it represents a
//! nested object — Reverb/Pusher never nest raw JSON under `data`. The codec
//! hides this from callers: [`decode`] eagerly parses a string `data` back
//! into a [`serde_json::Value`] when it looks like JSON, and [`encode`]
//! re-serializes a structured `data` into a string before it ever reaches
//! the socket. Callers above this module never see the wire representation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A decoded Pusher/Reverb protocol envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Event name, e.g. `"pusher:ping"` or `"App\\Events\\OrderShipped"`.
    pub event: String,
    /// Channel name, absent for connection-scoped events.
    pub channel: Option<String>,
    /// Decoded payload. `Value::Null` when the envelope carried no `data`.
    pub data: Value,
}

impl Envelope {
    /// Build an envelope with no channel and no data.
    #[must_use]
    pub fn bare(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            channel: None,
            data: Value::Null,
        }
    }

    /// Build an envelope scoped to a channel.
    #[must_use]
    pub fn for_channel(event: impl Into<String>, channel: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            channel: Some(channel.into()),
            data,
        }
    }
}

/// On-wire shape. `data` is always a string (or absent) at this layer.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
}

/// Encode an [`Envelope`] into the bytes Reverb expects on the wire.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the structured `data` cannot be
/// serialized (it always can for any `serde_json::Value`, but the
/// fallible `serde_json` call is kept explicit rather than `expect`ed).
pub fn encode(envelope: &Envelope) -> Result<String> {
    let data = match &envelope.data {
        Value::Null => None,
        value => Some(
            serde_json::to_string(value)
                .map_err(|e| Error::Protocol(format!("failed to encode data: {e}")))?,
        ),
    };

    let wire = WireEnvelope {
        event: envelope.event.clone(),
        channel: envelope.channel.clone(),
        data,
    };

    serde_json::to_string(&wire).map_err(|e| Error::Protocol(format!("failed to encode envelope: {e}")))
}

/// Decode bytes received from the transport into an [`Envelope`].
///
/// Malformed outer JSON yields [`Error::Protocol`]. An unparseable inner
/// `data` string is never an error — it is preserved as a JSON string value
/// so callers still see *something*, per spec §4.1 ("decoding never throws
/// on an unparseable inner data").
pub fn decode(bytes: &str) -> Result<Envelope> {
    let wire: WireEnvelope = serde_json::from_str(bytes)
        .map_err(|e| Error::Protocol(format!("malformed envelope: {e}")))?;

    let data = match wire.data {
        None => Value::Null,
        Some(raw) => decode_inner_data(raw),
    };

    Ok(Envelope {
        event: wire.event,
        channel: wire.channel,
        data,
    })
}

/// Decode the inner `data` string, falling back to the raw string if it
/// doesn't parse as JSON. Mirrors the "starts with `{`, `[`, or a quoted/
/// literal token" heuristic from spec §4.1, but in practice we just attempt
/// the parse and fall back — cheaper and equally correct since
/// `serde_json` rejects anything that isn't valid JSON regardless of the
/// leading character.
fn decode_inner_data(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_bare_event() {
        let envelope = Envelope::bare("pusher:pong");
        let wire = encode(&envelope).unwrap();
        let decoded = decode(&wire).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn round_trips_structured_data() {
        let envelope = Envelope::for_channel(
            "pusher_internal:subscription_succeeded",
            "presence-chat.1",
            json!({"hash": {"u1": {"name": "alice"}}}),
        );
        let wire = encode(&envelope).unwrap();
        assert!(wire.contains("\"data\":\"{"), "data must be double-encoded: {wire}");
        let decoded = decode(&wire).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn decode_preserves_unparseable_inner_data() {
        let wire = r#"{"event":"custom","data":"not json at all"}"#;
        let decoded = decode(wire).unwrap();
        assert_eq!(decoded.data, Value::String("not json at all".to_string()));
    }

    #[test]
    fn decode_rejects_malformed_outer_json() {
        let err = decode("{not json").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn decode_handshake_scenario() {
        // spec §8 scenario 1
        let wire = r#"{"event":"pusher:connection_established","data":"{\"socket_id\":\"416200246.685575608\",\"activity_timeout\":30}"}"#;
        let decoded = decode(wire).unwrap();
        assert_eq!(decoded.event, "pusher:connection_established");
        assert_eq!(
            decoded.data["socket_id"],
            json!("416200246.685575608")
        );
        assert_eq!(decoded.data["activity_timeout"], json!(30));
    }

    #[test]
    fn encode_omits_absent_channel() {
        let envelope = Envelope::bare("pusher:ping");
        let wire = encode(&envelope).unwrap();
        assert!(!wire.contains("channel"));
    }
}
