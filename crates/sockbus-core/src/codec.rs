//! Wire codec for the duplex connection.
//!
//! The framing is compatible with the Engine.IO / Socket.IO text protocol so
//! unmodified browser clients can attach:
//!
//! | Direction | Frame | Meaning |
//! |-----------|-------|---------|
//! | server → client | `0{"sid":…,"upgrades":[],"pingInterval":…,"pingTimeout":…}` | open |
//! | server → client | `40` | connected |
//! | client → server | `2` | heartbeat probe, answered with `3` |
//! | client → server | `41` | client-initiated disconnect |
//! | both | `42["event","payload"]` | event envelope |
//!
//! The codec is stateless; every function is a pure translation.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::errors::ProtocolError;

/// Prefix of every event envelope.
pub const EVENT_MARKER: &str = "42";
/// Sent right after the open packet.
pub const CONNECT_PACKET: &str = "40";
/// Heartbeat probe.
pub const PING_PACKET: &str = "2";
/// Heartbeat reply.
pub const PONG_PACKET: &str = "3";
/// Client-initiated namespace disconnect.
pub const DISCONNECT_PACKET: &str = "41";

const OPEN_PREFIX: &str = "0";

/// Body of the handshake open packet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPacket {
    /// Session id assigned at admission.
    pub sid: String,
    /// Transport upgrades on offer. Always empty: only one transport exists.
    pub upgrades: Vec<String>,
    /// Advertised ping interval in milliseconds.
    pub ping_interval: u64,
    /// Advertised ping timeout in milliseconds.
    pub ping_timeout: u64,
}

impl OpenPacket {
    /// Open packet for `sid` with no upgrades.
    pub fn new(sid: impl Into<String>, ping_interval: u64, ping_timeout: u64) -> Self {
        Self {
            sid: sid.into(),
            upgrades: Vec::new(),
            ping_interval,
            ping_timeout,
        }
    }

    /// Encode as `0{json}`.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let body = serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(format!("{OPEN_PREFIX}{body}"))
    }
}

/// The two handshake frames, in the order they must be written.
pub fn handshake(
    sid: &str,
    ping_interval: u64,
    ping_timeout: u64,
) -> Result<[String; 2], ProtocolError> {
    let open = OpenPacket::new(sid, ping_interval, ping_timeout).encode()?;
    Ok([open, CONNECT_PACKET.to_string()])
}

/// A decoded `[event, payload]` unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Event name.
    pub event: String,
    /// Payload, always a string. Structured payloads are caller-encoded.
    pub payload: String,
}

impl Envelope {
    /// Build an envelope.
    pub fn new(event: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            payload: payload.into(),
        }
    }

    /// Encode as `42["event","payload"]`.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        encode_event(&self.event, &self.payload)
    }
}

/// Encode an event envelope.
pub fn encode_event(event: &str, payload: &str) -> Result<String, ProtocolError> {
    let body =
        serde_json::to_string(&[event, payload]).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(format!("{EVENT_MARKER}{body}"))
}

/// Decode an event envelope.
///
/// The second array element may be any JSON value: strings yield their
/// contents, everything else yields its JSON text exactly as received. A
/// one-element array yields an empty payload.
pub fn decode_event(frame: &str) -> Result<Envelope, ProtocolError> {
    let body = frame
        .strip_prefix(EVENT_MARKER)
        .ok_or(ProtocolError::MissingMarker)?;
    let mut items: Vec<Box<RawValue>> = serde_json::from_str(body).map_err(|e| {
        if e.is_data() {
            ProtocolError::BadEnvelope("expected a json array".into())
        } else {
            ProtocolError::InvalidJson(e.to_string())
        }
    })?;
    if items.is_empty() || items.len() > 2 {
        return Err(ProtocolError::BadEnvelope(format!(
            "expected 1 or 2 elements, got {}",
            items.len()
        )));
    }

    let payload = if items.len() == 2 {
        items.pop().map(|raw| raw_payload(&raw)).transpose()?.unwrap_or_default()
    } else {
        String::new()
    };

    let event = items
        .pop()
        .and_then(|raw| serde_json::from_str::<String>(raw.get()).ok())
        .ok_or_else(|| ProtocolError::BadEnvelope("event name must be a string".into()))?;

    Ok(Envelope { event, payload })
}

fn raw_payload(raw: &RawValue) -> Result<String, ProtocolError> {
    let text = raw.get();
    if text.starts_with('"') {
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    } else {
        Ok(text.to_owned())
    }
}

/// Any inbound text frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    /// `2`: must be answered with `3`.
    Ping,
    /// `3`: heartbeat reply from the client.
    Pong,
    /// `41`: the client is leaving.
    Disconnect,
    /// Any other all-digit frame. Ignored.
    Control(u32),
    /// `42[...]` event envelope.
    Event(Envelope),
}

/// Classify and decode one inbound text frame.
pub fn decode_packet(frame: &str) -> Result<Packet, ProtocolError> {
    if !frame.is_empty() && frame.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(match frame {
            PING_PACKET => Packet::Ping,
            PONG_PACKET => Packet::Pong,
            DISCONNECT_PACKET => Packet::Disconnect,
            other => Packet::Control(
                other
                    .parse()
                    .map_err(|_| ProtocolError::BadEnvelope(format!("control packet '{other}'")))?,
            ),
        });
    }
    decode_event(frame).map(Packet::Event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    #[test]
    fn open_packet_wire_format() {
        let open = OpenPacket::new("abc", 30_000, 60_000).encode().unwrap();
        assert_eq!(
            open,
            r#"0{"sid":"abc","upgrades":[],"pingInterval":30000,"pingTimeout":60000}"#
        );
    }

    #[test]
    fn handshake_is_open_then_connect() {
        let [open, connect] = handshake("sid-1", 30_000, 60_000).unwrap();
        assert!(open.starts_with("0{"));
        assert_eq!(connect, "40");
    }

    #[test]
    fn encode_event_wire_format() {
        assert_eq!(
            encode_event("msg", "hello").unwrap(),
            r#"42["msg","hello"]"#
        );
    }

    #[test]
    fn encode_escapes_quotes() {
        let frame = encode_event("msg", r#"{"a":"b"}"#).unwrap();
        assert_eq!(frame, r#"42["msg","{\"a\":\"b\"}"]"#);
        assert_eq!(decode_event(&frame).unwrap().payload, r#"{"a":"b"}"#);
    }

    #[test]
    fn decode_string_payload() {
        let env = decode_event(r#"42["chat","hi there"]"#).unwrap();
        assert_eq!(env, Envelope::new("chat", "hi there"));
    }

    #[test]
    fn decode_structured_payload_as_json_text() {
        let env = decode_event(r#"42["chat",{"text":"hi","n":1}]"#).unwrap();
        assert_eq!(env.event, "chat");
        assert_eq!(env.payload, r#"{"text":"hi","n":1}"#);
    }

    #[test]
    fn decode_keeps_large_integers_verbatim() {
        let env = decode_event(r#"42["n",12345678901234567890123]"#).unwrap();
        assert_eq!(env.payload, "12345678901234567890123");

        let env = decode_event(r#"42["n",[1.10,{"z":0,"a":1}]]"#).unwrap();
        assert_eq!(env.payload, r#"[1.10,{"z":0,"a":1}]"#);
    }

    #[test]
    fn decode_null_payload_as_json_text() {
        let env = decode_event(r#"42["ping",null]"#).unwrap();
        assert_eq!(env.payload, "null");
    }

    #[test]
    fn decode_numeric_payload() {
        let env = decode_event(r#"42["count",7]"#).unwrap();
        assert_eq!(env.payload, "7");
    }

    #[test]
    fn decode_single_element_has_empty_payload() {
        let env = decode_event(r#"42["ready"]"#).unwrap();
        assert_eq!(env, Envelope::new("ready", ""));
    }

    #[test]
    fn decode_rejects_missing_marker() {
        assert_matches!(
            decode_event(r#"["msg","x"]"#),
            Err(ProtocolError::MissingMarker)
        );
    }

    #[test]
    fn decode_rejects_invalid_json() {
        assert_matches!(
            decode_event(r#"42["msg","#),
            Err(ProtocolError::InvalidJson(_))
        );
    }

    #[test]
    fn decode_rejects_non_array() {
        assert_matches!(
            decode_event(r#"42{"event":"msg"}"#),
            Err(ProtocolError::BadEnvelope(_))
        );
    }

    #[test]
    fn decode_rejects_empty_and_oversized_arrays() {
        assert_matches!(decode_event("42[]"), Err(ProtocolError::BadEnvelope(_)));
        assert_matches!(
            decode_event(r#"42["a","b","c"]"#),
            Err(ProtocolError::BadEnvelope(_))
        );
    }

    #[test]
    fn decode_rejects_non_string_event() {
        assert_matches!(
            decode_event(r#"42[1,"x"]"#),
            Err(ProtocolError::BadEnvelope(_))
        );
        assert_matches!(decode_event("42[1]"), Err(ProtocolError::BadEnvelope(_)));
    }

    #[test]
    fn packet_classification() {
        assert_eq!(decode_packet("2").unwrap(), Packet::Ping);
        assert_eq!(decode_packet("3").unwrap(), Packet::Pong);
        assert_eq!(decode_packet("41").unwrap(), Packet::Disconnect);
        assert_eq!(decode_packet("42").unwrap(), Packet::Control(42));
        assert_eq!(decode_packet("1").unwrap(), Packet::Control(1));
        assert_matches!(
            decode_packet(r#"42["a","b"]"#).unwrap(),
            Packet::Event(env) if env.event == "a" && env.payload == "b"
        );
    }

    #[test]
    fn empty_frame_is_malformed() {
        assert_matches!(decode_packet(""), Err(ProtocolError::MissingMarker));
    }

    #[test]
    fn overlong_digit_frame_is_malformed() {
        assert_matches!(
            decode_packet("99999999999999999999"),
            Err(ProtocolError::BadEnvelope(_))
        );
    }

    proptest! {
        #[test]
        fn envelope_round_trip(event in "\\PC*", payload in "\\PC*") {
            let frame = encode_event(&event, &payload).unwrap();
            let env = decode_event(&frame).unwrap();
            prop_assert_eq!(env.event, event);
            prop_assert_eq!(env.payload, payload);
        }

        #[test]
        fn envelope_never_classified_as_control(event in "\\PC*", payload in "\\PC*") {
            let frame = encode_event(&event, &payload).unwrap();
            let is_event = matches!(decode_packet(&frame), Ok(Packet::Event(_)));
            prop_assert!(is_event);
        }
    }
}
