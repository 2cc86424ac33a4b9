//! Broker topic names and session ids.
//!
//! Rooms are not server-side entities; a room is just a broker topic. Three
//! namespaces are owned by the bus and are off-limits to user rooms:
//!
//! - [`SERVER_BROADCAST_TOPIC`]: every session on every process is subscribed
//! - [`CROSS_PROCESS_TOPIC`]: server-scope only, never delivered to sessions
//! - session ids: each session's direct-message topic

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::TopicError;

/// Topic every session subscribes to at admission.
pub const SERVER_BROADCAST_TOPIC: &str = "server-broadcast";

/// Topic carrying server-to-server payloads. Also the event name of its handler.
pub const CROSS_PROCESS_TOPIC: &str = "broadcast-to-server";

/// Unique id of a session, also the name of its direct topic.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh, time-ordered id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Borrow as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the inner `String`.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Whether `topic` is one of the bus-owned topic names.
pub fn is_reserved(topic: &str) -> bool {
    topic == SERVER_BROADCAST_TOPIC || topic == CROSS_PROCESS_TOPIC
}

/// Whether `topic` falls in the per-session direct-message namespace.
pub fn is_session_topic(topic: &str) -> bool {
    Uuid::parse_str(topic).is_ok()
}

/// Validate a room name for join/leave.
pub fn validate_room(room: &str) -> Result<(), TopicError> {
    if room.is_empty() {
        return Err(TopicError::Empty);
    }
    if is_reserved(room) {
        return Err(TopicError::Reserved(room.to_owned()));
    }
    if is_session_topic(room) {
        return Err(TopicError::SessionNamespace(room.to_owned()));
    }
    Ok(())
}

/// Validate a topic that an event envelope is published to.
///
/// Session ids and the broadcast topic are legal targets; the cross-process
/// topic is not, since envelopes there would reach server handlers.
pub fn validate_event_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic == CROSS_PROCESS_TOPIC {
        return Err(TopicError::Reserved(topic.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn generated_ids_are_unique_uuids() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(is_session_topic(a.as_str()));
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn session_id_serializes_as_plain_string() {
        let id = SessionId::from("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""abc""#);
        assert_eq!(id.to_string(), "abc");
    }

    #[test]
    fn ordinary_rooms_are_valid() {
        assert!(validate_room("lobby").is_ok());
        assert!(validate_room("game/42").is_ok());
    }

    #[test]
    fn reserved_rooms_rejected() {
        assert_matches!(
            validate_room(SERVER_BROADCAST_TOPIC),
            Err(TopicError::Reserved(_))
        );
        assert_matches!(
            validate_room(CROSS_PROCESS_TOPIC),
            Err(TopicError::Reserved(_))
        );
    }

    #[test]
    fn session_namespace_rejected() {
        let id = SessionId::generate();
        assert_matches!(
            validate_room(id.as_str()),
            Err(TopicError::SessionNamespace(_))
        );
    }

    #[test]
    fn empty_room_rejected() {
        assert_matches!(validate_room(""), Err(TopicError::Empty));
        assert_matches!(validate_event_topic(""), Err(TopicError::Empty));
    }

    #[test]
    fn event_topic_allows_sessions_and_broadcast() {
        assert!(validate_event_topic(SERVER_BROADCAST_TOPIC).is_ok());
        assert!(validate_event_topic(SessionId::generate().as_str()).is_ok());
        assert_matches!(
            validate_event_topic(CROSS_PROCESS_TOPIC),
            Err(TopicError::Reserved(_))
        );
    }
}
