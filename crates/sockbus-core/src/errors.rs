//! Error taxonomy.
//!
//! Four families mirror how failures propagate through the bus:
//!
//! - [`TransportError`]: fatal to one session, triggers teardown
//! - [`ProtocolError`]: non-fatal, the offending frame is dropped
//! - [`BrokerError`]: reported to the session's error handler; subscribe
//!   failures surface to the caller
//! - [`RegistrationError`]: programmer error, returned from `on(...)` so the
//!   caller aborts startup
//!
//! [`TopicError`] covers reserved-name violations on join/leave/emit.
//! All of them fold into the umbrella [`Error`].

/// Failures of the duplex connection. Always fatal to the affected session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The underlying stream returned an error while reading.
    #[error("read failed: {0}")]
    Read(String),

    /// The underlying sink returned an error while writing.
    #[error("write failed: {0}")]
    Write(String),

    /// A write did not complete inside the configured write timeout.
    #[error("write timed out after {0} ms")]
    WriteTimeout(u64),

    /// No liveness reply arrived inside the pong-wait window.
    #[error("no pong received within {0} ms")]
    PongTimeout(u64),

    /// The peer sent a frame larger than the configured read limit.
    #[error("frame of {size} bytes exceeds read limit of {limit} bytes")]
    FrameTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// The connection is closed.
    #[error("connection closed")]
    Closed,
}

/// Malformed or unencodable frames. Never fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The frame does not start with the `42` event marker.
    #[error("frame is missing the event marker")]
    MissingMarker,

    /// The body after the marker is not valid JSON.
    #[error("invalid envelope json: {0}")]
    InvalidJson(String),

    /// The JSON is valid but not a `[event, payload]` array.
    #[error("bad envelope: {0}")]
    BadEnvelope(String),

    /// Serializing an outbound packet failed.
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Failures talking to the pub/sub broker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Publishing to a topic failed.
    #[error("publish to '{topic}' failed: {reason}")]
    Publish {
        /// Target topic.
        topic: String,
        /// Broker-provided reason.
        reason: String,
    },

    /// Subscribing (or unsubscribing) failed.
    #[error("subscribe to {topics:?} failed: {reason}")]
    Subscribe {
        /// Requested topics.
        topics: Vec<String>,
        /// Broker-provided reason.
        reason: String,
    },

    /// The subscription or broker connection has been closed.
    #[error("broker subscription closed")]
    Closed,
}

/// Handler registration failures. These indicate a coding defect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// The handler kind does not match what the event name requires.
    #[error("handler for '{event}' must be {expected}, got {found}")]
    ShapeMismatch {
        /// Event name being registered.
        event: String,
        /// Required handler kind.
        expected: &'static str,
        /// Supplied handler kind.
        found: &'static str,
    },

    /// The event name is reserved at this scope and cannot take a freeform handler.
    #[error("'{0}' is a reserved event name")]
    ReservedName(String),

    /// The event name is empty.
    #[error("event name must not be empty")]
    EmptyName,
}

/// Room and topic name violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    /// The topic is reserved for the bus itself.
    #[error("topic '{0}' is reserved")]
    Reserved(String),

    /// The topic lies in the per-session direct-message namespace.
    #[error("topic '{0}' is a session id")]
    SessionNamespace(String),

    /// The topic name is empty.
    #[error("topic name must not be empty")]
    Empty,
}

/// Umbrella error for the bus.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Connection failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Malformed frame or encode failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Broker failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Handler registration failure.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// Topic name violation.
    #[error(transparent)]
    Topic(#[from] TopicError),

    /// The server's control loop is no longer running.
    #[error("server is shut down")]
    ServerClosed,

    /// A user `onConnect` callback rejected the session.
    #[error("connect handler failed: {0}")]
    ConnectRejected(String),
}

impl Error {
    /// Whether this error ends the session it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ServerClosed)
    }
}

/// Convenience alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
