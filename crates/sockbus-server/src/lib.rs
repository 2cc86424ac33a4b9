//! # sockbus-server
//!
//! Real-time event bus over WebSocket with horizontal fan-out through a
//! pub/sub broker.
//!
//! - [`Server`]: admits connections, owns server-scope handlers, runs the
//!   control loop that owns the session map
//! - [`Session`]: one client: inbound/outbound loops, rooms, handlers
//! - [`registry`]: typed handler shapes and per-scope tables
//! - [`transport`]: [`Connection`] abstraction with axum and in-memory adapters
//! - [`routes`]: axum router for the upgrade endpoint
//!
//! Every session is subscribed to its own id and to `server-broadcast`; rooms
//! are plain broker topics, so a message reaches every process that has a
//! session in the room.

#![deny(unsafe_code)]

pub mod metrics;
pub mod registry;
pub mod routes;
pub mod server;
pub mod session;
pub mod transport;

pub use registry::{HandlerError, ServerHandler, SessionHandler};
pub use server::{Server, WeakServer};
pub use session::{Metadata, Session, SessionState};
pub use transport::{Connection, Frame, PeerConnection};
