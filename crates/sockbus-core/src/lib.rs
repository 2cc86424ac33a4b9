//! # sockbus-core
//!
//! Foundation types shared by every sockbus crate.
//!
//! - **Errors**: [`errors::Error`] and the per-concern enums behind it
//!   (transport, protocol, broker, registration, topic)
//! - **Wire codec**: [`codec`] handshake packets, heartbeat packets, and the
//!   `42["event","payload"]` event envelope
//! - **Topics**: [`topics`] reserved topic names, [`topics::SessionId`], and
//!   room-name validation
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by all other sockbus crates.

#![deny(unsafe_code)]

pub mod codec;
pub mod errors;
pub mod topics;

pub use errors::{Error, Result};
