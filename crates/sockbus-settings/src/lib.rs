//! # sockbus-settings
//!
//! Configuration for the sockbus connection lifecycle.
//!
//! Settings are resolved from three layers (in priority order):
//! 1. **Compiled defaults**: [`BusSettings::default()`]
//! 2. **Settings file**: a JSON file deep-merged over defaults
//! 3. **Environment variables**: `SOCKBUS_*` overrides (highest priority)
//!
//! The server takes a resolved [`BusSettings`] by value at construction;
//! there is no global instance.
//!
//! # Usage
//!
//! ```no_run
//! use sockbus_settings::{load_settings_from_path, BusSettings};
//!
//! let settings = load_settings_from_path("sockbus.json".as_ref()).unwrap_or_default();
//! println!("pong wait: {:?}", settings.pong_wait());
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path};
pub use types::BusSettings;
