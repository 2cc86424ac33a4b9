//! Settings type definitions.
//!
//! Field names are camelCase on the wire. Every field has a default so partial
//! JSON is accepted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default read limit for one inbound frame, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512;
/// Default pong wait in milliseconds.
pub const DEFAULT_PONG_WAIT_MS: u64 = 60_000;
/// Default ping period: nine tenths of the pong wait.
pub const DEFAULT_PING_PERIOD_MS: u64 = DEFAULT_PONG_WAIT_MS * 9 / 10;
/// Default per-write timeout in milliseconds.
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 10_000;
/// Upper bound for every timing knob: one day.
pub const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// Timing, size, and buffer knobs for the bus.
///
/// # JSON Format
///
/// ```json
/// { "maxMessageSize": 4096, "pongWaitMs": 30000, "pingPeriodMs": 27000 }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusSettings {
    /// Maximum size of one inbound frame in bytes. Larger frames are fatal.
    pub max_message_size: usize,
    /// Interval between low-level liveness probes. Must be below `pong_wait_ms`.
    pub ping_period_ms: u64,
    /// Read-liveness deadline, reset on every liveness reply.
    pub pong_wait_ms: u64,
    /// Bound on each individual write.
    pub write_timeout_ms: u64,
    /// `pingInterval` advertised in the handshake open packet.
    pub handshake_ping_interval_ms: u64,
    /// `pingTimeout` advertised in the handshake open packet.
    pub handshake_ping_timeout_ms: u64,
    /// Capacity of each session's direct reply queue (heartbeat replies).
    pub outbound_buffer: usize,
    /// Capacity of each broker subscription's delivery queue.
    pub subscription_buffer: usize,
    /// Capacity of the control loop's inbox.
    pub control_buffer: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            ping_period_ms: DEFAULT_PING_PERIOD_MS,
            pong_wait_ms: DEFAULT_PONG_WAIT_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            handshake_ping_interval_ms: 30_000,
            handshake_ping_timeout_ms: 60_000,
            outbound_buffer: 64,
            subscription_buffer: 100,
            control_buffer: 256,
        }
    }
}

impl BusSettings {
    /// Correct invalid invariants in place.
    ///
    /// Out-of-range values are corrected with a warning rather than rejected.
    pub fn validate(&mut self) {
        fn at_least_one(val: &mut usize, name: &str) {
            if *val == 0 {
                tracing::warn!("{name} is 0, raising to 1");
                *val = 1;
            }
        }

        if self.max_message_size == 0 {
            tracing::warn!(
                "max_message_size is 0, resetting to {}",
                DEFAULT_MAX_MESSAGE_SIZE
            );
            self.max_message_size = DEFAULT_MAX_MESSAGE_SIZE;
        }
        fn at_most_a_day(val: &mut u64, name: &str) {
            if *val > MAX_TIMEOUT_MS {
                tracing::warn!("{name} ({val}) exceeds {MAX_TIMEOUT_MS}, clamping");
                *val = MAX_TIMEOUT_MS;
            }
        }

        at_most_a_day(&mut self.pong_wait_ms, "pong_wait_ms");
        at_most_a_day(&mut self.ping_period_ms, "ping_period_ms");
        at_most_a_day(&mut self.write_timeout_ms, "write_timeout_ms");
        if self.pong_wait_ms == 0 {
            tracing::warn!("pong_wait_ms is 0, resetting to {}", DEFAULT_PONG_WAIT_MS);
            self.pong_wait_ms = DEFAULT_PONG_WAIT_MS;
        }
        if self.ping_period_ms == 0 || self.ping_period_ms >= self.pong_wait_ms {
            let corrected = (self.pong_wait_ms.saturating_mul(9) / 10).max(1);
            tracing::warn!(
                "ping_period_ms ({}) must be below pong_wait_ms ({}), correcting to {}",
                self.ping_period_ms,
                self.pong_wait_ms,
                corrected
            );
            self.ping_period_ms = corrected;
        }
        if self.write_timeout_ms == 0 {
            tracing::warn!(
                "write_timeout_ms is 0, resetting to {}",
                DEFAULT_WRITE_TIMEOUT_MS
            );
            self.write_timeout_ms = DEFAULT_WRITE_TIMEOUT_MS;
        }
        at_least_one(&mut self.outbound_buffer, "outbound_buffer");
        at_least_one(&mut self.subscription_buffer, "subscription_buffer");
        at_least_one(&mut self.control_buffer, "control_buffer");
    }

    /// Ping period as a [`Duration`].
    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms.min(MAX_TIMEOUT_MS))
    }

    /// Pong wait as a [`Duration`].
    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms.min(MAX_TIMEOUT_MS))
    }

    /// Write timeout as a [`Duration`].
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.min(MAX_TIMEOUT_MS))
    }
}
