//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the `/metrics` endpoint. Call once at
/// startup before any metric is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Sessions admitted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Sessions removed (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Sessions currently registered with the control loop (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Inbound text frames (counter).
pub const WS_FRAMES_IN_TOTAL: &str = "ws_frames_in_total";
/// Inbound frames dropped as malformed (counter).
pub const WS_FRAMES_MALFORMED_TOTAL: &str = "ws_frames_malformed_total";
/// Envelopes published to the broker (counter).
pub const BUS_PUBLISH_TOTAL: &str = "bus_publish_total";
/// Failed publishes (counter).
pub const BUS_PUBLISH_ERRORS_TOTAL: &str = "bus_publish_errors_total";
pub use sockbus_broker::BROKER_DELIVERY_DROPS_TOTAL;
/// Session lifetime in seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
