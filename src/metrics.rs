//! Metrics Module
//!
//! Prometheus-compatible metrics for monitoring:
//! - order placement and fill counters
//! - monitor loop health (ticks, tick errors)
//! - self-healing rescues

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Metric names as constants for consistency
pub mod names {
    pub const ORDERS_PLACED_TOTAL: &str = "grid_orders_placed_total";
    pub const BUY_FILLS_TOTAL: &str = "grid_buy_fills_total";
    pub const SELL_FILLS_TOTAL: &str = "grid_sell_fills_total";
    pub const RESCUED_FILLS_TOTAL: &str = "grid_rescued_fills_total";
    pub const MONITOR_TICKS_TOTAL: &str = "grid_monitor_ticks_total";
    pub const MONITOR_TICK_ERRORS_TOTAL: &str = "grid_monitor_tick_errors_total";
}

/// Install the Prometheus exporter on `port`. A port of 0 disables the
/// exporter (metrics macros become no-ops without a recorder).
pub fn init(port: u16) -> anyhow::Result<()> {
    if port == 0 {
        tracing::info!("Metrics exporter disabled");
        return Ok(());
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("Metrics exporter listening on {}", addr);
    Ok(())
}
