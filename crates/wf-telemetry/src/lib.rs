//! Telemetry for weft services.
//!
//! - **Logging**: human-readable and JSON output via `tracing-subscriber`
//! - **Metrics**: counters, gauges and histograms for unit attempts,
//!   executions and deployed services, exportable as Prometheus text or JSON

pub mod logging;
pub mod metrics;
