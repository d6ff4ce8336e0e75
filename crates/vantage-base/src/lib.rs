//! Ambient stack shared by every component binary: layered configuration,
//! tracing/logging setup, and the Prometheus metrics registry.

mod config;
mod error;
mod logging;
mod metrics;

pub use config::{load_settings, BaseSettings, LogSettings};
pub use error::BaseError;
pub use logging::start_logging;
pub use metrics::CoreMetrics;
