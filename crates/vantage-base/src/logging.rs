use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::config::LogSettings;
use crate::error::BaseError;

/// Install a global `tracing` subscriber. Level comes from
/// [`LogSettings::level`] but can always be overridden with `RUST_LOG`,
/// which takes precedence when set (§9.2). Output is either the default
/// human-readable formatter or one-JSON-object-per-line when
/// `LogSettings::json` is set (or `VANTAGE_LOG_JSON=1`).
pub fn start_logging(settings: &LogSettings) -> Result<(), BaseError> {
    let default_level = parse_level(&settings.level)?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let json = settings.json || std::env::var("VANTAGE_LOG_JSON").as_deref() == Ok("1");

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .try_init()
            .ok();
    }
    Ok(())
}

fn parse_level(level: &str) -> Result<LevelFilter, BaseError> {
    match level.to_ascii_lowercase().as_str() {
        "off" => Ok(LevelFilter::OFF),
        "error" => Ok(LevelFilter::ERROR),
        "warn" => Ok(LevelFilter::WARN),
        "info" => Ok(LevelFilter::INFO),
        "debug" => Ok(LevelFilter::DEBUG),
        "trace" => Ok(LevelFilter::TRACE),
        other => Err(BaseError::InvalidLogLevel(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_level() {
        assert!(parse_level("verbose").is_err());
    }

    #[test]
    fn accepts_known_levels() {
        for level in ["off", "error", "warn", "info", "debug", "trace"] {
            assert!(parse_level(level).is_ok());
        }
    }
}
