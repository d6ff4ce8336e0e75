use std::env;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::BaseError;

/// Settings shared by every component binary: where the store lives, what
/// port (if any) to serve Prometheus metrics on, and how to log.
///
/// Each binary (collector, pipeline, tester, ...) embeds this via
/// `#[serde(flatten)]` alongside its own component-specific fields, the
/// same layering the teacher uses for its per-agent settings structs.
#[derive(Debug, Clone, Deserialize)]
pub struct BaseSettings {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub log: LogSettings,
}

fn default_db_path() -> String {
    "vantage.sqlite3".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogSettings {
    /// `off` | `error` | `warn` | `info` | `debug` | `trace`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit one JSON object per line instead of the compact human format.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Load a settings object, layering (lowest to highest precedence):
///
/// 1. `./config/{profile}/{component_prefix}-partial.{json,toml,yaml}` (optional)
/// 2. `VANTAGE_BASE_*` env vars, shared across every component
/// 3. `VANTAGE_{COMPONENT_PREFIX}_*` env vars, specific to this component
///
/// `profile` comes from `VANTAGE_PROFILE` (default `default`). Nested keys
/// use a double underscore, e.g. `VANTAGE_TESTER__LOCK_TIMEOUT_SECS` sets
/// `tester.lock_timeout_secs` (§9.1). Callers typically layer clap flags
/// on top of the deserialized result themselves, since clap flags must win
/// over everything here.
pub fn load_settings<'de, T: Deserialize<'de>>(component_prefix: &str) -> Result<T, BaseError> {
    let profile = env::var("VANTAGE_PROFILE").unwrap_or_else(|_| "default".into());
    let prefix = format!("VANTAGE_{}", component_prefix.to_ascii_uppercase());

    let builder = Config::builder()
        .add_source(
            File::with_name(&format!(
                "./config/{profile}/{}-partial",
                component_prefix.to_lowercase()
            ))
            .required(false),
        )
        .add_source(Environment::with_prefix("VANTAGE_BASE").separator("__"))
        .add_source(Environment::with_prefix(&prefix).separator("__"));

    let config = builder.build()?;
    Ok(config.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_settings_defaults_without_any_source() {
        let config = Config::builder().build().unwrap();
        let settings: BaseSettings = config.try_deserialize().unwrap();
        assert_eq!(settings.db_path, "vantage.sqlite3");
        assert_eq!(settings.log.level, "info");
        assert!(!settings.log.json);
    }
}
