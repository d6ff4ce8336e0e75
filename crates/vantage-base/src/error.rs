use thiserror::Error;

#[derive(Debug, Error)]
pub enum BaseError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("invalid log level {0:?}")]
    InvalidLogLevel(String),
}
