use thiserror::Error;

#[derive(Debug, Error)]
pub enum TesterError {
    #[error("store error: {0}")]
    Store(#[from] vantage_store::StoreError),
    #[error("xray control error: {0}")]
    Xray(#[from] vantage_xray::XrayError),
    #[error("{0} binary not found on PATH or at the configured location")]
    ProbeBinaryMissing(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
