use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("store error: {0}")]
    Store(#[from] vantage_store::StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("collection was stopped")]
    Stopped,
}
