use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] vantage_store::StoreError),

    #[error("bridge error: {0}")]
    Bridge(#[from] vantage_bridge::BridgeError),

    #[error("core error: {0}")]
    Core(#[from] vantage_core::CoreError),
}
