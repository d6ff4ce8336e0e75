use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to spawn bridge process {0:?}: {1}")]
    Spawn(String, std::io::Error),

    #[error("bridge process exited before signaling ready")]
    ExitedBeforeReady,

    #[error("bridge process did not signal ready within the timeout")]
    ReadyTimeout,

    #[error("bridge process reported an init error: {0}")]
    InitError(String),

    #[error("io error talking to bridge process: {0}")]
    Io(#[from] std::io::Error),

    #[error("bridge process is shut down")]
    ShutDown,
}
