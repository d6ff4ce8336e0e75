use thiserror::Error;

#[derive(Debug, Error)]
pub enum XrayError {
    #[error("xray binary not found (tried {0:?})")]
    BinaryNotFound(Vec<String>),

    #[error("failed to run xray command: {0}")]
    Spawn(std::io::Error),

    #[error("xray command timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("failed to write temp payload file: {0}")]
    TempFile(std::io::Error),

    #[error("command failed (rc={rc}): {stderr}")]
    CommandFailed { rc: i32, stdout: String, stderr: String },
}
