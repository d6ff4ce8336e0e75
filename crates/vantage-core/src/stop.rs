use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A single stop token shared by every component in a run.
///
/// Checked at every worker boundary and between outer-loop iterations
/// (§5 "Cancellation semantics"). Unlike the source project's module-level
/// globals, this is handed to component constructors explicitly — no
/// component reads cancellation state from a global.
#[derive(Clone, Debug)]
pub struct StopToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    flag: AtomicBool,
    stop_file: Option<PathBuf>,
}

impl StopToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                stop_file: None,
            }),
        }
    }

    /// Also observe an external "stop file": if it exists on disk, the token
    /// reports stopped even if `raise()` was never called in-process.
    pub fn with_stop_file(stop_file: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                stop_file: Some(stop_file.into()),
            }),
        }
    }

    pub fn raise(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        if self.inner.flag.load(Ordering::SeqCst) {
            return true;
        }
        match &self.inner.stop_file {
            Some(path) => stop_file_exists(path),
            None => false,
        }
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

fn stop_file_exists(path: &Path) -> bool {
    path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raised_in_process_is_observed() {
        let tok = StopToken::new();
        assert!(!tok.is_stopped());
        tok.raise();
        assert!(tok.is_stopped());
    }

    #[test]
    fn clone_shares_state() {
        let tok = StopToken::new();
        let clone = tok.clone();
        clone.raise();
        assert!(tok.is_stopped());
    }

    #[test]
    fn stop_file_presence_is_observed() {
        let dir = tempfile_dir();
        let path = dir.join("stop");
        let tok = StopToken::with_stop_file(&path);
        assert!(!tok.is_stopped());
        std::fs::write(&path, b"").unwrap();
        assert!(tok.is_stopped());
    }

    fn tempfile_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("vantage-stop-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
