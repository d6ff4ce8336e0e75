use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::error::BridgeError;

/// How to launch and talk to the external link-parser process (§4.5,
/// §6): one process, one line of input per call, one line of output,
/// restarted whenever it exits or a call times out.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub command: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub ready_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            command: "node".to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            ready_timeout: Duration::from_secs(20),
            call_timeout: Duration::from_secs(15),
        }
    }
}

struct RunningProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Owns a persistent subprocess that turns one proxy link into one JSON
/// outbound config per line (§4.5). Calls are serialized through a mutex
/// because the process speaks exactly one line in, one line out — there
/// is no way to pipeline requests to it.
pub struct BridgeClient {
    config: BridgeConfig,
    inner: Mutex<Option<RunningProcess>>,
}

impl BridgeClient {
    pub fn new(config: BridgeConfig) -> Self {
        BridgeClient {
            config,
            inner: Mutex::new(None),
        }
    }

    /// Convert one link to its JSON outbound text, or `None` if the
    /// bridge reported `null`/`ERR:...` or the call timed out. A timeout
    /// kills and drops the process so the next call starts clean (§4.5:
    /// "a wedged bridge process is treated the same as one that returns
    /// `ERR`: discard it and let the next call restart it").
    #[instrument(skip(self))]
    pub async fn convert(&self, link: &str) -> Result<Option<String>, BridgeError> {
        if link.trim().is_empty() {
            return Ok(None);
        }
        let normalized = link.replace(['\r', '\n'], " ");

        let mut guard = self.inner.lock().await;
        self.ensure_started(&mut guard).await?;

        let Some(proc) = guard.as_mut() else {
            return Err(BridgeError::ShutDown);
        };

        if let Err(e) = proc.stdin.write_all(format!("{normalized}\n").as_bytes()).await {
            warn!(error = %e, "bridge stdin write failed, killing process");
            Self::kill(&mut guard).await;
            return Ok(None);
        }
        if let Err(e) = proc.stdin.flush().await {
            warn!(error = %e, "bridge stdin flush failed, killing process");
            Self::kill(&mut guard).await;
            return Ok(None);
        }

        let call_timeout = self.config.call_timeout;
        let proc = guard.as_mut().expect("checked above");
        let mut line = String::new();
        let read = timeout(call_timeout, proc.stdout.read_line(&mut line)).await;

        match read {
            Err(_elapsed) => {
                debug!("bridge call timed out, killing process");
                Self::kill(&mut guard).await;
                Ok(None)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "bridge stdout read failed, killing process");
                Self::kill(&mut guard).await;
                Ok(None)
            }
            Ok(Ok(0)) => {
                // EOF: the process exited.
                Self::kill(&mut guard).await;
                Ok(None)
            }
            Ok(Ok(_)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
                    Ok(None)
                } else if let Some(reason) = trimmed.strip_prefix("ERR:") {
                    debug!(reason, "bridge reported a conversion error");
                    Ok(None)
                } else {
                    Ok(Some(trimmed.to_string()))
                }
            }
        }
    }

    async fn ensure_started(
        &self,
        guard: &mut Option<RunningProcess>,
    ) -> Result<(), BridgeError> {
        let needs_restart = match guard.as_mut() {
            None => true,
            Some(proc) => proc.child.try_wait().ok().flatten().is_some(),
        };
        if !needs_restart {
            return Ok(());
        }

        let mut command = tokio::process::Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        for (k, v) in &self.config.envs {
            command.env(k, v);
        }

        let mut child = command
            .spawn()
            .map_err(|e| BridgeError::Spawn(self.config.command.clone(), e))?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = BufReader::new(child.stdout.take().expect("piped stdout"));

        // Drain stderr in the background so the child never blocks
        // writing to a full pipe.
        if let Some(mut stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut sink = tokio::io::sink();
                let _ = tokio::io::copy(&mut stderr, &mut sink).await;
            });
        }

        let mut proc = RunningProcess { child, stdin, stdout };
        Self::wait_ready(&mut proc, self.config.ready_timeout).await?;
        info!("bridge process ready");
        *guard = Some(proc);
        Ok(())
    }

    async fn wait_ready(proc: &mut RunningProcess, ready_timeout: Duration) -> Result<(), BridgeError> {
        let wait = async {
            loop {
                let mut line = String::new();
                let n = proc.stdout.read_line(&mut line).await?;
                if n == 0 {
                    return Err(BridgeError::ExitedBeforeReady);
                }
                let trimmed = line.trim();
                if trimmed == "READY" {
                    return Ok(());
                }
                if let Some(reason) = trimmed.strip_prefix("ERR:") {
                    return Err(BridgeError::InitError(reason.to_string()));
                }
            }
        };
        timeout(ready_timeout, wait)
            .await
            .map_err(|_| BridgeError::ReadyTimeout)?
    }

    async fn kill(guard: &mut Option<RunningProcess>) {
        if let Some(mut proc) = guard.take() {
            let _ = proc.child.kill().await;
        }
    }

    /// Shut down the bridge process, if running. Safe to call even if
    /// nothing is running.
    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        Self::kill(&mut guard).await;
    }
}
