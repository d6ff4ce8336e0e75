use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::XrayError;

const DEFAULT_API_SERVER_CANDIDATES: &[&str] =
    &["127.0.0.1:10085", "127.0.0.1:8080", "127.0.0.1:11111"];

#[derive(Debug, Clone)]
pub struct CmdResult {
    pub rc: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn ok(&self) -> bool {
        self.rc == 0
    }
}

/// Result of adding an inbound/outbound, mirroring the "add, and if it
/// already exists remove-then-retry" dance in §4.9.
#[derive(Debug, Clone)]
pub struct AddResult {
    pub ok: bool,
    pub tag: String,
    pub attempts: u8,
    pub removed_existing: bool,
    pub last: CmdResult,
}

/// CLI-based control client for a running Xray process's gRPC API
/// (`xray api <cmd> --server=host:port`), grounded on §4.9/§6. Every
/// mutation goes through the Xray binary as a subprocess; there is no
/// persistent connection to hold open.
pub struct XrayClient {
    xray_bin: String,
    api_server: Mutex<String>,
    exist_retry: bool,
    command_timeout: Duration,
    api_probe_timeout: Duration,
}

impl XrayClient {
    pub fn new(xray_bin: impl Into<String>, api_server: impl Into<String>) -> Self {
        XrayClient {
            xray_bin: xray_bin.into(),
            api_server: Mutex::new(api_server.into()),
            exist_retry: true,
            command_timeout: Duration::from_secs(20),
            api_probe_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_exist_retry(mut self, exist_retry: bool) -> Self {
        self.exist_retry = exist_retry;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Try each of `candidates` in turn with `lso`, keeping the first
    /// that answers with valid JSON. Falls back to the first candidate if
    /// none respond (§4.9: "probe_api_server").
    #[instrument(skip(self))]
    pub async fn probe_api_server(&self, candidates: &[&str]) -> String {
        let candidates = if candidates.is_empty() {
            DEFAULT_API_SERVER_CANDIDATES
        } else {
            candidates
        };
        for &candidate in candidates {
            let r = self
                .run_api(
                    "lso",
                    Some(candidate),
                    &[],
                    Some(self.api_probe_timeout),
                )
                .await;
            if let Ok(r) = r {
                if r.ok() && serde_json::from_str::<Value>(&r.stdout).is_ok() {
                    return candidate.to_string();
                }
            }
        }
        candidates[0].to_string()
    }

    pub async fn set_api_server(&self, server: impl Into<String>) {
        *self.api_server.lock().await = server.into();
    }

    pub async fn list_outbounds(&self) -> Result<Value, XrayError> {
        let r = self.run_api("lso", None, &[], None).await?;
        parse_or_empty(&r)
    }

    pub async fn list_inbounds(&self) -> Result<Value, XrayError> {
        let r = self.run_api("lsi", None, &[], None).await?;
        parse_or_empty(&r)
    }

    pub async fn list_outbound_tags(&self) -> Result<Vec<String>, XrayError> {
        let data = self.list_outbounds().await?;
        Ok(extract_tags(&data, "outbounds"))
    }

    pub async fn list_inbound_tags(&self) -> Result<Vec<String>, XrayError> {
        let data = self.list_inbounds().await?;
        Ok(extract_tags(&data, "inbounds"))
    }

    #[instrument(skip(self, outbound), fields(tag))]
    pub async fn add_outbound(&self, outbound: &Value) -> Result<AddResult, XrayError> {
        let tag = outbound.get("tag").and_then(|v| v.as_str()).unwrap_or("").to_string();
        tracing::Span::current().record("tag", tracing::field::display(&tag));

        let payload = serde_json::json!({ "outbounds": [outbound] });
        let r1 = self.run_with_temp_json("ado", &payload, &[]).await?;
        if r1.ok() || !self.exist_retry || !stderr_has_exist(&r1.stderr) {
            return Ok(AddResult { ok: r1.ok(), tag, attempts: 1, removed_existing: false, last: r1 });
        }

        let rm = self.run_api("rmo", None, &[&tag], None).await?;
        let r2 = self.run_with_temp_json("ado", &payload, &[]).await?;
        Ok(AddResult {
            ok: r2.ok(),
            tag,
            attempts: 2,
            removed_existing: rm.ok(),
            last: r2,
        })
    }

    #[instrument(skip(self, inbound), fields(tag))]
    pub async fn add_inbound(&self, inbound: &Value) -> Result<AddResult, XrayError> {
        let tag = inbound.get("tag").and_then(|v| v.as_str()).unwrap_or("").to_string();
        tracing::Span::current().record("tag", tracing::field::display(&tag));

        let payload = serde_json::json!({ "inbounds": [inbound] });
        let r1 = self.run_with_temp_json("adi", &payload, &[]).await?;
        if r1.ok() || !self.exist_retry || !stderr_has_exist(&r1.stderr) {
            return Ok(AddResult { ok: r1.ok(), tag, attempts: 1, removed_existing: false, last: r1 });
        }

        let rm = self.run_api("rmi", None, &[&tag], None).await?;
        let r2 = self.run_with_temp_json("adi", &payload, &[]).await?;
        Ok(AddResult {
            ok: r2.ok(),
            tag,
            attempts: 2,
            removed_existing: rm.ok(),
            last: r2,
        })
    }

    pub async fn remove_outbound(&self, tag: &str, ignore_not_found: bool) -> Result<bool, XrayError> {
        let r = self.run_api("rmo", None, &[tag], None).await?;
        Ok(r.ok() || (ignore_not_found && looks_like_not_found(&r.stdout, &r.stderr)))
    }

    pub async fn remove_inbound(&self, tag: &str, ignore_not_found: bool) -> Result<bool, XrayError> {
        let r = self.run_api("rmi", None, &[tag], None).await?;
        Ok(r.ok() || (ignore_not_found && looks_like_not_found(&r.stdout, &r.stderr)))
    }

    /// Remove a set of routing rules by tag, tolerating ones that are
    /// already gone. Returns the tags that were *not* successfully
    /// removed.
    pub async fn remove_rules(&self, rule_tags: &[String]) -> Result<Vec<String>, XrayError> {
        let mut failed = Vec::new();
        for tag in rule_tags {
            let r = self.run_api("rmrules", None, &[tag], None).await?;
            let ok = r.ok() || looks_like_not_found(&r.stdout, &r.stderr);
            if !ok {
                failed.push(tag.clone());
            }
        }
        Ok(failed)
    }

    pub async fn apply_rules(&self, routing: &Value, append: bool) -> Result<CmdResult, XrayError> {
        let extra: &[&str] = if append { &["-append"] } else { &[] };
        self.run_with_temp_json("adrules", routing, extra).await
    }

    async fn run_with_temp_json(
        &self,
        subcommand: &str,
        payload: &Value,
        extra_args: &[&str],
    ) -> Result<CmdResult, XrayError> {
        let mut file = tempfile::Builder::new()
            .suffix(".json")
            .tempfile()
            .map_err(XrayError::TempFile)?;
        let text = serde_json::to_string(payload).expect("payload is always serializable");
        std::io::Write::write_all(&mut file, text.as_bytes()).map_err(XrayError::TempFile)?;
        let path = file.path().to_string_lossy().to_string();

        let mut args: Vec<&str> = extra_args.to_vec();
        args.push(&path);
        self.run_api(subcommand, None, &args, None).await
    }

    async fn run_api(
        &self,
        subcommand: &str,
        server_override: Option<&str>,
        args: &[&str],
        timeout_override: Option<Duration>,
    ) -> Result<CmdResult, XrayError> {
        let server = match server_override {
            Some(s) => s.to_string(),
            None => self.api_server.lock().await.clone(),
        };
        let server_flag = format!("--server={server}");

        let mut command = Command::new(&self.xray_bin);
        command
            .arg("api")
            .arg(subcommand)
            .arg(&server_flag)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(bin = %self.xray_bin, subcommand, server, "running xray api command");

        let child = command.spawn().map_err(XrayError::Spawn)?;
        let call_timeout = timeout_override.unwrap_or(self.command_timeout);
        let output = timeout(call_timeout, child.wait_with_output())
            .await
            .map_err(|_| XrayError::Timeout(call_timeout))?
            .map_err(XrayError::Spawn)?;

        Ok(CmdResult {
            rc: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

fn parse_or_empty(r: &CmdResult) -> Result<Value, XrayError> {
    if !r.ok() {
        return Err(XrayError::CommandFailed {
            rc: r.rc,
            stdout: r.stdout.clone(),
            stderr: r.stderr.clone(),
        });
    }
    Ok(serde_json::from_str(&r.stdout).unwrap_or(Value::Null))
}

fn extract_tags(data: &Value, key: &str) -> Vec<String> {
    data.get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|item| item.get("tag").and_then(|t| t.as_str()))
                .map(|t| t.to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn looks_like_not_found(stdout: &str, stderr: &str) -> bool {
    let haystack = format!("{stdout} {stderr}").to_uppercase();
    haystack.contains("NOT_FOUND") || haystack.contains("NOTFOUND") || haystack.contains("NOT FOUND")
}

fn stderr_has_exist(stderr: &str) -> bool {
    let s = stderr.to_lowercase();
    s.contains("exist") || s.contains("already") || s.contains("duplicate")
}
