use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};
use vantage_core::{StopToken, TestErrorCode};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// What the geolocation probe subprocess reported for one proxy
/// (§4.10 "Parallel probe phase", §6 "Geolocation probe").
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub ok: bool,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub isp: Option<String>,
}

impl ProbeOutcome {
    fn failure(code: &str, detail: impl Into<String>) -> Self {
        ProbeOutcome {
            ok: false,
            error_code: Some(code.to_string()),
            error_detail: Some(one_line(&detail.into(), 240)),
            ip: None,
            country: None,
            city: None,
            isp: None,
        }
    }

    fn stopped() -> Self {
        ProbeOutcome::failure("stopped", "stopped")
    }
}

/// Run the geolocation probe through the bound SOCKS5 port, polling for
/// completion so a raised stop token or the check timeout can terminate
/// it early (§4.10 step 2). `probe_bin` is invoked as
/// `<probe_bin> --timeout <check_timeout_sec> --socks5 <socks5_url>`.
pub async fn run_probe(
    probe_bin: &str,
    socks5_url: &str,
    check_timeout_sec: u64,
    stop: &StopToken,
) -> ProbeOutcome {
    let mut child = match Command::new(probe_bin)
        .arg("--timeout")
        .arg(check_timeout_sec.to_string())
        .arg("--socks5")
        .arg(socks5_url)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => return ProbeOutcome::failure("spawn_failed", e.to_string()),
    };

    let mut stdout_pipe = child.stdout.take().expect("stdout is piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr is piped");
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let deadline = Instant::now() + Duration::from_secs(check_timeout_sec.max(1));
    let mut was_stopped = false;
    let status = loop {
        if Instant::now() >= deadline {
            let _ = child.start_kill();
            break child.wait().await;
        }
        if stop.is_stopped() {
            was_stopped = true;
            let _ = child.start_kill();
            break child.wait().await;
        }
        match tokio::time::timeout(POLL_INTERVAL, child.wait()).await {
            Ok(status) => break status,
            Err(_) => continue,
        }
    };

    let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).to_string();
    let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).to_string();

    if was_stopped {
        return ProbeOutcome::stopped();
    }

    let rc = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            warn!(error = %e, "failed to wait on probe subprocess");
            -1
        }
    };

    let parsed: Option<Value> = serde_json::from_str(stdout.trim()).ok();

    if rc != 0 {
        if let Some(Value::Object(mut obj)) = parsed {
            obj.entry("status").or_insert(Value::String("error".to_string()));
            obj.entry("error_type")
                .or_insert(Value::String("check_host_exit_nonzero".to_string()));
            if !obj.contains_key("error_detail") {
                let detail = if !stderr.is_empty() { stderr } else { stdout };
                obj.insert("error_detail".to_string(), Value::String(detail));
            }
            return outcome_from_json(&Value::Object(obj));
        }
        let detail = if !stderr.is_empty() { stderr } else if !stdout.is_empty() { stdout } else { format!("rc={rc}") };
        return ProbeOutcome::failure("check_host_exit_nonzero", detail);
    }

    match parsed {
        Some(Value::Object(obj)) => outcome_from_json(&Value::Object(obj)),
        Some(_) => ProbeOutcome::failure("badjson", "probe returned non-object json"),
        None => {
            debug!(stdout = %one_line(&stdout, 400), "probe stdout was not valid json");
            ProbeOutcome::failure("badjson", one_line(&stdout, 400))
        }
    }
}

fn outcome_from_json(value: &Value) -> ProbeOutcome {
    let status = value.get("status").and_then(|v| v.as_str()).unwrap_or("");
    let ip = value
        .get("IP address")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .or_else(|| {
            value
                .pointer("/resolved_host/host")
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
        })
        .map(|s| s.to_string());

    if status.eq_ignore_ascii_case("ok") && ip.is_some() {
        return ProbeOutcome {
            ok: true,
            error_code: None,
            error_detail: None,
            ip,
            country: string_field(value, "Country"),
            city: string_field(value, "City"),
            isp: string_field(value, "ISP"),
        };
    }

    let error_type = value.get("error_type").and_then(|v| v.as_str()).unwrap_or("");
    let error_detail = value.get("error_detail").and_then(|v| v.as_str()).unwrap_or("");
    let code = classify_probe_error(error_type);
    let detail = if error_type.is_empty() {
        error_detail.to_string()
    } else {
        format!("{error_type}:{error_detail}")
    };
    ProbeOutcome::failure(&code, detail)
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Map a probe `error_type` onto the one-word taxonomy (§4.10 step 5,
/// §7). Known types go through [`TestErrorCode`] so the persisted token
/// matches the rest of the taxonomy exactly; anything else is reduced to
/// its own one-word token locally, since `last_test_error` is a free-text
/// column rather than limited to the closed enum.
pub fn classify_probe_error(error_type: &str) -> String {
    match error_type {
        "" => "fail".to_string(),
        "connection_timeout" | "connection_failed" | "proxy_error" | "tls_error" | "http_error"
        | "captcha_or_antibot_challenge" | "badjson" | "json_parse_failed" => {
            TestErrorCode::from_probe_error_type(error_type).to_string()
        }
        other => one_word(other),
    }
}

fn one_word(s: &str) -> String {
    s.trim()
        .to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .find(|w| !w.is_empty())
        .unwrap_or("fail")
        .to_string()
}

fn one_line(s: &str, max_len: usize) -> String {
    let collapsed: String = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > max_len {
        collapsed.chars().take(max_len).collect()
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantage_core::StopToken;

    #[test]
    fn one_word_reduces_to_first_token() {
        assert_eq!(one_word("Unexpected Error: boom"), "unexpected");
        assert_eq!(one_word(""), "fail");
    }

    #[test]
    fn classify_probe_error_maps_known_types() {
        assert_eq!(classify_probe_error("connection_timeout"), "timeout");
        assert_eq!(classify_probe_error("captcha_or_antibot_challenge"), "antibot");
    }

    #[test]
    fn classify_probe_error_reduces_unknown_types() {
        assert_eq!(classify_probe_error("socks_missing_dependency"), "socks_missing_dependency");
        assert_eq!(classify_probe_error("unexpected_error"), "unexpected_error");
    }

    #[test]
    fn outcome_from_json_requires_both_status_ok_and_ip() {
        let v = serde_json::json!({"status": "ok"});
        let outcome = outcome_from_json(&v);
        assert!(!outcome.ok);
    }

    #[test]
    fn outcome_from_json_falls_back_to_resolved_host() {
        let v = serde_json::json!({
            "status": "ok",
            "resolved_host": {"host": "1.2.3.4"},
            "Country": "US",
        });
        let outcome = outcome_from_json(&v);
        assert!(outcome.ok);
        assert_eq!(outcome.ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(outcome.country.as_deref(), Some("US"));
    }

    #[test]
    fn outcome_from_json_classifies_known_error_type() {
        let v = serde_json::json!({"status": "error", "error_type": "tls_error", "error_detail": "bad cert"});
        let outcome = outcome_from_json(&v);
        assert!(!outcome.ok);
        assert_eq!(outcome.error_code.as_deref(), Some("tls"));
    }

    #[tokio::test]
    async fn run_probe_reports_spawn_failed_for_missing_binary() {
        let stop = StopToken::new();
        let outcome = run_probe("/nonexistent/probe-binary", "socks5h://u:p@127.0.0.1:9000", 1, &stop).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.error_code.as_deref(), Some("spawn_failed"));
    }

    fn fake_probe_script(body: &str) -> tempfile::TempPath {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;
        let mut file = tempfile::Builder::new().suffix(".sh").tempfile().unwrap();
        writeln!(file, "#!/bin/sh\n{body}").unwrap();
        let path = file.into_temp_path();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn run_probe_parses_ok_json_from_script() {
        let stop = StopToken::new();
        let script = fake_probe_script(
            r#"echo '{"status":"ok","IP address":"9.9.9.9","Country":"US","City":"NYC","ISP":"Acme"}'"#,
        );
        let outcome = run_probe(script.to_str().unwrap(), "socks5h://u:p@127.0.0.1:9000", 5, &stop).await;
        assert!(outcome.ok);
        assert_eq!(outcome.ip.as_deref(), Some("9.9.9.9"));
        assert_eq!(outcome.isp.as_deref(), Some("Acme"));
    }

    #[tokio::test]
    async fn run_probe_is_aborted_by_stop_token() {
        let stop = StopToken::new();
        let script = fake_probe_script("sleep 5");
        stop.raise();
        let outcome = run_probe(script.to_str().unwrap(), "socks5h://u:p@127.0.0.1:9000", 5, &stop).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.error_code.as_deref(), Some("stopped"));
    }
}
