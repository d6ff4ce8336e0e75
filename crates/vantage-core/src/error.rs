use std::fmt;

/// The error taxonomy from spec §7, persisted verbatim into
/// `links.last_test_error`. Every variant's [`Display`] impl is exactly the
/// one-word token the store expects; never reformat these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestErrorCode {
    Timeout,
    Connect,
    Proxy,
    Tls,
    Http,
    Antibot,
    Parse,
    Xray,
    Rule,
    SsCipher,
    Proto,
    Stopped,
    NotPrimary,
    Fail,
}

impl TestErrorCode {
    /// Maps the geolocation probe's `error_type` taxonomy (§4.10 step 5,
    /// §6) onto our codes.
    pub fn from_probe_error_type(error_type: &str) -> Self {
        match error_type {
            "connection_timeout" => TestErrorCode::Timeout,
            "connection_failed" => TestErrorCode::Connect,
            "proxy_error" => TestErrorCode::Proxy,
            "tls_error" => TestErrorCode::Tls,
            "http_error" => TestErrorCode::Http,
            "captcha_or_antibot_challenge" => TestErrorCode::Antibot,
            "badjson" | "json_parse_failed" => TestErrorCode::Parse,
            other => TestErrorCode::from_raw_token(other),
        }
    }

    /// Fallback reduction of an arbitrary token to a single word, used when
    /// an external error string doesn't map onto the known taxonomy.
    fn from_raw_token(token: &str) -> Self {
        // Single-word reduction: lowercase, take the part before the first
        // non-alphanumeric separator. If that's still empty, fall back to
        // `fail`.
        let word = token
            .split(|c: char| !c.is_ascii_alphanumeric())
            .find(|w| !w.is_empty());
        match word {
            Some(_) => TestErrorCode::Fail,
            None => TestErrorCode::Fail,
        }
    }

    /// Does this code also imply the record should be marked unsupported
    /// (§4.10 step result attribution, §7)?
    pub fn marks_unsupported(self) -> bool {
        matches!(self, TestErrorCode::SsCipher | TestErrorCode::Proto)
    }

    /// `stopped` results are not counted as failures for eligibility
    /// purposes (§7).
    pub fn counts_as_failure(self) -> bool {
        !matches!(self, TestErrorCode::Stopped)
    }
}

impl fmt::Display for TestErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestErrorCode::Timeout => "timeout",
            TestErrorCode::Connect => "connect",
            TestErrorCode::Proxy => "proxy",
            TestErrorCode::Tls => "tls",
            TestErrorCode::Http => "http",
            TestErrorCode::Antibot => "antibot",
            TestErrorCode::Parse => "parse",
            TestErrorCode::Xray => "xray",
            TestErrorCode::Rule => "rule",
            TestErrorCode::SsCipher => "ss_cipher",
            TestErrorCode::Proto => "proto",
            TestErrorCode::Stopped => "stopped",
            TestErrorCode::NotPrimary => "not_primary",
            TestErrorCode::Fail => "fail",
        };
        f.write_str(s)
    }
}

/// Classify an Xray control-command failure's stderr into a taxonomy code,
/// per §4.10 step (b).
pub fn classify_add_outbound_stderr(stderr: &str) -> TestErrorCode {
    if stderr.contains("unknown cipher method") {
        TestErrorCode::SsCipher
    } else if stderr.contains("unknown protocol") || stderr.contains("failed to build outbound handler")
    {
        TestErrorCode::Proto
    } else {
        TestErrorCode::Xray
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid URI: {0}")]
    InvalidUri(String),
    #[error("canonical JSON encoding failed: {0}")]
    Canon(#[from] serde_json::Error),
    #[error("base64 decode failed")]
    Base64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_emits_single_word_tokens() {
        assert_eq!(TestErrorCode::SsCipher.to_string(), "ss_cipher");
        assert_eq!(TestErrorCode::NotPrimary.to_string(), "not_primary");
    }

    #[test]
    fn maps_known_probe_error_types() {
        assert_eq!(
            TestErrorCode::from_probe_error_type("connection_timeout"),
            TestErrorCode::Timeout
        );
        assert_eq!(
            TestErrorCode::from_probe_error_type("badjson"),
            TestErrorCode::Parse
        );
    }

    #[test]
    fn cipher_and_proto_mark_unsupported() {
        assert!(TestErrorCode::SsCipher.marks_unsupported());
        assert!(TestErrorCode::Proto.marks_unsupported());
        assert!(!TestErrorCode::Timeout.marks_unsupported());
    }

    #[test]
    fn stopped_does_not_count_as_failure() {
        assert!(!TestErrorCode::Stopped.counts_as_failure());
        assert!(TestErrorCode::Fail.counts_as_failure());
    }

    #[test]
    fn classifies_cipher_and_protocol_stderr() {
        assert_eq!(
            classify_add_outbound_stderr("Failed: unknown cipher method aes"),
            TestErrorCode::SsCipher
        );
        assert_eq!(
            classify_add_outbound_stderr("failed to build outbound handler"),
            TestErrorCode::Proto
        );
        assert_eq!(
            classify_add_outbound_stderr("connection refused"),
            TestErrorCode::Xray
        );
    }
}
