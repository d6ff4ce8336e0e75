use std::collections::HashSet;

use regex::Regex;
use serde_json::Value;
use vantage_core::decode_repaired;

/// URI schemes the collector recognizes in raw subscription content
/// (§4.2). `vantage-core::Protocol` only models the schemes the rest of
/// the pipeline can actually build a config for; the collector casts a
/// wider net here so schemes like `ssr://`/`tuic://` are still gathered
/// (and later marked unsupported by the pipeline) instead of silently
/// dropped at ingestion time.
const PROTO_PREFIXES: &[&str] = &[
    "vmess://",
    "vless://",
    "trojan://",
    "ss://",
    "ssr://",
    "tuic://",
    "hysteria2://",
    "hy2://",
];

fn patterns() -> Vec<Regex> {
    [
        r"(?i)vmess://[A-Za-z0-9+/=]+",
        r"(?i)vless://\S+",
        r"(?i)trojan://\S+",
        r"(?i)ss://[A-Za-z0-9+/=]+@\S+",
        r"(?i)ssr://[A-Za-z0-9+/=]+",
        r"(?i)tuic://\S+",
        r"(?i)hysteria2://\S+",
        r"(?i)hy2://\S+",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern is valid"))
    .collect()
}

pub fn is_base64_encoded(text: &str) -> bool {
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() || cleaned.len() % 4 != 0 {
        return false;
    }
    decode_repaired(&cleaned).is_ok()
}

pub fn is_json_content(text: &str) -> bool {
    serde_json::from_str::<Value>(text).is_ok()
}

fn decode_if_base64(content: &str) -> String {
    if is_base64_encoded(content) {
        if let Ok(bytes) = decode_repaired(content) {
            if let Ok(text) = String::from_utf8(bytes) {
                return text;
            }
        }
    }
    content.to_string()
}

/// Extract proxy URIs from arbitrary text, transparently unwrapping a
/// whole-body base64 blob first (§4.2 step "extract from plain text").
pub fn extract_from_text(content: &str) -> Vec<String> {
    if content.is_empty() {
        return Vec::new();
    }
    let decoded = decode_if_base64(content);
    let mut found: HashSet<String> = HashSet::new();
    for pattern in patterns() {
        for m in pattern.find_iter(&decoded) {
            found.insert(m.as_str().to_string());
        }
    }
    found.into_iter().collect()
}

/// Extract proxy URIs from a base64 blob that is a newline-separated
/// list of links once decoded (§4.2 step "extract from base64 blob").
pub fn extract_from_base64_blob(blob: &str) -> Vec<String> {
    let Ok(bytes) = decode_repaired(blob) else {
        return Vec::new();
    };
    let Ok(decoded) = String::from_utf8(bytes) else {
        return Vec::new();
    };
    let mut found: HashSet<String> = HashSet::new();
    for line in decoded.lines() {
        let line = line.trim();
        if !line.is_empty() && PROTO_PREFIXES.iter().any(|p| line.to_lowercase().starts_with(p)) {
            found.insert(line.to_string());
        }
    }
    found.into_iter().collect()
}

/// Extract proxy URIs from a JSON document by walking every string value
/// and keeping ones that look like a proxy URI (§4.2 step "extract from
/// structured JSON").
pub fn extract_from_json_text(content: &str) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<Value>(content) else {
        return Vec::new();
    };
    let mut found: HashSet<String> = HashSet::new();
    walk_json(&value, &mut found);
    found.into_iter().collect()
}

fn walk_json(value: &Value, found: &mut HashSet<String>) {
    match value {
        Value::String(s) => {
            if PROTO_PREFIXES.iter().any(|p| s.to_lowercase().starts_with(p)) {
                found.insert(s.clone());
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_json(item, found);
            }
        }
        Value::Object(map) => {
            if let Some(outbounds) = map.get("outbounds").and_then(|v| v.as_array()) {
                for outbound in outbounds {
                    if let Some(url) = convert_structured_outbound(outbound) {
                        found.insert(url);
                    }
                }
            }
            for v in map.values() {
                walk_json(v, found);
            }
        }
        _ => {}
    }
}

/// Turn a structured Xray/sing-box `outbounds[*]` entry into a proxy URI
/// string, for the handful of config types subscriptions serve as raw
/// JSON instead of a `scheme://` link (§4.2, ported from `collector.py`'s
/// `_convert_structured_to_url`).
///
/// `hysteria2` synthesizes a real `hysteria2://` URI. `wireguard` has no
/// URI form at all — Xray's wireguard outbound has nothing resembling a
/// single-link encoding — so this returns a `#`-prefixed comment line
/// instead, the same placeholder the original emits; it never matches
/// [`PROTO_PREFIXES`] downstream and so is naturally never treated as an
/// importable link, only recorded for visibility.
fn convert_structured_outbound(outbound: &Value) -> Option<String> {
    let obj = outbound.as_object()?;
    let config_type = obj.get("type").and_then(|v| v.as_str()).unwrap_or("").to_lowercase();

    match config_type.as_str() {
        "hysteria2" => {
            let server = obj.get("server").and_then(|v| v.as_str()).unwrap_or("");
            let port = obj.get("server_port").and_then(|v| v.as_i64()).unwrap_or(443);
            let password = obj.get("password").and_then(|v| v.as_str()).unwrap_or("");
            if server.is_empty() || password.is_empty() {
                return None;
            }
            let tag = obj.get("tag").and_then(|v| v.as_str()).unwrap_or("");
            let mut url = format!("hysteria2://{password}@{server}:{port}");
            if !tag.is_empty() {
                url.push('#');
                url.push_str(tag);
            }
            Some(url)
        }
        "wireguard" => {
            let peer = obj.get("settings")?.get("peers")?.as_array()?.first()?;
            let endpoint = peer.get("endpoint").and_then(|v| v.as_str()).unwrap_or("");
            let public_key = peer.get("publicKey").and_then(|v| v.as_str()).unwrap_or("");
            if endpoint.is_empty() || public_key.is_empty() {
                return None;
            }
            let tag = obj.get("tag").and_then(|v| v.as_str()).unwrap_or("");
            Some(format!("# Wireguard config: {tag} - {endpoint}"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_multiple_schemes_from_plain_text() {
        let text = "noise vmess://abc123== more noise vless://foo@bar:443 trailing";
        let found = extract_from_text(text);
        assert!(found.iter().any(|u| u.starts_with("vmess://")));
        assert!(found.iter().any(|u| u.starts_with("vless://")));
    }

    #[test]
    fn unwraps_base64_whole_body_before_scanning() {
        let inner = "vmess://aaaa\ntrojan://bbbb@host:443";
        use base64::Engine;
        let b64 = base64::engine::general_purpose::STANDARD.encode(inner);
        let found = extract_from_base64_blob(&b64);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn walks_nested_json_for_uri_strings() {
        let json = r#"{"items": [{"link": "vless://x@y:443"}, {"other": "vmess://z"}]}"#;
        let found = extract_from_json_text(json);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn is_base64_encoded_rejects_plain_text() {
        assert!(!is_base64_encoded("hello world, not base64 at all!!"));
    }

    #[test]
    fn synthesizes_hysteria2_uri_from_structured_outbound() {
        let json = r#"{"outbounds": [
            {"type": "hysteria2", "server": "1.2.3.4", "server_port": 5555, "password": "pw", "tag": "node-1"}
        ]}"#;
        let found = extract_from_json_text(json);
        assert!(found.contains("hysteria2://pw@1.2.3.4:5555#node-1"));
    }

    #[test]
    fn hysteria2_outbound_without_password_yields_nothing() {
        let json = r#"{"outbounds": [{"type": "hysteria2", "server": "1.2.3.4"}]}"#;
        let found = extract_from_json_text(json);
        assert!(found.is_empty());
    }

    #[test]
    fn wireguard_outbound_becomes_a_discarded_comment_marker() {
        let json = r#"{"outbounds": [
            {"type": "wireguard", "tag": "wg-1",
             "settings": {"peers": [{"endpoint": "1.2.3.4:51820", "publicKey": "abc="}]}}
        ]}"#;
        let found = extract_from_json_text(json);
        assert!(found.contains("# Wireguard config: wg-1 - 1.2.3.4:51820"));
    }

    #[test]
    fn structural_conversion_runs_alongside_string_scanning() {
        let json = r#"{
            "outbounds": [{"type": "hysteria2", "server": "h", "password": "p"}],
            "extra": {"link": "vmess://zzz"}
        }"#;
        let found = extract_from_json_text(json);
        assert!(found.iter().any(|u| u.starts_with("hysteria2://")));
        assert!(found.contains("vmess://zzz"));
    }
}
