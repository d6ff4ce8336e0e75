use serde_json::{json, Value};

/// Pull the single outbound object out of a record's `config_json`
/// (§4.10 step a). The builder (vantage-pipeline) writes either a bare
/// object, a `{"outbounds":[...]}` wrapper, or a single-element array —
/// accept whichever shape is present.
pub fn parse_outbound(config_json: &str) -> Result<Value, String> {
    let value: Value = serde_json::from_str(config_json).map_err(|e| e.to_string())?;

    if let Some(obj) = value.as_object() {
        if let Some(outbounds) = obj.get("outbounds").and_then(|v| v.as_array()) {
            return match outbounds.first() {
                Some(first) if first.is_object() => Ok(first.clone()),
                _ => Err("outbounds[0] not an object".to_string()),
            };
        }
        if obj.contains_key("protocol") || obj.contains_key("settings") {
            return Ok(value);
        }
    }
    if let Some(arr) = value.as_array() {
        if arr.len() == 1 && arr[0].is_object() {
            return Ok(arr[0].clone());
        }
    }
    Err("unexpected config_json shape".to_string())
}

/// Strip or rewrite settings the data plane can't actually honour before
/// handing the outbound to Xray (§4.9, mandatory):
/// - `streamSettings.tlsSettings.fingerprint == "none"`, which some
///   parsers emit literally instead of omitting the field, is deleted.
/// - `streamSettings.rawSettings.header` / `tcpSettings.header` (the two
///   names Xray has used for the same setting across versions) is
///   normalized: an empty or unrecognized `type` collapses to
///   `{"type":"none"}`; an `http` type is given `request`/`response`
///   objects if it doesn't already carry them.
pub fn sanitize_outbound(mut outbound: Value) -> Value {
    let fp_is_none = outbound
        .pointer("/streamSettings/tlsSettings/fingerprint")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().eq_ignore_ascii_case("none"))
        .unwrap_or(false);
    if fp_is_none {
        if let Some(tls) = outbound.pointer_mut("/streamSettings/tlsSettings") {
            if let Some(map) = tls.as_object_mut() {
                map.remove("fingerprint");
            }
        }
    }

    for settings_key in ["rawSettings", "tcpSettings"] {
        let pointer = format!("/streamSettings/{settings_key}/header");
        if let Some(header) = outbound.pointer_mut(&pointer) {
            normalize_header(header);
        }
    }

    outbound
}

/// Rewrite one `header` object in place per the rule above. Not grounded
/// in the original project — `test_batch_10.py` doesn't touch this field
/// at all — so this follows spec.md's literal description rather than a
/// ported function.
fn normalize_header(header: &mut Value) {
    let header_type = header.get("type").and_then(|v| v.as_str()).unwrap_or("").trim().to_string();

    if header_type.is_empty() || header_type.eq_ignore_ascii_case("none") {
        *header = json!({"type": "none"});
        return;
    }

    if header_type.eq_ignore_ascii_case("http") {
        let Some(map) = header.as_object_mut() else {
            return;
        };
        if !map.get("request").is_some_and(Value::is_object) {
            map.insert("request".to_string(), json!({}));
        }
        if !map.get("response").is_some_and(Value::is_object) {
            map.insert("response".to_string(), json!({}));
        }
        return;
    }

    // Any other named type is unrecognized by this data plane.
    *header = json!({"type": "none"});
}
