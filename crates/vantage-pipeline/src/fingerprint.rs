use serde_json::{Map, Value};
use vantage_core::{canonicalize_value, sha256_hex, CoreError};

/// Find the outbound object a fingerprint is computed over: either the
/// bare top-level object the builder wrote, or `outbounds[0]` if the
/// bridge returned a wrapped/array shape (§4.7).
fn locate_outbound(value: &Value) -> Option<&Value> {
    if let Some(obj) = value.as_object() {
        if let Some(outbounds) = obj.get("outbounds").and_then(|v| v.as_array()) {
            return outbounds.first();
        }
        return Some(value);
    }
    if let Some(arr) = value.as_array() {
        return arr.first();
    }
    None
}

fn norm_host(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Lowercase a cipher/method name unless it contains characters outside
/// the plain ASCII alphanumeric/`-`/`_`/`.` set, in which case it's kept
/// verbatim rather than risk mangling something unexpected.
fn norm_cipher(s: &str) -> String {
    let t = s.trim();
    if t.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.') {
        t.to_lowercase()
    } else {
        t.to_string()
    }
}

fn safe_str(v: Option<&Value>) -> Option<String> {
    let s = match v? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn safe_str_allow_empty(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn safe_int(v: Option<&Value>) -> Option<i64> {
    match v? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// `settings.vnext[0]`/`users[0]` identity (§4.7, ported from
/// `hash_updater.py`'s `_extract_vmess_identity`).
fn extract_vmess_identity(outbound: &Value) -> Option<Map<String, Value>> {
    let vnext = outbound.pointer("/settings/vnext/0")?;
    let address = norm_host(&safe_str(vnext.get("address"))?);
    let port = safe_int(vnext.get("port"))?;
    let user = vnext.pointer("/users/0")?;
    let user_id = safe_str(user.get("id").or_else(|| user.get("uuid")))?.to_lowercase();
    if address.is_empty() || user_id.is_empty() {
        return None;
    }

    let mut m = Map::new();
    m.insert("protocol".into(), Value::String("vmess".into()));
    m.insert("address".into(), Value::String(address));
    m.insert("port".into(), Value::Number(port.into()));
    m.insert("user_id".into(), Value::String(user_id));
    if let Some(sec) = safe_str(user.get("security")) {
        m.insert("security".into(), Value::String(sec.to_lowercase()));
    }
    match safe_int(user.get("alterId").or_else(|| user.get("alter_id"))) {
        Some(alter) => {
            m.insert("alter_id".into(), Value::Number(alter.into()));
        }
        None => {
            if let Some(alter) = safe_str(user.get("alterId").or_else(|| user.get("alter_id"))) {
                m.insert("alter_id".into(), Value::String(alter));
            }
        }
    }
    Some(m)
}

/// Tries `settings.vnext[0]`/`users[0]` first, falls back to the flat
/// `settings.{address,port,id,encryption,flow}` shape (§4.7, ported from
/// `hash_updater.py`'s `_extract_vless_identity`).
fn extract_vless_identity(outbound: &Value) -> Option<Map<String, Value>> {
    let from_vnext = outbound.pointer("/settings/vnext/0").and_then(|vnext| {
        let address = safe_str(vnext.get("address"));
        let port = safe_int(vnext.get("port"));
        let user = vnext.pointer("/users/0");
        let id = user.and_then(|u| safe_str(u.get("id")));
        address.zip(port).zip(id).map(|((a, p), i)| {
            (
                a,
                p,
                i,
                user.and_then(|u| safe_str(u.get("encryption"))),
                user.and_then(|u| safe_str(u.get("flow"))),
            )
        })
    });

    let (address, port, user_id, encryption, flow) = match from_vnext {
        Some(found) => found,
        None => {
            let settings = outbound.get("settings")?;
            let address = safe_str(settings.get("address"))?;
            let port = safe_int(settings.get("port"))?;
            let id = safe_str(settings.get("id").or_else(|| settings.get("uuid")))?;
            (
                address,
                port,
                id,
                safe_str(settings.get("encryption")),
                safe_str(settings.get("flow")),
            )
        }
    };

    let address = norm_host(&address);
    let user_id = user_id.to_lowercase();
    if address.is_empty() || user_id.is_empty() {
        return None;
    }

    let mut m = Map::new();
    m.insert("protocol".into(), Value::String("vless".into()));
    m.insert("address".into(), Value::String(address));
    m.insert("port".into(), Value::Number(port.into()));
    m.insert("user_id".into(), Value::String(user_id));
    if let Some(enc) = encryption {
        m.insert("encryption".into(), Value::String(enc.to_lowercase()));
    }
    if let Some(flow) = flow {
        m.insert("flow".into(), Value::String(flow.to_lowercase()));
    }
    Some(m)
}

/// `settings.servers[0]` identity; password is case-preserved (§4.7,
/// ported from `hash_updater.py`'s `_extract_trojan_identity`).
fn extract_trojan_identity(outbound: &Value) -> Option<Map<String, Value>> {
    let server = outbound.pointer("/settings/servers/0")?;
    let address = norm_host(&safe_str(server.get("address"))?);
    let port = safe_int(server.get("port"))?;
    let password = safe_str(server.get("password"))?;
    if address.is_empty() || password.is_empty() {
        return None;
    }

    let mut m = Map::new();
    m.insert("protocol".into(), Value::String("trojan".into()));
    m.insert("address".into(), Value::String(address));
    m.insert("port".into(), Value::Number(port.into()));
    m.insert("password".into(), Value::String(password));
    Some(m)
}

/// Shadowsocks identity: tries `settings.servers[0]` (including its own
/// SIP008-style `users[0]` sub-dict), then falls back to flat
/// `settings.*`. An empty password is accepted — shadowsocks2022 and
/// some SIP008 servers legitimately have none (§4.7, ported from
/// `hash_updater.py`'s `_extract_shadowsocks_identity`).
fn extract_shadowsocks_identity(outbound: &Value) -> Option<Map<String, Value>> {
    let settings = outbound.get("settings")?;
    let server = settings.pointer("/servers/0");

    let from_server = server.and_then(|server| {
        let address = safe_str(server.get("address").or_else(|| server.get("server")).or_else(|| server.get("addr")));
        let port = safe_int(server.get("port").or_else(|| server.get("server_port")));
        address.zip(port).map(|(address, port)| {
            let mut method = safe_str(server.get("method").or_else(|| server.get("cipher")));
            let mut password =
                safe_str_allow_empty(server.get("password").or_else(|| server.get("pass")).or_else(|| server.get("passwd")));
            if password.is_none() {
                if let Some(user) = server.get("users").and_then(|u| u.get(0)) {
                    password = safe_str_allow_empty(user.get("password").or_else(|| user.get("pass")));
                    method = method.or_else(|| safe_str(user.get("method").or_else(|| user.get("cipher"))));
                }
            }
            (address, port, method, password, server)
        })
    });

    let (address, port, method, password, plugin_source) = match from_server {
        Some(found) => found,
        None => {
            let address = safe_str(settings.get("address").or_else(|| settings.get("server")))?;
            let port = safe_int(settings.get("port").or_else(|| settings.get("server_port")))?;
            let method = safe_str(settings.get("method").or_else(|| settings.get("cipher")));
            let password = safe_str_allow_empty(settings.get("password").or_else(|| settings.get("pass")));
            (address, port, method, password, settings)
        }
    };

    let address = norm_host(&address);
    let method = norm_cipher(&method?);
    let password = password.unwrap_or_default();
    if address.is_empty() || method.is_empty() {
        return None;
    }

    let mut m = Map::new();
    m.insert("protocol".into(), Value::String("shadowsocks".into()));
    m.insert("address".into(), Value::String(address));
    m.insert("port".into(), Value::Number(port.into()));
    m.insert("method".into(), Value::String(method));
    m.insert("password".into(), Value::String(password));

    if let Some(uot) = settings.get("uot").or_else(|| plugin_source.get("uot")).and_then(|v| v.as_bool()) {
        m.insert("uot".into(), Value::Bool(uot));
    }
    if let Some(plugin) = safe_str(settings.get("plugin").or_else(|| plugin_source.get("plugin"))) {
        m.insert("plugin".into(), Value::String(plugin));
    }
    if let Some(opts) = settings.get("plugin_opts").or_else(|| plugin_source.get("plugin_opts")) {
        if !opts.is_null() {
            m.insert("plugin_opts".into(), opts.clone());
        }
    }
    Some(m)
}

/// Common transport/TLS fields merged into every protocol's identity
/// dict (§4.7, ported from `hash_updater.py`'s
/// `_extract_stream_fingerprint`). `network` defaults to `tcp`;
/// TLS/reality is considered enabled either by an explicit non-`none`
/// `security` string or by the mere presence of a `tlsSettings`/
/// `realitySettings` object.
fn extract_stream_fingerprint(outbound: &Value, identity: &mut Map<String, Value>) {
    let stream = outbound.get("streamSettings");

    let network = stream
        .and_then(|s| s.get("network"))
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_else(|| "tcp".to_string());
    identity.insert("network".into(), Value::String(network.clone()));

    let security_raw = stream
        .and_then(|s| s.get("security"))
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_lowercase());
    let tls_settings = stream.and_then(|s| s.get("tlsSettings"));
    let reality_settings = stream.and_then(|s| s.get("realitySettings"));

    let tls_enabled = match security_raw.as_deref() {
        Some(sec) => sec != "none" && sec != "plaintext",
        None => tls_settings.is_some() || reality_settings.is_some(),
    };

    if tls_enabled {
        let tls_type = security_raw
            .clone()
            .unwrap_or_else(|| if reality_settings.is_some() { "reality".to_string() } else { "tls".to_string() });
        identity.insert("tls".into(), Value::String(tls_type));

        let sni = tls_settings
            .and_then(|t| t.get("serverName").or_else(|| t.get("sni")))
            .and_then(|v| v.as_str())
            .or_else(|| reality_settings.and_then(|r| r.get("serverName")).and_then(|v| v.as_str()))
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());
        if let Some(sni) = sni {
            identity.insert("sni".into(), Value::String(sni));
        }
    }

    if matches!(network.as_str(), "ws" | "http" | "h2" | "h3") {
        let (transport, other) = match network.as_str() {
            "ws" => (stream.and_then(|s| s.get("wsSettings")), stream.and_then(|s| s.get("httpSettings"))),
            _ => (stream.and_then(|s| s.get("httpSettings")), stream.and_then(|s| s.get("wsSettings"))),
        };

        let path = transport
            .and_then(|t| t.get("path"))
            .and_then(|v| v.as_str())
            .or_else(|| other.and_then(|t| t.get("path")).and_then(|v| v.as_str()))
            .filter(|p| !p.is_empty());
        if let Some(path) = path {
            identity.insert("path".into(), Value::String(path.to_string()));
        }

        let host = transport
            .and_then(|t| t.get("headers"))
            .and_then(|h| h.get("Host").or_else(|| h.get("host")))
            .and_then(|v| v.as_str())
            .or_else(|| {
                other
                    .and_then(|t| t.get("headers"))
                    .and_then(|h| h.get("Host").or_else(|| h.get("host")))
                    .and_then(|v| v.as_str())
            })
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());
        if let Some(host) = host {
            identity.insert("host".into(), Value::String(host));
        }
    }
}

/// Compute a record's fingerprint from its built `config_json` (§4.7).
/// Locates the outbound object, extracts a protocol-specific identity
/// dictionary (address/port/credentials — never the generated `tag`),
/// merges in the common stream-transport fields, and SHA-256-hashes the
/// canonical encoding of that identity dict. Two outbounds that only
/// differ by tag, or by JSON key order, fingerprint identically; two
/// that differ in address, port, credentials, or transport do not.
pub fn fingerprint_config(config_json: &str) -> Result<String, CoreError> {
    let value: Value = serde_json::from_str(config_json)?;
    let outbound = locate_outbound(&value).ok_or_else(|| CoreError::InvalidUri("config has no outbound object".to_string()))?;
    let protocol = outbound.get("protocol").and_then(|v| v.as_str()).unwrap_or_default().to_lowercase();

    let mut identity = match protocol.as_str() {
        "vmess" => extract_vmess_identity(outbound),
        "vless" => extract_vless_identity(outbound),
        "trojan" => extract_trojan_identity(outbound),
        "shadowsocks" => extract_shadowsocks_identity(outbound),
        other => return Err(CoreError::InvalidUri(format!("no fingerprint identity extractor for protocol {other:?}"))),
    }
    .ok_or_else(|| CoreError::InvalidUri(format!("could not extract {protocol} identity for fingerprinting")))?;

    extract_stream_fingerprint(outbound, &mut identity);

    let canonical = canonicalize_value(&Value::Object(identity))?;
    Ok(sha256_hex(&canonical))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vmess_config(address: &str, port: i64, id: &str, tag: &str) -> String {
        json!({
            "protocol": "vmess",
            "tag": tag,
            "settings": {"vnext": [{"address": address, "port": port, "users": [{"id": id, "security": "auto"}]}]},
            "streamSettings": {"network": "tcp"}
        })
        .to_string()
    }

    #[test]
    fn fingerprint_ignores_generated_tag() {
        let a = fingerprint_config(&vmess_config("example.com", 443, "abc-123", "out-1")).unwrap();
        let b = fingerprint_config(&vmess_config("example.com", 443, "abc-123", "out-2")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_on_connection_identity() {
        let a = fingerprint_config(&vmess_config("example.com", 443, "abc-123", "out-1")).unwrap();
        let b = fingerprint_config(&vmess_config("example.com", 8443, "abc-123", "out-1")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_normalizes_host_and_user_id_case() {
        let a = fingerprint_config(&vmess_config("Example.COM", 443, "ABC-123", "out-1")).unwrap();
        let b = fingerprint_config(&vmess_config("example.com", 443, "abc-123", "out-1")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_is_key_order_independent() {
        let a = r#"{"protocol":"trojan","settings":{"servers":[{"address":"h","port":1,"password":"p"}]}}"#;
        let b = r#"{"settings":{"servers":[{"password":"p","port":1,"address":"h"}]},"protocol":"trojan"}"#;
        assert_eq!(fingerprint_config(a).unwrap(), fingerprint_config(b).unwrap());
    }

    #[test]
    fn trojan_password_is_case_preserved() {
        let a = json!({"protocol":"trojan","settings":{"servers":[{"address":"h","port":1,"password":"MixedCase"}]}}).to_string();
        let b = json!({"protocol":"trojan","settings":{"servers":[{"address":"h","port":1,"password":"mixedcase"}]}}).to_string();
        assert_ne!(fingerprint_config(&a).unwrap(), fingerprint_config(&b).unwrap());
    }

    #[test]
    fn shadowsocks_accepts_empty_password() {
        let cfg = json!({
            "protocol": "shadowsocks",
            "settings": {"servers": [{"address": "h", "port": 1, "method": "none", "password": ""}]}
        })
        .to_string();
        assert!(fingerprint_config(&cfg).is_ok());
    }

    #[test]
    fn shadowsocks_falls_back_to_sip008_users_subdict() {
        let cfg = json!({
            "protocol": "shadowsocks",
            "settings": {"servers": [{"address": "h", "port": 1, "users": [{"password": "p", "method": "aes-256-gcm"}]}]}
        })
        .to_string();
        assert!(fingerprint_config(&cfg).is_ok());
    }

    #[test]
    fn vless_falls_back_to_flat_settings_shape() {
        let cfg = json!({
            "protocol": "vless",
            "settings": {"address": "h", "port": 443, "id": "user-id", "flow": "xtls-rprx-vision"}
        })
        .to_string();
        assert!(fingerprint_config(&cfg).is_ok());
    }

    #[test]
    fn stream_fingerprint_merges_sni_and_path() {
        let cfg = json!({
            "protocol": "vless",
            "settings": {"address": "h", "port": 443, "id": "user-id"},
            "streamSettings": {
                "network": "ws",
                "security": "tls",
                "tlsSettings": {"serverName": "Example.com"},
                "wsSettings": {"path": "/ray", "headers": {"Host": "Example.com"}}
            }
        })
        .to_string();
        let other = json!({
            "protocol": "vless",
            "settings": {"address": "h", "port": 443, "id": "user-id"},
            "streamSettings": {"network": "tcp"}
        })
        .to_string();
        assert_ne!(fingerprint_config(&cfg).unwrap(), fingerprint_config(&other).unwrap());
    }

    #[test]
    fn unsupported_protocol_is_rejected() {
        let cfg = json!({"protocol": "freedom", "settings": {}}).to_string();
        assert!(fingerprint_config(&cfg).is_err());
    }
}
