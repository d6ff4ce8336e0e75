use serde_json::{json, Value};

/// Build the SOCKS5 inbound that the probe connects through (§4.10
/// step c, §6).
pub fn socks_inbound(tag: &str, listen: &str, port: u16, user: &str, password: &str) -> Value {
    json!({
        "tag": tag,
        "listen": listen,
        "port": port,
        "protocol": "socks",
        "settings": {
            "auth": "password",
            "accounts": [{"user": user, "pass": password}],
            "udp": true,
        },
    })
}

/// Build the routing rule binding one prepared inbound to its outbound
/// (§4.10 step d).
pub fn build_rule(rule_tag: &str, inbound_tag: &str, outbound_tag: &str) -> Value {
    json!({
        "type": "field",
        "ruleTag": rule_tag,
        "inboundTag": [inbound_tag],
        "outboundTag": outbound_tag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks_inbound_carries_credentials_and_udp() {
        let v = socks_inbound("in_test_9000", "127.0.0.1", 9000, "me", "pw");
        assert_eq!(v["protocol"], "socks");
        assert_eq!(v["settings"]["accounts"][0]["user"], "me");
        assert_eq!(v["settings"]["udp"], true);
    }

    #[test]
    fn build_rule_wraps_inbound_tag_in_array() {
        let v = build_rule("rT_abc", "in_test_9000", "xT_def");
        assert_eq!(v["inboundTag"], json!(["in_test_9000"]));
        assert_eq!(v["outboundTag"], "xT_def");
    }
}
