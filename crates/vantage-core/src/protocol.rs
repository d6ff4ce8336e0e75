use std::fmt;

/// The set of proxy schemes the core understands natively.
///
/// Anything else is [`Protocol::Unsupported`] and is carried around as the
/// lowercased scheme string so it can still be logged and reported without
/// the core ever having to guess at its semantics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    Unsupported(String),
}

impl Protocol {
    /// Parse the scheme prefix of a proxy URI (the part before `://`).
    ///
    /// Matching is case-insensitive; the original scheme text is preserved
    /// verbatim inside [`Protocol::Unsupported`] for diagnostics.
    pub fn from_uri(uri: &str) -> Self {
        let scheme = uri.split("://").next().unwrap_or(uri);
        Self::from_scheme(scheme)
    }

    pub fn from_scheme(scheme: &str) -> Self {
        match scheme.to_ascii_lowercase().as_str() {
            "vmess" => Protocol::Vmess,
            "vless" => Protocol::Vless,
            "trojan" => Protocol::Trojan,
            "ss" | "shadowsocks" => Protocol::Shadowsocks,
            _ => Protocol::Unsupported(scheme.to_string()),
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Protocol::Unsupported(_))
    }

    pub fn as_scheme(&self) -> &str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "ss",
            Protocol::Unsupported(s) => s,
        }
    }

    /// The four schemes the core ever treats as testable, in the order
    /// they're checked by the multi-scheme scanners in the collector and
    /// importer (§4.2, §4.3 of the spec).
    pub const SUPPORTED_SCHEMES: [&'static str; 4] = ["vmess", "vless", "trojan", "ss"];
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_scheme())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_schemes_case_insensitively() {
        assert_eq!(Protocol::from_uri("VMess://abc"), Protocol::Vmess);
        assert_eq!(Protocol::from_uri("vless://abc"), Protocol::Vless);
        assert_eq!(Protocol::from_uri("trojan://abc"), Protocol::Trojan);
        assert_eq!(Protocol::from_uri("ss://abc"), Protocol::Shadowsocks);
    }

    #[test]
    fn unknown_scheme_is_unsupported_but_preserves_text() {
        let p = Protocol::from_uri("hysteria2://abc");
        assert!(!p.is_supported());
        assert_eq!(p.as_scheme(), "hysteria2");
    }
}
