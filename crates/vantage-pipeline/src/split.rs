use regex::Regex;

/// Regex alternation for the scheme prefixes recognized for splitting,
/// ordered so the longer/more specific name is tried first
/// (`shadowsocks2022` before `shadowsocks`, `ssr` and `shadowsocks` before
/// the bare `ss`) — ported from `importer.py`'s `_split_multi_config_url`.
/// Broader than the four schemes the rest of the pipeline actually builds
/// configs for: a link that turns out to name an unsupported scheme after
/// splitting is still a link, and gets marked unsupported downstream like
/// any other.
fn split_pattern() -> Regex {
    Regex::new(r"(?i)(?:vmess|vless|trojan|shadowsocks2022|shadowsocks|ssr|ss|hysteria2|hysteria|hy2|tuic)://")
        .expect("static pattern is valid")
}

/// Split a URI that concatenates more than one `scheme://...` link into
/// its parts (§4.3). A URI with zero or one scheme match is returned
/// unchanged as a single-element vec; with two or more matches, each part
/// runs from one match's start to the next match's start (or end of
/// string), trimmed, dropping any part that's empty after trimming.
pub fn split_multi_uri(uri: &str) -> Vec<String> {
    let re = split_pattern();
    let matches: Vec<usize> = re.find_iter(uri).map(|m| m.start()).collect();
    if matches.len() < 2 {
        return vec![uri.trim().to_string()];
    }

    let mut parts = Vec::with_capacity(matches.len());
    for (i, &start) in matches.iter().enumerate() {
        let end = matches.get(i + 1).copied().unwrap_or(uri.len());
        let part = uri[start..end].trim();
        if !part.is_empty() {
            parts.push(part.to_string());
        }
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singleton_uri_is_unchanged() {
        let parts = split_multi_uri("vmess://abc123");
        assert_eq!(parts, vec!["vmess://abc123".to_string()]);
    }

    #[test]
    fn uri_with_no_scheme_is_unchanged() {
        let parts = split_multi_uri("not-a-uri-at-all");
        assert_eq!(parts, vec!["not-a-uri-at-all".to_string()]);
    }

    #[test]
    fn two_concatenated_links_split_into_two_parts() {
        let combined = "vmess://aaa\nvless://bbb?x=1";
        let parts = split_multi_uri(combined);
        assert_eq!(parts, vec!["vmess://aaa".to_string(), "vless://bbb?x=1".to_string()]);
    }

    #[test]
    fn three_concatenated_links_split_into_three_parts() {
        let combined = "trojan://a@h:1 ss://b@h:2 vmess://c";
        let parts = split_multi_uri(combined);
        assert_eq!(parts.len(), 3);
        assert!(parts[0].starts_with("trojan://"));
        assert!(parts[1].starts_with("ss://"));
        assert!(parts[2].starts_with("vmess://"));
    }

    #[test]
    fn ssr_and_shadowsocks_prefixes_are_not_confused_with_bare_ss() {
        let combined = "ssr://one vless://two";
        let parts = split_multi_uri(combined);
        assert_eq!(parts[0], "ssr://one");
        assert_eq!(parts[1], "vless://two");
    }
}
