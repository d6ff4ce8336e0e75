use base64::Engine;

use crate::error::CoreError;

/// Repair missing base64 padding (pad with `=` to a multiple of 4) and
/// decode. Shared by the collector (§4.2 step 2) and the JSON repairer
/// (§4.6 vmess/shadowsocks cases) — the original project
/// (`collector.py`, `json_repair_updater.py`) implements this twice; we
/// implement it once here and call it from both sites (§10).
pub fn decode_repaired(input: &str) -> Result<Vec<u8>, CoreError> {
    let stripped: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let padded = pad_base64(&stripped);
    base64::engine::general_purpose::STANDARD
        .decode(padded.as_bytes())
        .or_else(|_| {
            base64::engine::general_purpose::URL_SAFE
                .decode(padded.as_bytes())
        })
        .map_err(|_| CoreError::Base64)
}

fn pad_base64(s: &str) -> String {
    let rem = s.len() % 4;
    if rem == 0 {
        s.to_string()
    } else {
        let mut s = s.to_string();
        s.push_str(&"=".repeat(4 - rem));
        s
    }
}

/// Is this text plausibly base64 (after whitespace/padding repair)?
pub fn looks_like_base64(input: &str) -> bool {
    decode_repaired(input).is_ok()
}
