use serde_json::Value;
use tracing::{debug, instrument, warn};
use vantage_bridge::BridgeClient;
use vantage_core::canonicalize_value;
use vantage_store::{Record, Store, TagColumn};

use crate::error::PipelineError;
use crate::tag_allocator::DEFAULT_TAG_PREFIX;

/// Turn a URI into a tagged, canonical outbound JSON config via the
/// link-parser bridge, and write it onto the record (§4.5, §4.6). Records
/// the bridge can't convert are marked invalid rather than retried
/// forever.
///
/// `uri` is supplied by the caller rather than read off `record`: the same
/// builder backs both the bridge-first build stage over fresh URIs
/// (§4.5) and the repair stage's best-effort repaired/stripped URI
/// (§4.6).
pub struct JsonBuilder<'a> {
    store: &'a Store,
    bridge: &'a BridgeClient,
}

impl<'a> JsonBuilder<'a> {
    pub fn new(store: &'a Store, bridge: &'a BridgeClient) -> Self {
        JsonBuilder { store, bridge }
    }

    #[instrument(skip(self, record))]
    pub async fn build_one(&self, record: &Record, uri: &str) -> Result<bool, PipelineError> {
        let Some(raw) = self.bridge.convert(uri).await? else {
            debug!(id = record.id, "bridge could not convert uri, marking invalid");
            self.store.mark_invalid(record.id, "bridge_conversion_failed")?;
            return Ok(false);
        };

        let tag = match &record.outbound_tag {
            Some(tag) if !tag.is_empty() => tag.clone(),
            _ => self.store.allocate_tag(TagColumn::Outbound, record.id, DEFAULT_TAG_PREFIX)?,
        };

        let Some(tagged) = apply_outbound_tag(&raw, &tag) else {
            warn!(id = record.id, "bridge output was not a taggable json value");
            self.store.mark_invalid(record.id, "untaggable_bridge_output")?;
            return Ok(false);
        };

        let canonical = canonicalize_value(&tagged)?;
        self.store.update_config_json(record.id, &canonical)?;
        Ok(true)
    }
}

/// Inject `tag` into the bridge's JSON output. The bridge returns either
/// a single object or a single-element array wrapping one (§4.5).
fn apply_outbound_tag(raw: &str, tag: &str) -> Option<Value> {
    let mut value: Value = serde_json::from_str(raw.trim()).ok()?;
    match &mut value {
        Value::Object(map) => {
            map.insert("tag".to_string(), Value::String(tag.to_string()));
            Some(value)
        }
        Value::Array(items) if items.len() == 1 && items[0].is_object() => {
            items[0]
                .as_object_mut()
                .expect("checked is_object")
                .insert("tag".to_string(), Value::String(tag.to_string()));
            Some(value)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_tag_to_bare_object() {
        let v = apply_outbound_tag(r#"{"protocol":"vmess"}"#, "out-1").unwrap();
        assert_eq!(v["tag"], "out-1");
    }

    #[test]
    fn applies_tag_to_single_element_array() {
        let v = apply_outbound_tag(r#"[{"protocol":"vmess"}]"#, "out-2").unwrap();
        assert_eq!(v[0]["tag"], "out-2");
    }

    #[test]
    fn rejects_non_object_payloads() {
        assert!(apply_outbound_tag("null", "out-3").is_none());
        assert!(apply_outbound_tag("[1,2,3]", "out-3").is_none());
    }
}
