use tracing::{debug, instrument};
use vantage_store::{Store, TagColumn};

use crate::error::PipelineError;

pub const DEFAULT_TAG_PREFIX: &str = "x_";

/// Assigns a random `outbound_tag` to every record still missing one
/// (§4.4, ported from `tag_updater.py`'s `fill_missing_outbound_tags`).
/// The actual random generation and collision retry live on
/// [`vantage_store::Store::allocate_tag`]; this component just drives it
/// over the batch of eligible records.
pub struct TagAllocator<'a> {
    store: &'a Store,
    prefix: String,
}

impl<'a> TagAllocator<'a> {
    pub fn new(store: &'a Store) -> Self {
        TagAllocator { store, prefix: DEFAULT_TAG_PREFIX.to_string() }
    }

    pub fn with_prefix(store: &'a Store, prefix: impl Into<String>) -> Self {
        TagAllocator { store, prefix: prefix.into() }
    }

    /// Tag up to `limit` records. A record that exhausts its retry budget
    /// (a collision on every attempt) is simply left for the next pass
    /// rather than treated as a hard pipeline error, matching the Python
    /// batch job's soft-retry semantics.
    #[instrument(skip(self))]
    pub fn run_once(&self, limit: i64) -> Result<u64, PipelineError> {
        let records = self.store.records_needing_outbound_tag(limit)?;
        let mut tagged = 0u64;
        for record in records {
            match self.store.allocate_tag(TagColumn::Outbound, record.id, &self.prefix) {
                Ok(_) => tagged += 1,
                Err(e) => debug!(id = record.id, error = %e, "tag allocation exhausted this pass"),
            }
        }
        Ok(tagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantage_store::Store;

    #[test]
    fn tags_every_eligible_record() {
        let store = Store::open_in_memory().unwrap();
        let a = store.insert_or_ignore_uri("vmess://a").unwrap();
        let b = store.insert_or_ignore_uri("vmess://b").unwrap();

        let allocator = TagAllocator::new(&store);
        let tagged = allocator.run_once(100).unwrap();
        assert_eq!(tagged, 2);

        let ra = store.get_record(a).unwrap().unwrap();
        let rb = store.get_record(b).unwrap().unwrap();
        assert!(ra.outbound_tag.unwrap().starts_with("x_"));
        assert_ne!(ra.id, rb.id);
        assert_ne!(rb.outbound_tag, None);
    }

    #[test]
    fn custom_prefix_is_honored() {
        let store = Store::open_in_memory().unwrap();
        store.insert_or_ignore_uri("vmess://a").unwrap();
        let allocator = TagAllocator::with_prefix(&store, "in_");
        allocator.run_once(100).unwrap();
        let record = store.records_needing_build(10).unwrap();
        assert!(record[0].outbound_tag.as_deref().unwrap().starts_with("in_"));
    }
}
