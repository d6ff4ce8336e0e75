use tracing::{debug, info, instrument, warn};
use vantage_bridge::BridgeClient;
use vantage_core::StopToken;
use vantage_store::Store;

use crate::builder::JsonBuilder;
use crate::error::PipelineError;
use crate::fingerprint::fingerprint_config;
use crate::repair::{repair_uri, strip_fragment, RepairOutcome};
use crate::split::split_multi_uri;
use crate::tag_allocator::TagAllocator;

/// Counts of what a pipeline run actually did, one struct per stage, so a
/// caller can log a single summary line per pass (§10, same shape as the
/// collector's run summary).
#[derive(Debug, Default)]
pub struct PipelineRunSummary {
    pub split: u64,
    pub tagged: u64,
    pub built: u64,
    pub build_failed: u64,
    pub repaired: u64,
    pub repair_failed: u64,
    pub marked_unsupported: u64,
    pub fingerprinted: u64,
    pub grouped: u64,
    pub primaries_elected: u64,
}

const BATCH_SIZE: i64 = 200;

/// Drives the split → tag → build → repair → fingerprint → group pipeline
/// over whatever records currently need each stage (§4.3–§4.8). Each stage
/// processes up to [`BATCH_SIZE`] records per call so a caller running in
/// a loop interleaves pipeline work with other duties instead of running
/// one stage to exhaustion before starting the next.
///
/// The build and repair stages are deliberately two separate passes, not
/// one: a fresh record's raw URI is tried against the bridge directly
/// first (§4.5, `json_updater.py`), and only a record that *fails* that —
/// `is_invalid = 1` — becomes a candidate for local repair heuristics
/// before a second bridge attempt (§4.6, `json_repair_updater.py`).
/// Running repair unconditionally on every fresh record, before ever
/// asking the bridge, skips the common case where the raw URI was already
/// fine.
pub struct Pipeline<'a> {
    store: &'a Store,
    bridge: &'a BridgeClient,
}

impl<'a> Pipeline<'a> {
    pub fn new(store: &'a Store, bridge: &'a BridgeClient) -> Self {
        Pipeline { store, bridge }
    }

    #[instrument(skip(self, stop))]
    pub async fn run_once(&self, stop: &StopToken) -> Result<PipelineRunSummary, PipelineError> {
        let mut summary = PipelineRunSummary::default();

        self.split_stage(stop, &mut summary)?;
        if stop.is_stopped() {
            return Ok(summary);
        }
        self.tag_stage(&mut summary)?;
        if stop.is_stopped() {
            return Ok(summary);
        }
        self.build_stage(stop, &mut summary).await?;
        if stop.is_stopped() {
            return Ok(summary);
        }
        self.repair_stage(stop, &mut summary).await?;
        if stop.is_stopped() {
            return Ok(summary);
        }
        self.fingerprint_stage(stop, &mut summary)?;
        if stop.is_stopped() {
            return Ok(summary);
        }
        self.grouping_stage(&mut summary)?;

        info!(
            split = summary.split,
            tagged = summary.tagged,
            built = summary.built,
            repaired = summary.repaired,
            fingerprinted = summary.fingerprinted,
            grouped = summary.grouped,
            "pipeline pass complete"
        );
        Ok(summary)
    }

    /// §4.3: pull apart any raw collected URI that actually concatenates
    /// more than one `scheme://` link. Each part becomes its own row (or
    /// is ignored if already present); the original multi-link row is
    /// marked invalid since it was never a link in its own right.
    fn split_stage(&self, stop: &StopToken, summary: &mut PipelineRunSummary) -> Result<(), PipelineError> {
        let records = self.store.records_needing_split(BATCH_SIZE)?;
        for record in records {
            if stop.is_stopped() {
                return Ok(());
            }
            let parts = split_multi_uri(&record.uri);
            if parts.len() < 2 {
                continue;
            }
            for part in &parts {
                self.store.insert_or_ignore_uri(part)?;
            }
            self.store.mark_invalid(record.id, "multi_uri_split")?;
            summary.split += 1;
        }
        Ok(())
    }

    /// §4.4: give every fresh record a persistent, random `outbound_tag`
    /// before it reaches the builder.
    fn tag_stage(&self, summary: &mut PipelineRunSummary) -> Result<(), PipelineError> {
        summary.tagged += TagAllocator::new(self.store).run_once(BATCH_SIZE)?;
        Ok(())
    }

    /// §4.5: try the bridge directly against each fresh record's raw URI.
    /// No local repair here — that's the fallback stage's job once this
    /// has failed and marked the record invalid.
    async fn build_stage(&self, stop: &StopToken, summary: &mut PipelineRunSummary) -> Result<(), PipelineError> {
        let records = self.store.records_needing_build(BATCH_SIZE)?;
        let builder = JsonBuilder::new(self.store, self.bridge);
        for record in records {
            if stop.is_stopped() {
                return Ok(());
            }
            let uri = record.uri.clone();
            match builder.build_one(&record, &uri).await {
                Ok(true) => summary.built += 1,
                Ok(false) => summary.build_failed += 1,
                Err(e) => {
                    warn!(id = record.id, error = %e, "build stage error");
                    summary.build_failed += 1;
                }
            }
        }
        Ok(())
    }

    /// §4.6: for records the bridge-first build stage rejected, try a
    /// local repair heuristic and retry the bridge against whatever URI
    /// results. A scheme we never support short-circuits straight to
    /// `is_unsupported` without touching the bridge at all.
    async fn repair_stage(&self, stop: &StopToken, summary: &mut PipelineRunSummary) -> Result<(), PipelineError> {
        self.store.clear_stale_repaired_uri()?;

        let records = self.store.records_awaiting_repair(BATCH_SIZE)?;
        let builder = JsonBuilder::new(self.store, self.bridge);
        for record in records {
            if stop.is_stopped() {
                return Ok(());
            }

            let candidate_uri = match repair_uri(&record.uri) {
                RepairOutcome::Unsupported => {
                    self.store.mark_unsupported(record.id)?;
                    self.store.clear_invalid_flag(record.id)?;
                    summary.marked_unsupported += 1;
                    continue;
                }
                RepairOutcome::NoProtocol => {
                    debug!(id = record.id, "uri has no recognizable scheme, cannot repair");
                    self.store.update_repaired_uri(record.id, &record.uri)?;
                    summary.repair_failed += 1;
                    continue;
                }
                RepairOutcome::Repaired(uri) | RepairOutcome::PassedThrough(uri) => uri,
                RepairOutcome::VmessUnrepairable | RepairOutcome::SsUnrepairable => strip_fragment(&record.uri),
            };

            match builder.build_one(&record, &candidate_uri).await {
                Ok(true) => {
                    self.store.clear_invalid_flag(record.id)?;
                    summary.repaired += 1;
                }
                Ok(false) => {
                    self.store.update_repaired_uri(record.id, &candidate_uri)?;
                    summary.repair_failed += 1;
                }
                Err(e) => {
                    warn!(id = record.id, error = %e, "repair stage error");
                    self.store.update_repaired_uri(record.id, &candidate_uri)?;
                    summary.repair_failed += 1;
                }
            }
        }
        Ok(())
    }

    fn fingerprint_stage(&self, stop: &StopToken, summary: &mut PipelineRunSummary) -> Result<(), PipelineError> {
        let records = self.store.records_needing_fingerprint(BATCH_SIZE)?;
        for record in records {
            if stop.is_stopped() {
                return Ok(());
            }
            match fingerprint_config(&record.config_json) {
                Ok(fp) => {
                    self.store.update_fingerprint(record.id, &fp)?;
                    summary.fingerprinted += 1;
                }
                Err(e) => {
                    warn!(id = record.id, error = %e, "could not fingerprint config, marking invalid");
                    self.store.mark_invalid(record.id, "fingerprint_failed")?;
                }
            }
        }
        Ok(())
    }

    fn grouping_stage(&self, summary: &mut PipelineRunSummary) -> Result<(), PipelineError> {
        summary.grouped = self.store.group_by_fingerprint()?;
        summary.primaries_elected = self.store.elect_primaries()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantage_bridge::{BridgeClient, BridgeConfig};
    use vantage_store::Store;

    /// None of these tests exercise the bridge process itself (the code
    /// paths under test short-circuit before ever calling `convert`), so
    /// the config here is never actually spawned.
    fn bridge_stub() -> BridgeClient {
        BridgeClient::new(BridgeConfig::default())
    }

    #[tokio::test]
    async fn split_stage_breaks_apart_a_concatenated_uri_and_invalidates_the_original() {
        let store = Store::open_in_memory().unwrap();
        let bridge = bridge_stub();
        let pipeline = Pipeline::new(&store, &bridge);
        let id = store.insert_or_ignore_uri("vmess://aaa\nvless://bbb?x=1").unwrap();

        let mut summary = PipelineRunSummary::default();
        pipeline.split_stage(&StopToken::new(), &mut summary).unwrap();

        assert_eq!(summary.split, 1);
        let original = store.get_record(id).unwrap().unwrap();
        assert!(original.is_invalid);

        // insert_or_ignore_uri is idempotent, so re-inserting either split
        // part just returns the row the split stage already created.
        let part_a = store.insert_or_ignore_uri("vmess://aaa").unwrap();
        let part_b = store.insert_or_ignore_uri("vless://bbb?x=1").unwrap();
        assert_ne!(part_a, id);
        assert_ne!(part_b, id);
    }

    #[tokio::test]
    async fn split_stage_leaves_a_singleton_uri_untouched() {
        let store = Store::open_in_memory().unwrap();
        let bridge = bridge_stub();
        let pipeline = Pipeline::new(&store, &bridge);
        let id = store.insert_or_ignore_uri("vmess://solo").unwrap();

        let mut summary = PipelineRunSummary::default();
        pipeline.split_stage(&StopToken::new(), &mut summary).unwrap();

        assert_eq!(summary.split, 0);
        let record = store.get_record(id).unwrap().unwrap();
        assert!(!record.is_invalid);
    }

    #[tokio::test]
    async fn repair_stage_marks_unsupported_scheme_valid_again() {
        let store = Store::open_in_memory().unwrap();
        let bridge = bridge_stub();
        let pipeline = Pipeline::new(&store, &bridge);
        let id = store.insert_or_ignore_uri("wireguard://abc").unwrap();
        store.mark_invalid(id, "bridge_conversion_failed").unwrap();

        let mut summary = PipelineRunSummary::default();
        pipeline.repair_stage(&StopToken::new(), &mut summary).await.unwrap();

        let record = store.get_record(id).unwrap().unwrap();
        assert!(record.is_unsupported);
        assert!(!record.is_invalid);
        assert_eq!(record.repaired_uri, None);
        assert_eq!(summary.marked_unsupported, 1);
    }

    #[tokio::test]
    async fn repair_stage_startup_cleanup_clears_stale_repaired_uri() {
        let store = Store::open_in_memory().unwrap();
        let bridge = bridge_stub();
        let pipeline = Pipeline::new(&store, &bridge);
        let id = store.insert_or_ignore_uri("vmess://fixed").unwrap();
        store.update_repaired_uri(id, "vmess://fixed-old-diagnostic").unwrap();

        let mut summary = PipelineRunSummary::default();
        pipeline.repair_stage(&StopToken::new(), &mut summary).await.unwrap();

        let record = store.get_record(id).unwrap().unwrap();
        assert_eq!(record.repaired_uri, None);
    }
}
