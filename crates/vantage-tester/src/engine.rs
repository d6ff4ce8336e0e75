use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use vantage_core::{classify_add_outbound_stderr, StopToken, TestErrorCode};
use vantage_store::{Record, Slot, Store, TestOutcome};
use vantage_xray::XrayClient;

use crate::error::TesterError;
use crate::inbound::{build_rule, socks_inbound};
use crate::outbound::{parse_outbound, sanitize_outbound};
use crate::probe::run_probe;
use crate::report::{FailItem, OkItem, PortRange};

const SLOT_ROLE: &str = "test";

/// Static configuration for one tester process (§4.10 "Configuration",
/// §6 "Process lifecycle").
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub count: u32,
    pub parallel: usize,
    pub port_start: u16,
    pub tag_prefix: String,
    pub lock_timeout_sec: i64,
    pub check_timeout_sec: u64,
    pub socks_user: String,
    pub socks_pass: String,
    pub socks_listen: String,
    pub probe_bin: String,
    pub owner: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Ok,
    Idle,
    Stopped,
}

/// What one [`BatchEngine::run_batch`] call actually did.
#[derive(Debug)]
pub struct BatchRunResult {
    pub status: BatchStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ports: Option<PortRange>,
    pub ok: Vec<OkItem>,
    pub fail: Vec<FailItem>,
}

impl BatchRunResult {
    pub fn tested(&self) -> usize {
        self.ok.len() + self.fail.len()
    }

    fn empty(status: BatchStatus, started_at: DateTime<Utc>, ports: Option<PortRange>) -> Self {
        BatchRunResult { status, started_at, finished_at: Utc::now(), ports, ok: Vec::new(), fail: Vec::new() }
    }
}

/// A pair that survived preparation and is ready for the probe phase.
struct PreparedJob {
    idx: u32,
    record_id: i64,
    slot_id: i64,
    port: u16,
    inbound_tag: String,
    outbound_tag: String,
}

/// Drives one batch of the test engine: reserve, wire through Xray,
/// probe in parallel, attribute, and unwind (§4.10 — the core
/// algorithm). One engine instance is reused across every batch a
/// process runs.
pub struct BatchEngine {
    store: Store,
    xray: XrayClient,
    config: BatchConfig,
}

impl BatchEngine {
    pub fn new(store: Store, xray: XrayClient, config: BatchConfig) -> Self {
        BatchEngine { store, xray, config }
    }

    #[instrument(skip(self, stop), fields(batch_id = %batch_id))]
    pub async fn run_batch(&self, batch_id: &str, stop: &StopToken) -> Result<BatchRunResult, TesterError> {
        let started_at = Utc::now();
        if stop.is_stopped() {
            return Ok(BatchRunResult::empty(BatchStatus::Stopped, started_at, None));
        }

        let slots = self.store.prepare_batch_slots(
            SLOT_ROLE,
            self.config.port_start,
            self.config.count,
            &self.config.tag_prefix,
        )?;
        let mut records = self.store.reserve_batch(
            batch_id,
            &self.config.owner,
            self.config.count,
            self.config.lock_timeout_sec,
        )?;

        let n = slots.len().min(records.len());
        for extra in records.split_off(n) {
            if let Err(e) = self.store.cancel_reservation(extra.id) {
                warn!(id = extra.id, error = %e, "failed to release an unpaired reservation");
            }
        }
        let slots = &slots[..n];
        let records = &records[..n];

        if n == 0 {
            return Ok(BatchRunResult::empty(BatchStatus::Idle, started_at, None));
        }

        let ports = PortRange { start: slots[0].port as u16, end: slots[n - 1].port as u16 };
        info!(items = n, port_start = ports.start, port_end = ports.end, "batch allocated");

        let mut created_outbounds: Vec<String> = Vec::new();
        let mut created_inbounds: Vec<String> = Vec::new();
        let mut created_rules: Vec<String> = Vec::new();
        let mut jobs: Vec<PreparedJob> = Vec::new();
        let mut fail_items: Vec<FailItem> = Vec::new();

        for (pair_idx, (slot, record)) in slots.iter().zip(records.iter()).enumerate() {
            let idx = (pair_idx + 1) as u32;
            if stop.is_stopped() {
                self.release_unprepared(record, slot, TestErrorCode::Stopped)?;
                continue;
            }
            match self
                .prepare_one(idx, slot, record, &mut created_outbounds, &mut created_inbounds, &mut created_rules)
                .await
            {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(e) => {
                    warn!(id = record.id, error = %e, "prep step returned a control-plane error");
                    fail_items.push(self.fail_item(idx, record.id, slot.port as u16, TestErrorCode::Xray, "control plane error", 0.0));
                    self.release_unprepared(record, slot, TestErrorCode::Xray)?;
                }
            }
        }

        if jobs.is_empty() {
            self.cleanup(&created_rules, &created_inbounds, &created_outbounds).await;
            return Ok(BatchRunResult {
                status: BatchStatus::Ok,
                started_at,
                finished_at: Utc::now(),
                ports: Some(ports),
                ok: Vec::new(),
                fail: fail_items,
            });
        }

        let (ok_items, probed_fail_items) = self.run_probes(jobs, stop).await;
        fail_items.extend(probed_fail_items);

        self.cleanup(&created_rules, &created_inbounds, &created_outbounds).await;

        Ok(BatchRunResult {
            status: BatchStatus::Ok,
            started_at,
            finished_at: Utc::now(),
            ports: Some(ports),
            ok: ok_items,
            fail: fail_items,
        })
    }

    /// Parse, sanitize, and wire one record through Xray (§4.10
    /// steps a–e). Returns `Ok(None)` once the failure has already been
    /// attributed and the slot released — the caller just moves on.
    async fn prepare_one(
        &self,
        idx: u32,
        slot: &Slot,
        record: &Record,
        created_outbounds: &mut Vec<String>,
        created_inbounds: &mut Vec<String>,
        created_rules: &mut Vec<String>,
    ) -> Result<Option<PreparedJob>, TesterError> {
        // Re-check primacy here rather than trusting the reservation
        // snapshot: the record could have been demoted by a grouping pass
        // that ran between reservation and this prep step.
        match self.store.get_record(record.id)? {
            Some(current) if current.is_primary => {}
            _ => {
                warn!(id = record.id, idx, "FAIL(prep) no longer primary");
                self.attribute_failure(record.id, TestErrorCode::NotPrimary)?;
                self.store.release_slot(slot.id)?;
                return Ok(None);
            }
        }

        let outbound = match parse_outbound(&record.config_json) {
            Ok(ob) => sanitize_outbound(ob),
            Err(detail) => {
                warn!(id = record.id, idx, %detail, "FAIL(prep) parse");
                self.attribute_failure(record.id, TestErrorCode::Parse)?;
                self.store.release_slot(slot.id)?;
                return Ok(None);
            }
        };

        let out_tag = format!("xT_{}", short_hex());
        let mut outbound = outbound;
        if let Some(map) = outbound.as_object_mut() {
            map.insert("tag".to_string(), json!(out_tag));
        }

        let add_out = self.xray.add_outbound(&outbound).await?;
        if !add_out.ok {
            let code = classify_add_outbound_stderr(&add_out.last.stderr);
            warn!(id = record.id, idx, code = %code, detail = %add_out.last.stderr, "FAIL(prep) add_outbound");
            if code.marks_unsupported() {
                self.store.mark_unsupported(record.id)?;
            }
            self.attribute_failure(record.id, code)?;
            self.store.release_slot(slot.id)?;
            return Ok(None);
        }
        created_outbounds.push(out_tag.clone());

        let inbound_tag = slot.tag.clone();
        let inbound = socks_inbound(
            &inbound_tag,
            &self.config.socks_listen,
            slot.port as u16,
            &self.config.socks_user,
            &self.config.socks_pass,
        );
        let add_in = self.xray.add_inbound(&inbound).await?;
        if !add_in.ok {
            warn!(id = record.id, idx, detail = %add_in.last.stderr, "FAIL(prep) add_inbound");
            let _ = self.xray.remove_outbound(&out_tag, true).await;
            created_outbounds.retain(|t| t != &out_tag);
            self.attribute_failure(record.id, TestErrorCode::Xray)?;
            self.store.release_slot(slot.id)?;
            return Ok(None);
        }
        created_inbounds.push(inbound_tag.clone());

        let rule_tag = format!("rT_{}", short_hex());
        let routing = json!({"routing": {"rules": [build_rule(&rule_tag, &inbound_tag, &out_tag)]}});
        let add_rules = self.xray.apply_rules(&routing, true).await?;
        if !add_rules.ok() {
            warn!(id = record.id, idx, detail = %add_rules.stderr, "FAIL(prep) apply_rules");
            let _ = self.xray.remove_inbound(&inbound_tag, true).await;
            let _ = self.xray.remove_outbound(&out_tag, true).await;
            created_inbounds.retain(|t| t != &inbound_tag);
            created_outbounds.retain(|t| t != &out_tag);
            self.attribute_failure(record.id, TestErrorCode::Rule)?;
            self.store.release_slot(slot.id)?;
            return Ok(None);
        }
        created_rules.push(rule_tag);

        self.store.bind_slot(slot.id, record.id, &out_tag)?;
        self.store.bind_record_to_slot(record.id, slot.port, &inbound_tag, &out_tag)?;

        Ok(Some(PreparedJob {
            idx,
            record_id: record.id,
            slot_id: slot.id,
            port: slot.port as u16,
            inbound_tag,
            outbound_tag: out_tag,
        }))
    }

    /// Run every prepared job's probe concurrently, bounded by
    /// `parallel` (§4.10 "Parallel probe phase"), attributing each
    /// result as it completes.
    async fn run_probes(&self, jobs: Vec<PreparedJob>, stop: &StopToken) -> (Vec<OkItem>, Vec<FailItem>) {
        let total = jobs.len();
        let parallel = self.config.parallel.max(1);
        let results = stream::iter(jobs.into_iter().map(|job| self.run_one_probe(job, stop, total)))
            .buffer_unordered(parallel)
            .collect::<Vec<_>>()
            .await;

        let mut ok_items = Vec::new();
        let mut fail_items = Vec::new();
        for result in results {
            match result {
                Ok(item) => ok_items.push(item),
                Err(item) => fail_items.push(item),
            }
        }
        (ok_items, fail_items)
    }

    async fn run_one_probe(&self, job: PreparedJob, stop: &StopToken, total: usize) -> Result<OkItem, FailItem> {
        let socks5 = format!(
            "socks5h://{}:{}@127.0.0.1:{}",
            self.config.socks_user, self.config.socks_pass, job.port
        );
        let start = tokio::time::Instant::now();
        let outcome = run_probe(&self.config.probe_bin, &socks5, self.config.check_timeout_sec, stop).await;
        let duration = start.elapsed().as_secs_f64();

        let record_outcome = if outcome.ok {
            info!(idx = job.idx, total, link_id = job.record_id, port = job.port, ip = ?outcome.ip, "OK");
            TestOutcome {
                ok: true,
                error: None,
                ip: outcome.ip.clone(),
                country: outcome.country.clone(),
                city: outcome.city.clone(),
                datacenter: outcome.isp.clone(),
            }
        } else {
            let code = outcome.error_code.clone().unwrap_or_else(|| "fail".to_string());
            warn!(idx = job.idx, total, link_id = job.record_id, port = job.port, code = %code, "FAIL");
            TestOutcome { ok: false, error: Some(code), ip: None, country: None, city: None, datacenter: None }
        };

        if let Err(e) = self.store.attribute_result(job.record_id, record_outcome) {
            warn!(id = job.record_id, error = %e, "failed to attribute probe result");
        }
        if let Err(e) = self.store.release_slot(job.slot_id) {
            warn!(slot_id = job.slot_id, error = %e, "failed to release slot after probe");
        }

        if outcome.ok {
            Ok(OkItem {
                idx: job.idx,
                link_id: job.record_id,
                port: job.port,
                ip: outcome.ip,
                country: outcome.country,
                city: outcome.city,
                isp: outcome.isp,
                duration_sec: duration,
            })
        } else {
            Err(FailItem {
                idx: job.idx,
                link_id: job.record_id,
                port: job.port,
                error: outcome.error_code.unwrap_or_else(|| "fail".to_string()),
                error_detail: outcome.error_detail.unwrap_or_default(),
                duration_sec: duration,
            })
        }
    }

    fn attribute_failure(&self, record_id: i64, code: TestErrorCode) -> Result<(), TesterError> {
        self.store.attribute_result(
            record_id,
            TestOutcome { ok: false, error: Some(code.to_string()), ip: None, country: None, city: None, datacenter: None },
        )?;
        Ok(())
    }

    fn release_unprepared(&self, record: &Record, slot: &Slot, code: TestErrorCode) -> Result<(), TesterError> {
        if code == TestErrorCode::Stopped {
            self.store.cancel_reservation(record.id)?;
        } else {
            self.attribute_failure(record.id, code)?;
        }
        self.store.release_slot(slot.id)?;
        Ok(())
    }

    fn fail_item(&self, idx: u32, link_id: i64, port: u16, code: TestErrorCode, detail: &str, duration_sec: f64) -> FailItem {
        FailItem { idx, link_id, port, error: code.to_string(), error_detail: detail.to_string(), duration_sec }
    }

    /// Best-effort teardown of everything this batch added to Xray:
    /// rules, then inbounds, then outbounds (§4.10 "Cleanup phase").
    async fn cleanup(&self, rule_tags: &[String], inbound_tags: &[String], outbound_tags: &[String]) {
        if !rule_tags.is_empty() {
            if let Err(e) = self.xray.remove_rules(rule_tags).await {
                warn!(error = %e, "failed to remove batch routing rules");
            }
        }
        for tag in inbound_tags {
            if let Err(e) = self.xray.remove_inbound(tag, true).await {
                warn!(tag, error = %e, "failed to remove batch inbound");
            }
        }
        for tag in outbound_tags {
            if let Err(e) = self.xray.remove_outbound(tag, true).await {
                warn!(tag, error = %e, "failed to remove batch outbound");
            }
        }
    }
}

fn short_hex() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}
