use std::sync::Arc;

use prometheus::{
    histogram_opts, opts, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec, Registry,
};
use tokio::task::JoinHandle;
use tracing::info;

const NAMESPACE: &str = "vantage";

macro_rules! namespaced {
    ($name:expr) => {
        format!("{}_{}", NAMESPACE, $name)
    };
}

/// Process-wide metrics registry, shared by every component. Named and
/// structured after the teacher's `CoreMetrics`, trimmed to the counters
/// and gauges this system actually emits (§9.3):
///
/// - `vantage_records_total{status}` — link rows by `test_status`/flag.
/// - `vantage_batch_reserved_total` — records claimed into a test batch.
/// - `vantage_batch_completed_total{outcome}` — `ok` | `failed`.
/// - `vantage_slot_in_use` — inbound slots currently bound to a record.
/// - `vantage_external_call_duration_seconds{kind}` — bridge/xray/http
///   call latency, where `kind` is e.g. `"bridge_parse"`, `"xray_api"`,
///   `"probe_http"`.
pub struct CoreMetrics {
    registry: Registry,
    listen_port: Option<u16>,

    pub records_total: IntGaugeVec,
    pub batch_reserved_total: IntCounterVec,
    pub batch_completed_total: IntCounterVec,
    pub slot_in_use: IntGaugeVec,
    pub external_call_duration_seconds: HistogramVec,
}

impl CoreMetrics {
    pub fn new(listen_port: Option<u16>) -> prometheus::Result<Self> {
        let registry = Registry::new();

        let records_total = register_int_gauge_vec_with_registry!(
            opts!(namespaced!("records_total"), "Link records by status"),
            &["status"],
            registry
        )?;

        let batch_reserved_total = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("batch_reserved_total"),
                "Records claimed into a test batch"
            ),
            &["owner"],
            registry
        )?;

        let batch_completed_total = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("batch_completed_total"),
                "Completed per-record tests by outcome"
            ),
            &["outcome"],
            registry
        )?;

        let slot_in_use = register_int_gauge_vec_with_registry!(
            opts!(namespaced!("slot_in_use"), "Inbound slots currently bound"),
            &["role"],
            registry
        )?;

        let external_call_duration_seconds = register_histogram_vec_with_registry!(
            histogram_opts!(
                namespaced!("external_call_duration_seconds"),
                "Latency of calls to the link-parser bridge, Xray API, and geolocation probe"
            ),
            &["kind"],
            registry
        )?;

        Ok(CoreMetrics {
            registry,
            listen_port,
            records_total,
            batch_reserved_total,
            batch_completed_total,
            slot_in_use,
            external_call_duration_seconds,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> prometheus::Result<Vec<u8>> {
        let families = self.registry.gather();
        let mut buf = Vec::with_capacity(1024 * 16);
        prometheus::TextEncoder::new().encode(&families, &mut buf)?;
        Ok(buf)
    }

    /// Serve `/metrics` on `127.0.0.1:{listen_port}` only — the
    /// metrics endpoint is a local operational surface, not meant to be
    /// reachable beyond the host (§9.3). No-op if no port was configured.
    pub fn run_http_server(self: Arc<Self>) -> JoinHandle<()> {
        use warp::Filter;
        let Some(port) = self.listen_port else {
            info!("metrics server disabled (no --metrics-port)");
            return tokio::spawn(std::future::ready(()));
        };
        info!(port, "starting metrics server on 127.0.0.1");
        tokio::spawn(async move {
            let route = warp::path!("metrics")
                .map(move || {
                    warp::reply::with_header(
                        self.gather().expect("failed to encode metrics"),
                        "Content-Type",
                        "text/plain; charset=utf-8",
                    )
                })
                .or(warp::any().map(|| {
                    warp::reply::with_status("go look at /metrics", warp::http::StatusCode::NOT_FOUND)
                }));
            warp::serve(route).run(([127, 0, 0, 1], port)).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_produces_nonempty_text_report() {
        let metrics = CoreMetrics::new(None).unwrap();
        metrics.records_total.with_label_values(&["idle"]).set(3);
        let report = metrics.gather().unwrap();
        let text = String::from_utf8(report).unwrap();
        assert!(text.contains("vantage_records_total"));
    }
}
