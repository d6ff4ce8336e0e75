//! Batch test engine binary: claims a batch of primary links, wires each
//! through a dedicated Xray inbound/outbound pair, probes it through the
//! geolocation probe, and attributes the outcome back to the store
//! (§4.10). Runs once or continuously until stopped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::{Result, WrapErr};
use tracing::{info, warn};
use uuid::Uuid;
use vantage_base::{load_settings, start_logging, BaseSettings, CoreMetrics, LogSettings};
use vantage_core::StopToken;
use vantage_store::Store;
use vantage_tester::{BatchConfig, BatchEngine, BatchReport, BatchStatus, BatchSummary, PortRange};
use vantage_xray::XrayClient;

#[derive(Debug, Parser)]
#[command(name = "vantage-tester", about = "Batch-test primary links through Xray")]
struct Args {
    /// Path to the shared sqlite store. Overrides `db_path` from the
    /// layered config file/env settings (§9.1) when given.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Records to claim per batch.
    #[arg(long, default_value_t = 100)]
    count: u32,

    /// Max probes running at once within a batch.
    #[arg(long, default_value_t = 10)]
    parallel: usize,

    /// First local port in the inbound slot pool.
    #[arg(long, default_value_t = 18000)]
    port_start: u16,

    /// Prefix for generated inbound tags (`{prefix}-{port}`).
    #[arg(long, default_value = "in_test_")]
    inbound_tag_prefix: String,

    /// Seconds a reservation lock is held before it's considered expired.
    #[arg(long, default_value_t = 90)]
    lock_timeout_sec: i64,

    /// Seconds to let one probe run before killing it.
    #[arg(long, default_value_t = 60)]
    check_timeout_sec: u64,

    #[arg(long, default_value = "vantage")]
    socks_user: String,

    #[arg(long, default_value = "vantage")]
    socks_pass: String,

    #[arg(long, default_value = "127.0.0.1")]
    socks_listen: String,

    #[arg(long, default_value = "xray")]
    xray_bin: String,

    /// Xray gRPC API address. `auto` probes the standard candidate ports.
    #[arg(long, default_value = "auto")]
    api_server: String,

    /// Path to the geolocation probe binary (not part of the upstream Xray
    /// control surface, so there is no single conventional flag for it;
    /// `vantage-tester` exposes it explicitly).
    #[arg(long, default_value = "check-host")]
    probe_bin: String,

    /// Identity recorded on claimed rows, for crash attribution.
    #[arg(long, default_value_t = default_owner())]
    owner: String,

    /// Batch id; a fresh UUID is generated if omitted.
    #[arg(long)]
    run_id: Option<String>,

    /// If present and the file exists, every component stops at its next
    /// checkpoint.
    #[arg(long)]
    stop_file: Option<PathBuf>,

    /// Seconds to sleep between batches when nothing was eligible.
    #[arg(long, default_value_t = 2)]
    idle_sleep_sec: u64,

    /// Stop after this many batches (0 = unbounded, only meaningful with
    /// `--continuous`).
    #[arg(long, default_value_t = 0)]
    max_batches: u64,

    /// Keep claiming and running batches until stopped or `--max-batches`
    /// is reached. Without this flag the process runs exactly one batch.
    #[arg(long)]
    continuous: bool,

    /// Where to write each batch's JSON report. `auto` writes next to the
    /// store; set to a path to override.
    #[arg(long, default_value = "auto")]
    report_file: String,

    /// Overrides the layered config's log level when given.
    #[arg(long)]
    log_level: Option<String>,

    /// Overrides the layered config's JSON-logging flag when set.
    #[arg(long)]
    log_json: bool,

    /// Serve Prometheus metrics on 127.0.0.1:<port>. Overrides the
    /// layered config's `metrics_port` when given.
    #[arg(long)]
    metrics_port: Option<u16>,
}

fn default_owner() -> String {
    format!("vantage-tester-{}", std::process::id())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    color_eyre::install().ok();
    let args = Args::parse();

    // Layer 1-2 (file + env, §9.1) come from `load_settings`; CLI flags
    // above always win when the operator actually passed them.
    let base: BaseSettings = load_settings("tester").unwrap_or_else(|e| {
        eprintln!("warning: using default base settings ({e})");
        BaseSettings { db_path: "vantage.sqlite3".to_string(), metrics_port: None, log: Default::default() }
    });

    let log = LogSettings {
        level: args.log_level.clone().unwrap_or(base.log.level),
        json: args.log_json || base.log.json,
    };
    start_logging(&log).wrap_err("failed to initialize logging")?;

    let metrics_port = args.metrics_port.or(base.metrics_port);
    let metrics = Arc::new(CoreMetrics::new(metrics_port).wrap_err("failed to set up metrics registry")?);
    metrics.clone().run_http_server();

    let db_path = args.db.clone().unwrap_or_else(|| PathBuf::from(base.db_path));
    let store = Store::open(&db_path).wrap_err("failed to open store")?;

    let xray = XrayClient::new(args.xray_bin.clone(), "auto");
    let api_server = if args.api_server == "auto" {
        xray.probe_api_server(&[]).await
    } else {
        args.api_server.clone()
    };
    xray.set_api_server(api_server.clone()).await;
    info!(api_server, "selected xray control endpoint");

    let stop = match &args.stop_file {
        Some(path) => StopToken::with_stop_file(path.clone()),
        None => StopToken::new(),
    };
    spawn_signal_handler(stop.clone());

    let config = BatchConfig {
        count: args.count,
        parallel: args.parallel,
        port_start: args.port_start,
        tag_prefix: args.inbound_tag_prefix.clone(),
        lock_timeout_sec: args.lock_timeout_sec,
        check_timeout_sec: args.check_timeout_sec,
        socks_user: args.socks_user.clone(),
        socks_pass: args.socks_pass.clone(),
        socks_listen: args.socks_listen.clone(),
        probe_bin: args.probe_bin.clone(),
        owner: args.owner.clone(),
    };

    let engine = BatchEngine::new(store.clone(), xray, config);
    let data_dir = db_path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));

    let mut batches_run: u64 = 0;
    let mut total_ok = 0usize;
    let mut total_fail = 0usize;

    loop {
        if stop.is_stopped() {
            info!("stop requested, exiting outer loop");
            break;
        }
        if args.max_batches != 0 && batches_run >= args.max_batches {
            info!(batches_run, "reached max-batches, exiting");
            break;
        }

        let batch_id = args.run_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let result = engine.run_batch(&batch_id, &stop).await.wrap_err("batch run failed")?;
        batches_run += 1;
        total_ok += result.ok.len();
        total_fail += result.fail.len();

        if result.status == BatchStatus::Idle {
            info!(idle_sleep_sec = args.idle_sleep_sec, "nothing eligible, sleeping");
            if !args.continuous {
                break;
            }
            tokio::time::sleep(Duration::from_secs(args.idle_sleep_sec)).await;
            continue;
        }

        let db_alive_total = store.count_alive().ok();
        let report = BatchReport {
            status: match result.status {
                BatchStatus::Ok => "ok".to_string(),
                BatchStatus::Idle => "idle".to_string(),
                BatchStatus::Stopped => "stopped".to_string(),
            },
            batch_id: batch_id.clone(),
            db: db_path.to_string_lossy().to_string(),
            count_requested: args.count,
            count_tested: result.tested(),
            parallel: args.parallel as u32,
            ports: result.ports.clone().unwrap_or(PortRange { start: args.port_start, end: args.port_start }),
            started_at_utc: result.started_at.to_rfc3339(),
            finished_at_utc: result.finished_at.to_rfc3339(),
            duration_sec: (result.finished_at - result.started_at).num_milliseconds() as f64 / 1000.0,
            summary: BatchSummary {
                ok: result.ok.len(),
                fail: result.fail.len(),
                tested: result.tested(),
                db_is_alive_1_total: db_alive_total,
            },
            ok: result.ok,
            fail: result.fail,
        };

        match vantage_tester::write_report(&data_dir, args.count, &batch_id, &args.report_file, &report) {
            Ok(path) => info!(path = %path.display(), ok = report.summary.ok, fail = report.summary.fail, "batch report written"),
            Err(e) => warn!(error = %e, "failed to write batch report"),
        }

        if result.status == BatchStatus::Stopped {
            break;
        }
        if !args.continuous {
            break;
        }
        if args.run_id.is_some() {
            // A fixed --run-id only makes sense for a single batch.
            break;
        }
    }

    info!(
        batches_run,
        total_ok, total_fail, "GLOBAL_SUMMARY: vantage-tester exiting"
    );
    Ok(())
}

fn spawn_signal_handler(stop: StopToken) {
    tokio::spawn(async move {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => info!("received SIGTERM"),
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        }
        stop.raise();
    });
}
