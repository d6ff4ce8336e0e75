mod engine;
mod error;
mod inbound;
mod outbound;
mod probe;
mod report;

pub use engine::{BatchConfig, BatchEngine, BatchRunResult, BatchStatus};
pub use error::TesterError;
pub use inbound::{build_rule, socks_inbound};
pub use outbound::{parse_outbound, sanitize_outbound};
pub use probe::{classify_probe_error, run_probe, ProbeOutcome};
pub use report::{write_report, BatchReport, BatchSummary, FailItem, OkItem, PortRange};
