use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct OkItem {
    pub idx: u32,
    pub link_id: i64,
    pub port: u16,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub isp: Option<String>,
    pub duration_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailItem {
    pub idx: u32,
    pub link_id: i64,
    pub port: u16,
    pub error: String,
    pub error_detail: String,
    pub duration_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub ok: usize,
    pub fail: usize,
    pub tested: usize,
    pub db_is_alive_1_total: Option<i64>,
}

/// The per-batch JSON artifact written alongside the store (§4.10,
/// "write_report" in the original tester).
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub status: String,
    pub batch_id: String,
    pub db: String,
    pub count_requested: u32,
    pub count_tested: usize,
    pub parallel: u32,
    pub ports: PortRange,
    pub started_at_utc: String,
    pub finished_at_utc: String,
    pub duration_sec: f64,
    pub summary: BatchSummary,
    pub ok: Vec<OkItem>,
    pub fail: Vec<FailItem>,
}

/// Write the batch report to `report_file` (resolved relative to
/// `data_dir` when it is the literal `"auto"`), creating parent
/// directories as needed.
pub fn write_report(
    data_dir: &Path,
    count: u32,
    batch_id: &str,
    report_file: &str,
    report: &BatchReport,
) -> std::io::Result<PathBuf> {
    let path = match report_file.trim() {
        "" | "auto" => data_dir.join(format!("test_report_{count}_{batch_id}.json")),
        other => PathBuf::from(other),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(report).expect("report is always serializable");
    std::fs::write(&path, format!("{body}\n"))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report(batch_id: &str) -> BatchReport {
        BatchReport {
            status: "ok".to_string(),
            batch_id: batch_id.to_string(),
            db: "vantage.sqlite3".to_string(),
            count_requested: 2,
            count_tested: 1,
            parallel: 2,
            ports: PortRange { start: 9000, end: 9001 },
            started_at_utc: "2026-01-01T00:00:00Z".to_string(),
            finished_at_utc: "2026-01-01T00:00:01Z".to_string(),
            duration_sec: 1.0,
            summary: BatchSummary { ok: 1, fail: 0, tested: 1, db_is_alive_1_total: Some(5) },
            ok: vec![],
            fail: vec![],
        }
    }

    #[test]
    fn writes_auto_named_report_under_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let report = sample_report("batch-1");
        let path = write_report(dir.path(), 2, "batch-1", "auto", &report).unwrap();
        assert_eq!(path, dir.path().join("test_report_2_batch-1.json"));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"batch_id\": \"batch-1\""));
    }

    #[test]
    fn explicit_report_file_is_used_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("nested").join("custom.json");
        let report = sample_report("batch-2");
        let path = write_report(dir.path(), 1, "batch-2", explicit.to_str().unwrap(), &report).unwrap();
        assert_eq!(path, explicit);
        assert!(explicit.exists());
    }
}
