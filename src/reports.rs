//! Report store: strategy-partitioned analysis reports on disk plus an
//! append-only reject-decision log per report file.
//!
//! Layout under the data root:
//!
//! ```text
//! reports/<strategy_id>/analysis_YYYYMMDD_HHMMSS.json
//! decisions/<report_file>.ndjson
//! ```
//!
//! Report writes go through a temp-file-then-rename so an interrupted
//! generation never leaves a partial report behind.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::provider::GeneratedReport;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectDecision {
    #[serde(rename = "type")]
    pub kind: String,
    pub trade_key: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Fully hydrated report as served to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportPayload {
    pub trades: Vec<Value>,
    pub report_stats: Value,
    pub diagnostics: Value,
    pub source_health: Value,
    pub debug_stage_counts: Value,
    pub validation_warnings: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredReport {
    trades: Vec<Value>,
    report_stats: Value,
    diagnostics: Value,
    generated_at: DateTime<Utc>,
}

pub struct ReportStore {
    reports_dir: PathBuf,
    decisions_dir: PathBuf,
    /// Serializes the read-then-append in `persist_reject`.
    decision_lock: Mutex<()>,
}

impl ReportStore {
    pub fn new(data_root: &std::path::Path) -> Result<Self> {
        let reports_dir = data_root.join("reports");
        let decisions_dir = data_root.join("decisions");
        std::fs::create_dir_all(&reports_dir)
            .with_context(|| format!("Failed to create {}", reports_dir.display()))?;
        std::fs::create_dir_all(&decisions_dir)
            .with_context(|| format!("Failed to create {}", decisions_dir.display()))?;
        Ok(Self {
            reports_dir,
            decisions_dir,
            decision_lock: Mutex::new(()),
        })
    }

    // -- reports ------------------------------------------------------------

    /// Persist a generated report; returns the new filename.
    pub fn save_report(&self, strategy_id: &str, report: &GeneratedReport) -> Result<String> {
        let generated_at = Utc::now();
        let filename = format!("analysis_{}.json", generated_at.format("%Y%m%d_%H%M%S"));
        let dir = self.reports_dir.join(sanitize(strategy_id));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let stored = StoredReport {
            trades: report.trades.clone(),
            report_stats: report.report_stats.clone(),
            diagnostics: report.diagnostics.clone(),
            generated_at,
        };
        let path = dir.join(&filename);
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(&stored).context("Failed to serialize report")?;
        std::fs::write(&tmp_path, json)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("Failed to rename into {}", path.display()))?;

        tracing::info!(strategy = strategy_id, %filename, trades = report.trades.len(),
            "report persisted");
        Ok(filename)
    }

    /// Report filenames for a strategy, newest first. Timestamped names sort
    /// lexically, so a descending name sort is a descending time sort.
    pub fn list_reports(&self, strategy_id: &str) -> Result<Vec<String>> {
        let dir = self.reports_dir.join(sanitize(strategy_id));
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("analysis_") && name.ends_with(".json") {
                names.push(name);
            }
        }
        names.sort_by(|a, b| b.cmp(a));
        Ok(names)
    }

    pub fn get_report(&self, strategy_id: &str, name: &str) -> Result<ReportPayload> {
        if name.contains('/') || name.contains("..") || !name.ends_with(".json") {
            bail!("Invalid report name: {name}");
        }
        let path = self.reports_dir.join(sanitize(strategy_id)).join(name);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Report not found: {}", path.display()))?;
        let stored: StoredReport =
            serde_json::from_str(&raw).with_context(|| format!("Malformed report: {name}"))?;

        let mut validation_warnings = Vec::new();
        for (i, trade) in stored.trades.iter().enumerate() {
            if !trade.is_object() {
                validation_warnings.push(format!("trade[{i}] is not an object; skipped by UI"));
            } else if trade.get("symbol").and_then(Value::as_str).is_none() {
                validation_warnings.push(format!("trade[{i}] has no symbol"));
            }
        }

        let source_health = stored
            .diagnostics
            .get("source_health")
            .cloned()
            .unwrap_or(Value::Null);
        let debug_stage_counts = stored
            .diagnostics
            .get("stage_counts")
            .cloned()
            .unwrap_or(Value::Null);

        Ok(ReportPayload {
            trades: stored.trades,
            report_stats: stored.report_stats,
            diagnostics: stored.diagnostics,
            source_health,
            debug_stage_counts,
            validation_warnings,
        })
    }

    // -- reject decisions ---------------------------------------------------

    /// Append a reject decision. At most one entry per `(report_file,
    /// trade_key)`: duplicates are idempotent no-ops returning `Ok(false)`.
    pub fn persist_reject(
        &self,
        report_file: &str,
        trade_key: &str,
        reason: &str,
    ) -> Result<bool> {
        let _guard = self.decision_lock.lock().expect("decision lock");

        let existing = self.read_decisions(report_file)?;
        if existing.iter().any(|d| d.trade_key == trade_key) {
            return Ok(false);
        }

        let decision = RejectDecision {
            kind: "reject".to_string(),
            trade_key: trade_key.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        };
        let path = self.decisions_path(report_file);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let line = serde_json::to_string(&decision).context("Failed to serialize decision")?;
        writeln!(file, "{line}").with_context(|| format!("Failed to append {}", path.display()))?;
        Ok(true)
    }

    /// Ordered decision list for a report file (append order).
    pub fn get_decisions(&self, report_file: &str) -> Result<Vec<RejectDecision>> {
        let _guard = self.decision_lock.lock().expect("decision lock");
        self.read_decisions(report_file)
    }

    fn read_decisions(&self, report_file: &str) -> Result<Vec<RejectDecision>> {
        let path = self.decisions_path(report_file);
        if !path.exists() {
            return Ok(vec![]);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut decisions = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(d) => decisions.push(d),
                Err(e) => tracing::warn!(report_file, "skipping malformed decision line: {e}"),
            }
        }
        Ok(decisions)
    }

    fn decisions_path(&self, report_file: &str) -> PathBuf {
        self.decisions_dir
            .join(format!("{}.ndjson", sanitize(report_file)))
    }
}

/// Collapse anything path-hostile into underscores.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, ReportStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn sample_report() -> GeneratedReport {
        GeneratedReport {
            trades: vec![
                json!({"symbol": "SPY", "strategy_id": "put_credit_spread", "short_strike": 500.0}),
                json!({"symbol": "QQQ", "strategy_id": "put_credit_spread"}),
            ],
            report_stats: json!({"scanned": 120, "kept": 2}),
            diagnostics: json!({"stage_counts": {"filtered": 118}, "source_health": {"tradier": {"status": "green", "message": "ok", "last_http": 200}}}),
        }
    }

    #[test]
    fn save_then_list_newest_first() {
        let (_dir, store) = store();
        let name = store.save_report("put_credit_spread", &sample_report()).unwrap();
        assert!(name.starts_with("analysis_") && name.ends_with(".json"));

        let listed = store.list_reports("put_credit_spread").unwrap();
        assert_eq!(listed, vec![name]);
    }

    #[test]
    fn list_unknown_strategy_is_empty() {
        let (_dir, store) = store();
        assert!(store.list_reports("nonexistent").unwrap().is_empty());
    }

    #[test]
    fn get_report_round_trips_and_extracts_diagnostics() {
        let (_dir, store) = store();
        let name = store.save_report("iron_condor", &sample_report()).unwrap();
        let payload = store.get_report("iron_condor", &name).unwrap();

        assert_eq!(payload.trades.len(), 2);
        assert_eq!(payload.report_stats["kept"], json!(2));
        assert_eq!(payload.debug_stage_counts["filtered"], json!(118));
        assert_eq!(payload.source_health["tradier"]["status"], json!("green"));
        assert!(payload.validation_warnings.is_empty());
    }

    #[test]
    fn malformed_trades_produce_validation_warnings_not_errors() {
        let (_dir, store) = store();
        let report = GeneratedReport {
            trades: vec![json!("not an object"), json!({"no_symbol": true})],
            report_stats: Value::Null,
            diagnostics: Value::Null,
        };
        let name = store.save_report("butterfly", &report).unwrap();
        let payload = store.get_report("butterfly", &name).unwrap();
        assert_eq!(payload.validation_warnings.len(), 2);
    }

    #[test]
    fn get_report_rejects_path_traversal() {
        let (_dir, store) = store();
        assert!(store.get_report("x", "../../etc/passwd.json").is_err());
        assert!(store.get_report("x", "analysis.txt").is_err());
    }

    #[test]
    fn reject_is_idempotent_per_report_and_key() {
        let (_dir, store) = store();
        let f = "analysis_20260801_120000.json";
        let k = "SPY|2026-09-18|credit_spread|500|497.5|45";

        assert!(store.persist_reject(f, k, "spread too wide").unwrap());
        assert!(!store.persist_reject(f, k, "different reason").unwrap());

        let decisions = store.get_decisions(f).unwrap();
        assert_eq!(decisions.len(), 1);
        // First write wins.
        assert_eq!(decisions[0].reason, "spread too wide");
        assert_eq!(decisions[0].kind, "reject");
    }

    #[test]
    fn same_key_different_reports_are_independent() {
        let (_dir, store) = store();
        let k = "SPY|NA|credit_spread|NA|NA|NA";
        assert!(store.persist_reject("report_a.json", k, "r1").unwrap());
        assert!(store.persist_reject("report_b.json", k, "r2").unwrap());
        assert_eq!(store.get_decisions("report_a.json").unwrap().len(), 1);
        assert_eq!(store.get_decisions("report_b.json").unwrap().len(), 1);
    }

    #[test]
    fn decisions_preserve_append_order() {
        let (_dir, store) = store();
        let f = "analysis_20260801_090000.json";
        store.persist_reject(f, "k1", "first").unwrap();
        store.persist_reject(f, "k2", "second").unwrap();
        store.persist_reject(f, "k3", "third").unwrap();

        let keys: Vec<String> = store
            .get_decisions(f)
            .unwrap()
            .into_iter()
            .map(|d| d.trade_key)
            .collect();
        assert_eq!(keys, vec!["k1", "k2", "k3"]);
    }
}
