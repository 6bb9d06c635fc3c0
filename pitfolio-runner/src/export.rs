//! Run artifacts: JSON report, weights CSV and a per-date summary CSV.
//!
//! The JSON report carries a `schema_version`; newer versions are rejected
//! on load.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::ValidatedConfig;
use crate::orchestrator::{RebalanceEvent, RunReport};

pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// What gets written as `report.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportArtifact {
    pub schema_version: u32,
    /// Configuration the run was made with, if recorded.
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    pub report: RunReport,
}

pub fn report_to_json(report: &RunReport, config: Option<&ValidatedConfig>) -> Result<String> {
    let config = config
        .map(serde_json::to_value)
        .transpose()
        .context("failed to serialize config")?;
    let artifact = ReportArtifact {
        schema_version: REPORT_SCHEMA_VERSION,
        config,
        report: report.clone(),
    };
    serde_json::to_string_pretty(&artifact).context("failed to serialize RunReport to JSON")
}

/// Parse a report written by [`report_to_json`].
pub fn report_from_json(json: &str) -> Result<ReportArtifact> {
    let artifact: ReportArtifact = serde_json::from_str(json).context("failed to parse report JSON")?;
    if artifact.schema_version > REPORT_SCHEMA_VERSION {
        bail!(
            "unsupported report schema version {} (max supported: {})",
            artifact.schema_version,
            REPORT_SCHEMA_VERSION
        );
    }
    Ok(artifact)
}

/// Long-format holdings: one row per (date, asset).
///
/// Columns: date, asset, weight, holding_periods
pub fn weights_to_csv(events: &[RebalanceEvent]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(["date", "asset", "weight", "holding_periods"])?;
    for event in events {
        let date = event.date.to_string();
        for (asset, weight) in &event.state.weights {
            wtr.write_record([
                date.as_str(),
                asset.as_str(),
                &format!("{weight:.8}"),
                &event.state.holding_periods(asset).to_string(),
            ])?;
        }
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

/// One row per rebalance.
///
/// Columns: date, eligible, shortlisted, holdings, added, removed, retained,
/// estimated_turnover, realized_turnover, cached
pub fn summary_to_csv(events: &[RebalanceEvent]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record([
        "date",
        "eligible",
        "shortlisted",
        "holdings",
        "added",
        "removed",
        "retained",
        "estimated_turnover",
        "realized_turnover",
        "cached",
    ])?;
    for e in events {
        wtr.write_record([
            &e.date.to_string(),
            &e.eligible_count.to_string(),
            &e.shortlist.len().to_string(),
            &e.state.len().to_string(),
            &e.decision.added.len().to_string(),
            &e.decision.removed.len().to_string(),
            &e.decision.retained.len().to_string(),
            &format!("{:.6}", e.decision.estimated_turnover),
            &format!("{:.6}", e.realized_turnover),
            &e.cached.rebalance.to_string(),
        ])?;
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

/// Write `report.json`, `weights.csv` and `summary.csv` under `dir`.
pub fn write_report(report: &RunReport, config: Option<&ValidatedConfig>, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    std::fs::write(dir.join("report.json"), report_to_json(report, config)?)?;
    std::fs::write(dir.join("weights.csv"), weights_to_csv(&report.events)?)?;
    std::fs::write(dir.join("summary.csv"), summary_to_csv(&report.events)?)?;
    Ok(dir.to_path_buf())
}

/// Load the report from a directory written by [`write_report`].
pub fn load_report(dir: &Path) -> Result<ReportArtifact> {
    let path = dir.join("report.json");
    let json = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    report_from_json(&json)
}
