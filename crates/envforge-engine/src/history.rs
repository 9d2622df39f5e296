use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use envforge_core::write_atomic;

use crate::{RunReport, StateLayout, RUN_REPORT_SCHEMA_VERSION};

/// Persists `runs/<run-id>.json` and refreshes `last-run.json`.
pub fn write_run_report(layout: &StateLayout, report: &RunReport) -> Result<PathBuf> {
    let payload = report
        .to_json()
        .with_context(|| format!("failed to serialize run report: run_id={}", report.run_id))?;

    let path = layout.run_report_path(&report.run_id);
    write_atomic(&path, payload.as_bytes())
        .with_context(|| format!("failed to write run report: {}", path.display()))?;
    let last = layout.last_run_path();
    write_atomic(&last, payload.as_bytes())
        .with_context(|| format!("failed to write last run report: {}", last.display()))?;
    Ok(path)
}

pub fn read_run_report(layout: &StateLayout, run_id: &str) -> Result<Option<RunReport>> {
    read_report_file(&layout.run_report_path(run_id))
}

pub fn read_last_run(layout: &StateLayout) -> Result<Option<RunReport>> {
    read_report_file(&layout.last_run_path())
}

fn read_report_file(path: &Path) -> Result<Option<RunReport>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read run report: {}", path.display()));
        }
    };

    let report: RunReport = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse run report: {}", path.display()))?;
    if report.schema_version > RUN_REPORT_SCHEMA_VERSION {
        return Err(anyhow!(
            "run report schema is newer than supported: path={} schema_version={} supported={}",
            path.display(),
            report.schema_version,
            RUN_REPORT_SCHEMA_VERSION
        ));
    }
    Ok(Some(report))
}
