use super::{build_orchestrator, print_rows};
use anyhow::Result;
use chrono_humanize::HumanTime;
use netinfo::lens::utils::or_dash;
use netinfo::{DatasetKind, DatasetStatus, NetinfoConfig, OutputFormat};
use serde::Serialize;
use std::time::Duration;
use tabled::Tabled;

#[derive(Serialize)]
struct StatusLine {
    #[serde(flatten)]
    status: DatasetStatus,
    refresh_interval_secs: u64,
}

#[derive(Tabled)]
struct StatusRow {
    dataset: String,
    state: String,
    updated: String,
    refreshed_every: String,
    source: String,
    entries: String,
}

pub fn run(config: NetinfoConfig, format: OutputFormat) -> Result<()> {
    let intervals: Vec<u64> = DatasetKind::all()
        .iter()
        .map(|kind| config.refresh_interval_secs(*kind))
        .collect();
    let orchestrator = build_orchestrator(config)?;
    for kind in DatasetKind::all() {
        orchestrator.restore(kind);
    }

    let lines: Vec<StatusLine> = orchestrator
        .status()
        .into_iter()
        .zip(intervals)
        .map(|(status, refresh_interval_secs)| StatusLine {
            status,
            refresh_interval_secs,
        })
        .collect();

    let rows = lines
        .iter()
        .map(|line| {
            let status = &line.status;
            StatusRow {
                dataset: status.kind.to_string(),
                state: status.state.to_string(),
                updated: status
                    .last_update
                    .map(|t| format!("{} ({})", t.format("%Y-%m-%d %H:%M:%S"), HumanTime::from(t)))
                    .unwrap_or_else(|| "never".to_string()),
                refreshed_every: humantime::format_duration(Duration::from_secs(
                    line.refresh_interval_secs,
                ))
                .to_string(),
                source: or_dash(status.source_identifier.as_deref()),
                entries: or_dash(status.entries),
            }
        })
        .collect();

    print_rows::<StatusRow, _>(rows, &lines, format)
}
