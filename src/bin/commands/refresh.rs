use super::{build_orchestrator, print_rows};
use anyhow::{anyhow, Result};
use clap::Args;
use netinfo::lens::utils::or_dash;
use netinfo::{DatasetKind, NetinfoConfig, OutputFormat, RefreshReport};
use serde::Serialize;
use tabled::Tabled;

/// Arguments for the Refresh command
#[derive(Args)]
pub struct RefreshArgs {
    /// Dataset to refresh: routing, as_names or geo (all when omitted)
    #[clap()]
    pub kind: Option<DatasetKind>,

    /// Re-download even if the dataset is fresh
    #[clap(long)]
    pub force: bool,
}

#[derive(Serialize)]
struct RefreshLine {
    kind: DatasetKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<RefreshReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Tabled)]
struct RefreshRow {
    dataset: String,
    outcome: String,
    source: String,
    entries: String,
}

pub fn run(config: NetinfoConfig, args: RefreshArgs, format: OutputFormat) -> Result<()> {
    let RefreshArgs { kind, force } = args;
    let orchestrator = build_orchestrator(config)?;
    let kinds = match kind {
        Some(kind) => vec![kind],
        None => DatasetKind::all().to_vec(),
    };

    let mut lines = Vec::new();
    for kind in kinds {
        // a fresh dataset on disk only needs loading
        orchestrator.restore(kind);
        let result = if force {
            orchestrator.force_refresh(kind)
        } else {
            orchestrator.ensure_fresh(kind)
        };
        lines.push(match result {
            Ok(report) => RefreshLine {
                kind,
                report: Some(report),
                error: None,
            },
            Err(e) => RefreshLine {
                kind,
                report: None,
                error: Some(e.to_string()),
            },
        });
    }

    let rows = lines
        .iter()
        .map(|line| match (&line.report, &line.error) {
            (Some(report), _) => RefreshRow {
                dataset: line.kind.to_string(),
                outcome: format!("{:?}", report.outcome).to_lowercase(),
                source: or_dash(report.identifier.as_deref()),
                entries: or_dash(report.entries),
            },
            (None, error) => RefreshRow {
                dataset: line.kind.to_string(),
                outcome: "failed".to_string(),
                source: or_dash(error.as_deref()),
                entries: "-".to_string(),
            },
        })
        .collect();
    print_rows::<RefreshRow, _>(rows, &lines, format)?;

    let failed = lines.iter().filter(|l| l.error.is_some()).count();
    if failed > 0 {
        return Err(anyhow!("{} of {} refreshes failed", failed, lines.len()));
    }
    Ok(())
}
