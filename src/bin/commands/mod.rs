pub mod config;
pub mod lookup;
pub mod refresh;
pub mod serve;
pub mod status;

use anyhow::Result;
use netinfo::{HttpSourceFetcher, NetinfoConfig, NetinfoContext, OutputFormat, RefreshOrchestrator};
use serde::Serialize;
use std::sync::Arc;
use tabled::settings::Style;
use tabled::{Table, Tabled};

/// Orchestrator backed by the real upstream sources
pub(crate) fn build_orchestrator(config: NetinfoConfig) -> Result<Arc<RefreshOrchestrator>> {
    let fetcher = Arc::new(HttpSourceFetcher::new(&config));
    let ctx = Arc::new(NetinfoContext::new(config)?);
    Ok(Arc::new(RefreshOrchestrator::new(ctx, fetcher)))
}

/// Print `rows` as a table, or `value` as JSON for the JSON formats
pub(crate) fn print_rows<R, V>(rows: Vec<R>, value: &V, format: OutputFormat) -> Result<()>
where
    R: Tabled,
    V: Serialize,
{
    if let Some(json) = format.render_json(value) {
        println!("{}", json?);
        return Ok(());
    }
    let mut table = Table::new(rows);
    match format {
        OutputFormat::Markdown => table.with(Style::markdown()),
        _ => table.with(Style::rounded()),
    };
    println!("{}", table);
    Ok(())
}
