use anyhow::Result;
use netinfo::{NetinfoConfig, OutputFormat};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
struct ConfigInfo {
    config_file: String,
    data_dir: String,
    routing_refresh_secs: u64,
    as_names_refresh_secs: u64,
    geo_refresh_secs: u64,
    retry_backoff_secs: u64,
    cache_ttl_secs: u64,
    schedule_tick_secs: u64,
    refresh_policy: String,
    files: Vec<FileInfo>,
}

#[derive(Debug, Serialize)]
struct FileInfo {
    name: String,
    path: String,
    exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    size_bytes: Option<u64>,
}

fn file_info(name: &str, path: &Path) -> FileInfo {
    let size_bytes = std::fs::metadata(path).ok().map(|m| m.len());
    FileInfo {
        name: name.to_string(),
        path: path.to_string_lossy().to_string(),
        exists: size_bytes.is_some(),
        size_bytes,
    }
}

pub fn run(config: &NetinfoConfig, format: OutputFormat) -> Result<()> {
    let info = ConfigInfo {
        config_file: NetinfoConfig::config_file_path(),
        data_dir: config.data_dir.clone(),
        routing_refresh_secs: config.routing_refresh_secs,
        as_names_refresh_secs: config.as_names_refresh_secs,
        geo_refresh_secs: config.geo_refresh_secs,
        retry_backoff_secs: config.retry_backoff_secs,
        cache_ttl_secs: config.cache_ttl_secs,
        schedule_tick_secs: config.schedule_tick_secs,
        refresh_policy: config.refresh_policy.to_string(),
        files: vec![
            file_info("ledger", &config.ledger_path()),
            file_info("routing table", &config.routing_table_path()),
            file_info("AS names", &config.as_names_path()),
            file_info("geolocation", &config.geo_db_path()),
        ],
    };

    if let Some(json) = format.render_json(&info) {
        println!("{}", json?);
        return Ok(());
    }

    println!("Netinfo Configuration");
    println!("=====================\n");
    println!("Config file:        {}", info.config_file);
    println!("{}", config.summary());
    println!();
    println!("Data Files:");
    for file in &info.files {
        let size = match file.size_bytes {
            Some(size) => format_size(size),
            None => "not created".to_string(),
        };
        println!("  {:<16} {:>12}  {}", file.name, size, file.path);
    }

    eprintln!();
    eprintln!("Tips:");
    eprintln!("  Use --format json for machine-readable output");
    eprintln!("  Edit {} to customize settings", info.config_file);
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
