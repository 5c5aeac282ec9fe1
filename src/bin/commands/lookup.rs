use super::{build_orchestrator, print_rows};
use anyhow::Result;
use clap::Args;
use json_to_table::json_to_table;
use netinfo::lens::utils::{truncate_name, DEFAULT_NAME_MAX_LEN};
use netinfo::{EnrichmentEngine, NetinfoConfig, OutputFormat};
use tabled::Tabled;

/// Arguments for the Lookup command
#[derive(Args)]
pub struct LookupArgs {
    /// IPv4 or IPv6 address
    #[clap()]
    pub ip: String,
}

/// Arguments for the Asn command
#[derive(Args)]
pub struct AsnArgs {
    /// AS number, e.g. 13335 or AS13335
    #[clap()]
    pub asn: String,
}

/// Arguments for the Cidr command
#[derive(Args)]
pub struct CidrArgs {
    /// CIDR block, e.g. 192.0.2.0/30
    #[clap()]
    pub cidr: String,
}

fn engine(config: NetinfoConfig) -> Result<EnrichmentEngine> {
    Ok(EnrichmentEngine::new(build_orchestrator(config)?))
}

pub fn run_ip(config: NetinfoConfig, args: LookupArgs, format: OutputFormat) -> Result<()> {
    let result = engine(config)?.lookup_ip(&args.ip)?;

    if let Some(json) = format.render_json(&result) {
        println!("{}", json?);
        return Ok(());
    }
    let value = serde_json::to_value(&result)?;
    let mut table = json_to_table(&value);
    table.collapse();
    println!("{}", table);
    Ok(())
}

#[derive(Tabled)]
struct PrefixRow {
    asn: String,
    name: String,
    prefix: String,
}

pub fn run_asn(config: NetinfoConfig, args: AsnArgs, format: OutputFormat) -> Result<()> {
    let result = engine(config)?.lookup_asn(&args.asn)?;

    if result.prefixes.is_empty() && !format.is_json() {
        println!(
            "AS{} ({}) originates no prefixes in the current routing table",
            result.as_num, result.as_name
        );
        return Ok(());
    }

    let name = truncate_name(&result.as_name, DEFAULT_NAME_MAX_LEN);
    let rows = result
        .prefixes
        .iter()
        .map(|prefix| PrefixRow {
            asn: format!("AS{}", result.as_num),
            name: name.clone(),
            prefix: prefix.clone(),
        })
        .collect();
    print_rows::<PrefixRow, _>(rows, &result, format)
}

pub fn run_cidr(config: NetinfoConfig, args: CidrArgs, format: OutputFormat) -> Result<()> {
    let expansion = engine(config)?.expand_network(&args.cidr)?;

    if let Some(json) = format.render_json(&expansion) {
        println!("{}", json?);
        return Ok(());
    }
    for address in &expansion.network_addresses {
        println!("{}", address);
    }
    eprintln!("{}: {} addresses", expansion.cidr, expansion.network_size);
    Ok(())
}
