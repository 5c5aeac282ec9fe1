use clap::{Parser, Subcommand};
use netinfo::*;
use tracing::Level;

mod commands;

use commands::lookup::{AsnArgs, CidrArgs, LookupArgs};
use commands::refresh::RefreshArgs;
use commands::serve::ServeArgs;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// configuration file path, by default $HOME/.netinfo/netinfo.toml is used
    #[clap(short, long)]
    config: Option<String>,

    /// Print debug information
    #[clap(long, global = true)]
    debug: bool,

    /// Output format: table, markdown, json, json-pretty
    #[clap(short, long, global = true, default_value = "table")]
    format: OutputFormat,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enrich an IP address with origin AS, netblock, AS name and location
    Lookup(LookupArgs),

    /// List the prefixes originated by an AS
    Asn(AsnArgs),

    /// Enumerate the addresses of a CIDR block
    Cidr(CidrArgs),

    /// Refresh datasets now
    Refresh(RefreshArgs),

    /// Show dataset freshness and sizes
    Status,

    /// Show the active configuration
    Config,

    /// Start the HTTP lookup server
    Serve(ServeArgs),
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.debug { Level::INFO } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let config = match NetinfoConfig::new(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("ERROR: unable to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let format = cli.format;
    let result = match cli.command {
        Commands::Lookup(args) => commands::lookup::run_ip(config, args, format),
        Commands::Asn(args) => commands::lookup::run_asn(config, args, format),
        Commands::Cidr(args) => commands::lookup::run_cidr(config, args, format),
        Commands::Refresh(args) => commands::refresh::run(config, args, format),
        Commands::Status => commands::status::run(config, format),
        Commands::Config => commands::config::run(&config, format),
        Commands::Serve(args) => commands::serve::run(config, args),
    };

    if let Err(e) = result {
        eprintln!("ERROR: {:#}", e);
        std::process::exit(1);
    }
}
