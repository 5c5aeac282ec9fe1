use anyhow::{anyhow, Result};
use clap::Args;
use netinfo::{start_server, NetinfoConfig, ServerConfig};

/// Arguments for the Serve command
#[derive(Args)]
pub struct ServeArgs {
    /// Address to bind to
    #[clap(short, long, default_value = "127.0.0.1")]
    pub address: String,

    /// Port to listen on
    #[clap(short, long, default_value_t = 8080)]
    pub port: u16,
}

pub fn run(config: NetinfoConfig, args: ServeArgs) -> Result<()> {
    let server_config = ServerConfig::new()
        .with_address(args.address)
        .with_port(args.port);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow!("failed to start runtime: {}", e))?;
    runtime.block_on(start_server(config, server_config))
}
