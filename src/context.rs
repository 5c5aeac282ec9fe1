//! Process-wide context
//!
//! Built once at startup and handed to the orchestrator and the engine. It
//! owns the configuration and the freshness ledger, which would otherwise be
//! global state.

use crate::config::NetinfoConfig;
use crate::database::FreshnessLedger;
use anyhow::{anyhow, Result};
use std::fs;

pub struct NetinfoContext {
    config: NetinfoConfig,
    ledger: FreshnessLedger,
}

impl NetinfoContext {
    /// Create the data directory layout and open the ledger
    pub fn new(config: NetinfoConfig) -> Result<Self> {
        for dir in [config.ribs_dir(), config.geo_dir()] {
            fs::create_dir_all(&dir)
                .map_err(|e| anyhow!("Unable to create {}: {}", dir.display(), e))?;
        }
        let ledger = FreshnessLedger::open(&config.ledger_path())?;
        Ok(Self { config, ledger })
    }

    pub fn config(&self) -> &NetinfoConfig {
        &self.config
    }

    pub fn ledger(&self) -> &FreshnessLedger {
        &self.ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = NetinfoConfig::with_data_dir(dir.path().to_string_lossy());
        let ctx = NetinfoContext::new(config).unwrap();

        assert!(dir.path().join("asn").join("ribs").is_dir());
        assert!(dir.path().join("geoip").is_dir());
        assert!(ctx.ledger().path().exists());
    }
}
