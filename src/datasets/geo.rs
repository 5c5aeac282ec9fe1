//! Geolocation directory
//!
//! The upstream archive is a `.tar.gz` with one MaxMind database plus
//! license and readme files. Installing it extracts the archive into a
//! scratch directory, opens the `.mmdb` member to make sure it is usable,
//! renames it to `current.mmdb` and deletes everything else.

use crate::config::GEO_CURRENT_FILE;
use anyhow::{anyhow, Result};
use flate2::read::GzDecoder;
use maxminddb::{geoip2, Reader};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::{debug, info, warn};

const SCRATCH_DIR: &str = "scratch";

/// Geolocation answer for one address; every field may be missing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoRecord {
    pub country_name: Option<String>,
    pub country_iso: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub region_name: Option<String>,
    pub region_iso: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
}

/// Anything that can geolocate an address
pub trait GeoLocate: Send + Sync {
    /// `None` when the database has no data for `ip`
    fn locate(&self, ip: IpAddr) -> Option<GeoRecord>;

    /// Short description for status output
    fn describe(&self) -> String {
        "geolocation database".to_string()
    }
}

/// MaxMind City database held in memory
pub struct GeoDirectory {
    reader: Reader<Vec<u8>>,
}

impl GeoDirectory {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .map_err(|e| anyhow!("Failed to read {}: {}", path.display(), e))?;
        let reader = Reader::from_source(bytes)
            .map_err(|e| anyhow!("Invalid geolocation database {}: {}", path.display(), e))?;
        Ok(Self { reader })
    }

    pub fn build_epoch(&self) -> u64 {
        self.reader.metadata.build_epoch
    }

    pub fn database_type(&self) -> &str {
        &self.reader.metadata.database_type
    }
}

impl GeoLocate for GeoDirectory {
    fn locate(&self, ip: IpAddr) -> Option<GeoRecord> {
        let lookup = self.reader.lookup(ip).ok()?;
        if !lookup.has_data() {
            return None;
        }
        let city: geoip2::City = match lookup.decode() {
            Ok(Some(city)) => city,
            Ok(None) => return None,
            Err(e) => {
                debug!("failed to decode geolocation for {}: {}", ip, e);
                return None;
            }
        };

        let subdivision = city.subdivisions.first();
        Some(GeoRecord {
            country_name: city.country.names.english.map(|s| s.to_string()),
            country_iso: city.country.iso_code.map(|s| s.to_string()),
            latitude: city.location.latitude,
            longitude: city.location.longitude,
            region_name: subdivision.and_then(|s| s.names.english.map(|n| n.to_string())),
            region_iso: subdivision.and_then(|s| s.iso_code.map(|n| n.to_string())),
            city: city.city.names.english.map(|s| s.to_string()),
            postal_code: city.postal.code.map(|s| s.to_string()),
        })
    }

    fn describe(&self) -> String {
        format!("{} (build {})", self.database_type(), self.build_epoch())
    }
}

// =============================================================================
// Archive installation
// =============================================================================

/// Extracts the database from a downloaded archive into the geo directory
pub struct GeoDirectoryLoader {
    geo_dir: PathBuf,
}

impl GeoDirectoryLoader {
    pub fn new(geo_dir: &Path) -> Self {
        Self {
            geo_dir: geo_dir.to_path_buf(),
        }
    }

    /// Canonical path of the installed database
    pub fn current_path(&self) -> PathBuf {
        self.geo_dir.join(GEO_CURRENT_FILE)
    }

    fn scratch_dir(&self) -> PathBuf {
        self.geo_dir.join(SCRATCH_DIR)
    }

    /// Unpack `archive` into the scratch directory and return the `.mmdb` member
    pub fn extract(&self, archive: &Path) -> Result<PathBuf> {
        let scratch = self.scratch_dir();
        if scratch.exists() {
            fs::remove_dir_all(&scratch)
                .map_err(|e| anyhow!("Failed to clear {}: {}", scratch.display(), e))?;
        }
        fs::create_dir_all(&scratch)
            .map_err(|e| anyhow!("Failed to create {}: {}", scratch.display(), e))?;

        let file = fs::File::open(archive)
            .map_err(|e| anyhow!("Failed to open archive {}: {}", archive.display(), e))?;
        Archive::new(GzDecoder::new(file))
            .unpack(&scratch)
            .map_err(|e| anyhow!("Failed to extract {}: {}", archive.display(), e))?;

        let mut found = Vec::new();
        collect_mmdb(&scratch, &mut found)?;
        found.sort();

        match found.len() {
            0 => Err(anyhow!(
                "no .mmdb database in archive {}",
                archive.display()
            )),
            1 => Ok(found.remove(0)),
            n => {
                warn!(
                    "archive {} holds {} databases, using {}",
                    archive.display(),
                    n,
                    found[0].display()
                );
                Ok(found.remove(0))
            }
        }
    }

    /// Move an extracted database to the canonical path and clean up
    pub fn install(&self, extracted: &Path) -> Result<PathBuf> {
        let current = self.current_path();
        fs::rename(extracted, &current).map_err(|e| {
            anyhow!(
                "Failed to move {} to {}: {}",
                extracted.display(),
                current.display(),
                e
            )
        })?;
        self.cleanup()?;
        info!("installed geolocation database at {}", current.display());
        Ok(current)
    }

    /// Remove everything in the geo directory except the current database
    pub fn cleanup(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.geo_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some(GEO_CURRENT_FILE) {
                continue;
            }
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(e) = removed {
                warn!("failed to remove {}: {}", path.display(), e);
            }
        }
        Ok(())
    }

    /// Extract, validate and install a downloaded archive
    ///
    /// On failure the previously installed database is left in place.
    pub fn install_from_archive(&self, archive: &Path) -> Result<GeoDirectory> {
        let result = self.extract(archive).and_then(|extracted| {
            let directory = GeoDirectory::open(&extracted)?;
            self.install(&extracted)?;
            Ok(directory)
        });
        if result.is_err() {
            self.cleanup()?;
        }
        result
    }
}

fn collect_mmdb(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        fs::read_dir(dir).map_err(|e| anyhow!("Failed to list {}: {}", dir.display(), e))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_mmdb(&path, found)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("mmdb") {
            found.push(path);
        }
    }
    Ok(())
}
