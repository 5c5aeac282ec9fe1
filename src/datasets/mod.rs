//! In-memory datasets and the parsers that build them
//!
//! - [`routing`]: longest-prefix-match table built from MRT RIB dumps
//! - [`as_names`]: AS number to organization name directory
//! - [`geo`]: MaxMind geolocation database and archive installer

pub mod as_names;
pub mod geo;
pub mod routing;

pub use as_names::{AsNameDirectory, AsNameParseReport, UNKNOWN_AS_NAME};
pub use geo::{GeoDirectory, GeoDirectoryLoader, GeoLocate, GeoRecord};
pub use routing::{RoutingEntry, RoutingTable, RoutingTableBuilder};
