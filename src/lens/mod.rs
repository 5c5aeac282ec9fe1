//! Lens module
//!
//! Lenses combine lookup logic with output types that can be reused by the
//! CLI and the HTTP server alike.
//!
//! - [`enrich`]: IP, ASN and CIDR enrichment over the active datasets, with
//!   a short-lived result cache
//! - [`utils`]: output format selection and table helpers
//!
//! ```rust,ignore
//! use netinfo::lens::enrich::{EnrichmentEngine, LookupAnswer};
//! use netinfo::lens::utils::OutputFormat;
//! ```

pub mod enrich;
pub mod utils;
