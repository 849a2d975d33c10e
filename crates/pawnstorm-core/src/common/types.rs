//! # Shared Types and Constants
//!
//! Identifiers and defaults that both sides of the wire must agree on.
//!
//! ## Overview
//!
//! - [`PosId`] versions the authoritative position. Workers reject anything
//!   older than what they already accepted.
//! - [`JobId`] tags one dispatched search so replies can be matched to it.
//! - [`worker_name`] derives the logical name of a worker slot, which is also
//!   the key it registers under in the catalog.
//!
//! ## Constants
//!
//! - [`DEFAULT_MAX_FRAME_BYTES`] - upper bound on one encoded message
//! - [`DEFAULT_WORKER_ROLE`] - role tag workers heartbeat with
//! - [`DEFAULT_CATALOG_HOST`] / [`DEFAULT_CATALOG_PORT`] - naming service
//! - [`DEFAULT_HEARTBEAT_INTERVAL`] - how often workers re-register

use core::time::Duration;

/// Monotonic position version.
pub type PosId = u64;

/// Identifier of one dispatched search.
pub type JobId = u64;

/// Largest frame, in bytes, either side will buffer before giving up on it.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// The `type` workers register under in the catalog.
pub const DEFAULT_WORKER_ROLE: &str = "chess-worker";

/// Host of the catalog naming service.
pub const DEFAULT_CATALOG_HOST: &str = "catalog.cse.nd.edu";

/// Port of the catalog naming service, shared by the UDP heartbeat and the
/// HTTP query endpoint.
pub const DEFAULT_CATALOG_PORT: u16 = 9097;

/// The catalog forgets entries after a few minutes, so re-register well
/// within that.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Builds the logical name of worker slot `index`, e.g. `alpha-07`.
pub fn worker_name(base: &str, index: usize) -> String {
    format!("{base}-{index:02}")
}

/// Default HTTP endpoint of the catalog's record dump.
pub fn default_catalog_url() -> String {
    format!("http://{DEFAULT_CATALOG_HOST}:{DEFAULT_CATALOG_PORT}/query.json")
}
