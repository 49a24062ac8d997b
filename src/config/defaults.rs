//! Default constants for bluesky configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Matching Defaults
// =============================================================================

/// Strong identifiers for properties, in priority order
pub const DEFAULT_PROPERTY_IDENTIFIERS: &[&str] = &["pm_property_id", "custom_id_1"];

/// Strong identifiers for tax lots
pub const DEFAULT_TAX_LOT_IDENTIFIERS: &[&str] = &["jurisdiction_tax_lot_id"];

/// Identifier texts treated as absent in addition to empty text and zero
pub const DEFAULT_BLANK_IDENTIFIERS: &[&str] = &["none", "null", "n/a"];

// =============================================================================
// Ingest Defaults
// =============================================================================

/// Worker threads for hashing and validation (0 = rayon's global pool)
pub const DEFAULT_HASH_WORKERS: usize = 0;

// =============================================================================
// Logging Defaults
// =============================================================================

/// Default tracing filter directive
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "BLUESKY_";

pub fn default_property_identifiers() -> Vec<String> {
    to_owned(DEFAULT_PROPERTY_IDENTIFIERS)
}

pub fn default_tax_lot_identifiers() -> Vec<String> {
    to_owned(DEFAULT_TAX_LOT_IDENTIFIERS)
}

pub fn default_blank_identifiers() -> Vec<String> {
    to_owned(DEFAULT_BLANK_IDENTIFIERS)
}

fn to_owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}
