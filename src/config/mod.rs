//! Unified configuration for the reconciliation engine.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (bluesky.toml)
//! ```toml
//! [matching]
//! property_identifiers = ["pm_property_id", "custom_id_1"]
//! tax_lot_identifiers = ["jurisdiction_tax_lot_id"]
//! blank_identifiers = ["none", "n/a"]
//!
//! [merge]
//! precedence = "favor-new"
//!
//! [merge.field_precedence]
//! "extra_data.owner" = "favor-existing"
//!
//! [logging]
//! filter = "bluesky_rs=debug"
//! ```
//!
//! Environment variables use the `BLUESKY_` prefix and `__` between levels,
//! e.g. `BLUESKY_MERGE__PRECEDENCE=favor-existing`.

mod defaults;

pub use defaults::*;

use crate::error::{BlueskyError, Result};
use crate::merge::Precedence;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Main configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlueskyConfig {
    pub matching: MatchingConfig,
    pub merge: MergeConfig,
    pub ingest: IngestConfig,
    pub logging: LoggingConfig,
}

impl BlueskyConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(config_path: Option<&str>, overrides: ConfigOverrides) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(BlueskyConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with BLUESKY_ prefix
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        // Layer 3: CLI overrides
        figment = figment.merge(Serialized::defaults(overrides));

        figment
            .extract()
            .map_err(|e| BlueskyError::Config(e.to_string()))
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self> {
        Self::load(config_path, ConfigOverrides::default())
    }
}

/// Identity-matching rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Strong identifier fields for properties, in priority order
    pub property_identifiers: Vec<String>,
    /// Strong identifier fields for tax lots
    pub tax_lot_identifiers: Vec<String>,
    /// Extra identifier texts treated as absent (case-insensitive)
    pub blank_identifiers: Vec<String>,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            property_identifiers: default_property_identifiers(),
            tax_lot_identifiers: default_tax_lot_identifiers(),
            blank_identifiers: default_blank_identifiers(),
        }
    }
}

/// Merge precedence rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Winner when both sides hold different non-empty values
    pub precedence: Precedence,
    /// Per-key overrides; keys are field names or `extra_data.<key>`
    pub field_precedence: BTreeMap<String, Precedence>,
}

/// Batch ingest settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Worker threads for hashing and validation (0 = rayon's global pool)
    pub hash_workers: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            hash_workers: DEFAULT_HASH_WORKERS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest: Option<IngestOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precedence: Option<Precedence>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_workers: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}
