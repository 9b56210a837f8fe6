//! Engine configuration.
//!
//! All sections default sensibly, so a config file only needs the keys it
//! changes:
//!
//! ```json
//! { "broadcaster": { "delivery_timeout_ms": 5000 }, "ingest": { "alert_route": "both" } }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::broadcast::BroadcasterConfig;
use crate::error::{GeowatchResult, ValidationError};
use crate::ingest::{IngestConfig, RuntimeConfig};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeowatchConfig {
    /// Alert fan-out.
    pub broadcaster: BroadcasterConfig,
    /// Ingestion pipeline.
    pub ingest: IngestConfig,
    /// Ingestion worker pool.
    pub runtime: RuntimeConfig,
}

impl GeowatchConfig {
    /// Parses and validates a JSON document.
    ///
    /// # Errors
    /// `InvalidConfig` for malformed JSON or out-of-range values.
    pub fn from_json_str(json: &str) -> GeowatchResult<Self> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads, parses and validates a JSON file.
    ///
    /// # Errors
    /// `InvalidConfig` if the file cannot be read or is invalid.
    pub fn from_json_file(path: impl AsRef<Path>) -> GeowatchResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("{}: {e}", path.display()),
        })?;
        Self::from_json_str(&json)
    }

    /// Checks every section.
    ///
    /// # Errors
    /// The first section's `InvalidConfig`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.broadcaster.validate()?;
        self.ingest.validate()?;
        self.runtime.validate()
    }
}
