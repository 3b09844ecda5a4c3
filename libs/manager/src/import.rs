//! Import seam for externally-represented tunnel configurations.
//!
//! Decoders for the actual external formats (QR payloads, config files,
//! archives of configs) live with the surfaces that own them; the manager
//! only consumes the decode contract and aggregates per-entry add failures
//! without aborting the whole batch.

use crate::Error;
use anyhow::Context as _;
use tunnel_model::{TunnelConfig, TunnelId};

/// Decode failure of an external tunnel representation.
///
/// Distinct from [`Error::InvalidConfiguration`]: an import error means the
/// bytes could not be understood at all, not that a decoded configuration
/// failed validation.
#[derive(thiserror::Error, Debug)]
#[error("{0:#}")]
pub struct ImportError(anyhow::Error);

impl From<anyhow::Error> for ImportError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

/// Decodes a byte payload into named tunnel configurations.
pub trait ConfigDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<(String, TunnelConfig)>, ImportError>;
}

/// Result of a batch import.
///
/// A failing entry never aborts the batch; it is recorded here instead.
#[derive(Debug, Default)]
pub struct ImportOutcome {
    pub added: Vec<TunnelId>,
    pub failed: Vec<(String, Error)>,
}

/// Decoder for a JSON array of `{"name": .., "config": ..}` documents.
pub struct JsonDecoder;

impl ConfigDecoder for JsonDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<(String, TunnelConfig)>, ImportError> {
        #[derive(serde::Deserialize)]
        struct Entry {
            name: String,
            config: TunnelConfig,
        }

        let entries = serde_json::from_slice::<Vec<Entry>>(bytes)
            .context("Failed to decode tunnel import as JSON")
            .map_err(ImportError::from)?;

        Ok(entries.into_iter().map(|e| (e.name, e.config)).collect())
    }
}
