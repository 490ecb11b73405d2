//! Errors surfaced by the simulation harness.

use pilot_core::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),

    #[error("invalid pilot configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode summary: {0}")]
    Json(#[from] serde_json::Error),
}
