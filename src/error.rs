//! Error types for warmpool

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("provider call failed: {0}")]
    Provider(String),

    #[error("provider call timed out after {0:?}")]
    ProviderTimeout(Duration),

    #[error("circuit open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    #[error("VM not found: {0}")]
    VmNotFound(String),

    #[error("unknown provider backend: {0}")]
    UnknownBackend(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for failures where the VM's real state is unknown and the
    /// affected entry should be left alone until the next pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. } | Error::ProviderTimeout(_))
    }
}
