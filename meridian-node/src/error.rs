//! Error type for the node binary.

use meridian_core::{ConfigError, MeridianError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Meridian(#[from] MeridianError),

    #[error("Failed to initialize logging: {0}")]
    Telemetry(String),
}

impl From<ConfigError> for NodeError {
    fn from(err: ConfigError) -> Self {
        NodeError::Meridian(err.into())
    }
}

impl From<StoreError> for NodeError {
    fn from(err: StoreError) -> Self {
        NodeError::Meridian(err.into())
    }
}

pub type NodeResult<T> = Result<T, NodeError>;
