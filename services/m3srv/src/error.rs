//! Error type for the M3 record service

use common::ConfigLoadError;
use m3_comlink::M3Error;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum M3SrvError {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Config file could not be read or deserialized
    #[error(transparent)]
    Load(#[from] ConfigLoadError),

    /// Engine or transport failure
    #[error("Device error: {0}")]
    Device(#[from] M3Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record not found: {0}")]
    RecordNotFound(String),
}

impl From<figment::Error> for M3SrvError {
    fn from(err: figment::Error) -> Self {
        M3SrvError::Config(err.to_string())
    }
}

impl M3SrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        M3SrvError::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, M3SrvError>;
