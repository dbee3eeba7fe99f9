//! Error handling for mediagraph
//!
//! This module defines the crate-level error type and a Result alias. Runtime
//! and graph errors live in `pipeline::error::PipelineError` and convert into
//! `Error::Pipeline`.

use crate::pipeline::error::PipelineError;
use thiserror::Error;

/// Main error type for mediagraph operations
#[derive(Error, Debug)]
pub enum Error {
    /// Errors raised by the graph runtime
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias for mediagraph operations
pub type Result<T> = std::result::Result<T, Error>;
