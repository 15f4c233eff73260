//! Error types for the layer registry.

use chrono::{DateTime, Utc};
use sift_common::SiftError;
use thiserror::Error;

/// Result type alias using RegistryError.
pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("Unknown product family: {0}")]
    UnknownFamily(String),

    #[error("No time step {time} in family {family}")]
    UnknownTime { family: String, time: DateTime<Utc> },

    #[error("Time step {time} of {family} is checked out by {jobs} job(s)")]
    InUse {
        family: String,
        time: DateTime<Utc>,
        jobs: usize,
    },

    #[error("Time step {time} of {family} is already cached")]
    Cached { family: String, time: DateTime<Utc> },

    #[error("Invalid time: {0}")]
    InvalidTime(String),
}

impl From<RegistryError> for SiftError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownFamily(_) | RegistryError::UnknownTime { .. } => {
                SiftError::NotFound(err.to_string())
            }
            RegistryError::InvalidTime(_) => SiftError::config(err.to_string()),
            RegistryError::InUse { .. } | RegistryError::Cached { .. } => {
                SiftError::build_failure(err.to_string())
            }
        }
    }
}
