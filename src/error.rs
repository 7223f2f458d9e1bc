//! Service error taxonomy shared by the library and the HTTP handlers.

use thiserror::Error;

/// Errors surfaced to HTTP clients with a well-defined status code.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Dataset '{0}' not found")]
    UnknownDataset(String),

    #[error("Scale {scale} not available for dataset '{dataset}'")]
    ScaleUnavailable { dataset: String, scale: u32 },

    #[error("Max number of locations ({0}) exceeded")]
    TooManyLocations(u64),

    #[error("This dataset does not provide transform services.")]
    NoTransformService,

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// HTTP status code this error maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::UnknownDataset(_) => 404,
            ServiceError::ScaleUnavailable { .. } => 400,
            ServiceError::TooManyLocations(_) => 400,
            ServiceError::NoTransformService => 400,
            ServiceError::BadRequest(_) => 400,
            ServiceError::Internal(_) => 500,
        }
    }
}
