//! Error handling for the SCA authorisation node
//!
//! Two layers of errors exist here. [`ErrorKind`] is the business taxonomy that
//! drives the state machine and is reported back to the TPP. [`Error`] covers the
//! unexpected faults (storage down, invariant violations) that the surrounding web
//! layer turns into a generic server error.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::storage::StorageError;

/// Business error kinds reported to the caller of "update PSU data".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The authorisation does not exist or does not belong to the caller.
    ResourceUnknown,
    /// The authorisation deadline has passed.
    ResourceExpired,
    /// Attempted mutation of an authorisation that does not accept it.
    StatusInvalid,
    /// PSU authentication was rejected by the backend.
    PsuCredentialsInvalid,
    /// The submitted SCA method is not one of the offered methods.
    ScaMethodUnknown,
    /// The confirmation code (OTP) was rejected.
    ScaInvalid,
    /// The backend timed out or was unreachable.
    ServiceUnavailable,
    /// Structural validation of the request failed.
    FormatError,
}

impl ErrorKind {
    /// The code string used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::ResourceUnknown => "RESOURCE_UNKNOWN",
            ErrorKind::ResourceExpired => "RESOURCE_EXPIRED",
            ErrorKind::StatusInvalid => "STATUS_INVALID",
            ErrorKind::PsuCredentialsInvalid => "PSU_CREDENTIALS_INVALID",
            ErrorKind::ScaMethodUnknown => "SCA_METHOD_UNKNOWN",
            ErrorKind::ScaInvalid => "SCA_INVALID",
            ErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorKind::FormatError => "FORMAT_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Unexpected faults of the SCA node
#[derive(Error, Debug)]
pub enum Error {
    /// Storage layer error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A programming invariant was violated
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for the SCA node
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by the caller-facing operations.
#[derive(Error, Debug)]
pub enum ScaError {
    /// An expected business condition rejected the request.
    #[error("{kind}: {message}")]
    Rejected {
        /// Error kind from the business taxonomy
        kind: ErrorKind,
        /// Human-readable detail
        message: String,
    },

    /// Something unexpected went wrong.
    #[error(transparent)]
    Fault(#[from] Error),
}

impl ScaError {
    /// Build a business rejection.
    pub fn rejected(kind: ErrorKind, message: impl Into<String>) -> Self {
        ScaError::Rejected {
            kind,
            message: message.into(),
        }
    }

    /// Returns the business error kind, if this is a rejection.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ScaError::Rejected { kind, .. } => Some(*kind),
            ScaError::Fault(_) => None,
        }
    }
}

impl From<StorageError> for ScaError {
    fn from(err: StorageError) -> Self {
        ScaError::Fault(Error::Storage(err))
    }
}
