use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[cfg(feature = "storage")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid stored value: {0}")]
    InvalidData(String),

    #[error("Duplicate authorisation: {0}")]
    Duplicate(String),

    /// The record was modified concurrently since it was read.
    #[error("Version conflict on {id}: expected version {expected}")]
    Conflict { id: String, expected: i64 },
}
