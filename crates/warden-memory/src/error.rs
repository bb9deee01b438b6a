//! Errors raised by the SQLite stores.

use thiserror::Error;
use uuid::Uuid;
use warden_types::WardenError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Task not found: {0}")]
    NotFound(Uuid),
    #[error("Database connection lock poisoned")]
    Poisoned,
}

impl From<StoreError> for WardenError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => WardenError::TaskNotFound(id),
            other => WardenError::Store(other.to_string()),
        }
    }
}
