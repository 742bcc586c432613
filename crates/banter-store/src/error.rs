use banter_core::error::{Classify, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or is busy. Retryable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored invariant is violated or a row is malformed. Fatal.
    #[error("Store corrupt: {0}")]
    Corrupt(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Unavailable(_) => ErrorKind::TransientExternal,
            StoreError::Corrupt(_) => ErrorKind::DataCorrupt,
            StoreError::NotFound(_) => ErrorKind::Unsupported,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                rusqlite::ErrorCode::DatabaseCorrupt
                | rusqlite::ErrorCode::NotADatabase => StoreError::Corrupt(e.to_string()),
                _ => StoreError::Unavailable(e.to_string()),
            },
            rusqlite::Error::QueryReturnedNoRows => {
                StoreError::NotFound("query returned no rows".to_string())
            }
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
            | rusqlite::Error::InvalidColumnType(..) => StoreError::Corrupt(e.to_string()),
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(format!("stored JSON column malformed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
