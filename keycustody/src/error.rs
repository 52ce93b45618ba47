//! Error types for the key custody service

use thiserror::Error;

use crate::cache::CacheError;
use crate::crypto::CryptoError;

/// Service-wide error type
///
/// Callers are expected to match on the kind: `NotFound` ("never
/// established") is distinct from `Validation` ("bad request"), and only
/// `StorageUnavailable` is worth retrying.
#[derive(Error, Debug)]
pub enum CustodyError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Pre-key bundle incomplete: {0}")]
    BundleIncomplete(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Private key material unavailable: {0}")]
    PrivateMaterialUnavailable(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CustodyError {
    /// Whether the caller may retry the operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, CustodyError::StorageUnavailable(_))
    }
}

impl From<sqlx::Error> for CustodyError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => CustodyError::NotFound("row not found".to_string()),
            sqlx::Error::Database(ref db)
                if db.is_unique_violation() || db.is_check_violation() =>
            {
                CustodyError::Validation(db.message().to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                CustodyError::Serialization(e.to_string())
            }
            other => CustodyError::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CustodyError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        CustodyError::StorageUnavailable(format!("migration failed: {}", e))
    }
}

impl From<CryptoError> for CustodyError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AuthenticationFailed => CustodyError::AuthenticationFailed,
            CryptoError::InvalidKey(_) | CryptoError::SignatureError(_) => {
                CustodyError::Validation(e.to_string())
            }
            CryptoError::InvalidParameters(_) => CustodyError::Config(e.to_string()),
            CryptoError::KeyGenerationFailed(_) | CryptoError::EncryptionError(_) => {
                CustodyError::Internal(e.to_string())
            }
        }
    }
}

impl From<CacheError> for CustodyError {
    fn from(e: CacheError) -> Self {
        CustodyError::StorageUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for CustodyError {
    fn from(e: serde_json::Error) -> Self {
        CustodyError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for CustodyError {
    fn from(e: tokio::task::JoinError) -> Self {
        CustodyError::Internal(format!("background task failed: {}", e))
    }
}

/// Result type alias for custody operations
pub type CustodyResult<T> = Result<T, CustodyError>;

// Errors cross the admin/API boundary as their display string
impl serde::Serialize for CustodyError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
