//! Cryptographic error types
//!
//! Errors raised by the key material codec and the key generator.

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Failed to generate a key
    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Failed to parse or decode a key
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    /// Signature verification failed
    #[error("Signature verification failed: {0}")]
    SignatureError(String),

    /// Unwrapping failed: wrong secret or tampered blob.
    ///
    /// Deliberately carries no detail about which input was at fault.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Codec parameters out of range
    #[error("Invalid codec parameters: {0}")]
    InvalidParameters(String),

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionError(String),
}

impl From<aes_gcm::Error> for CryptoError {
    fn from(_: aes_gcm::Error) -> Self {
        CryptoError::AuthenticationFailed
    }
}

impl From<ed25519_dalek::SignatureError> for CryptoError {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        CryptoError::SignatureError(e.to_string())
    }
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
