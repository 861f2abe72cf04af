//! Error types for cryptographic operations.

use thiserror::Error;

/// Result type alias for cryptographic operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Cryptographic operation errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Certificate parsing or validation failed.
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Signature creation or verification failed.
    #[error("Signature error: {0}")]
    Signature(String),

    /// Key exchange failed.
    #[error("Key exchange failed: {0}")]
    KeyExchange(String),

    /// AEAD encryption failed.
    #[error("AEAD encryption failed: {0}")]
    Encryption(String),

    /// AEAD decryption failed.
    #[error("AEAD decryption failed: {0}")]
    Decryption(String),

    /// Key derivation failed.
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// No exchange key is provisioned under the requested label.
    #[error("No exchange key under label {0}")]
    UnknownKeyLabel(u8),

    /// Invalid input length.
    #[error("Invalid input length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length in bytes.
        expected: usize,
        /// Actual length received in bytes.
        actual: usize,
    },

    /// Invalid private key.
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Invalid public key.
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Key store operation failed.
    #[error("Key store error: {0}")]
    KeyStore(String),
}
