//! Crypto error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGenFailed(String),

    #[error("Invalid modulus: encoded length {0} is below the minimum")]
    InvalidModulus(usize),

    #[error("Malformed public key: {0}")]
    MalformedPublicKey(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
}
