//! Axis Cryptography
//!
//! Key material for one fulfillment attempt:
//! - 2048-bit RSA key pair, generated in memory and never persisted
//! - Public modulus/exponent in the form the license server expects
//! - RSA-OAEP (SHA-1) for license secrets, AES-CBC for content

mod error;
mod keys;
mod symmetric;

pub use error::CryptoError;
pub use keys::{public_components, KeyCryptographer, PublicComponents, KEY_SIZE_BITS, MIN_MODULUS_LEN};
pub use symmetric::{decrypt_aes, AES_IV_LEN};

pub type Result<T> = std::result::Result<T, CryptoError>;
