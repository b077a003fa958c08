//! RSA key pair for license requests
//!
//! The license server identifies the requester by the public modulus and
//! exponent of a PKCS#1 `RSAPublicKey`:
//! ```text
//! SEQUENCE {
//!     modulus         INTEGER,
//!     publicExponent  INTEGER
//! }
//! ```
//! Both integers are sent base64 encoded with `/` swapped for `_` so they
//! can be embedded as URL path segments.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;

use crate::error::CryptoError;
use crate::Result;

pub const KEY_SIZE_BITS: usize = 2048;

/// Shortest acceptable base64 modulus (a full 256-byte modulus, unpadded).
pub const MIN_MODULUS_LEN: usize = 342;

const TAG_SEQUENCE: u8 = 0x30;
const TAG_INTEGER: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicComponents {
    pub modulus: String,
    pub exponent: String,
}

pub struct KeyCryptographer {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    components: PublicComponents,
}

impl KeyCryptographer {
    /// Generate a fresh key pair for one fulfillment attempt
    pub fn generate() -> Result<Self> {
        let private_key = RsaPrivateKey::new(&mut OsRng, KEY_SIZE_BITS)
            .map_err(|e| CryptoError::KeyGenFailed(e.to_string()))?;
        let public_key = private_key.to_public_key();

        let der = public_key
            .to_pkcs1_der()
            .map_err(|e| CryptoError::KeyGenFailed(e.to_string()))?;
        let components = public_components(der.as_bytes(), KEY_SIZE_BITS)?;

        tracing::debug!(
            modulus_len = components.modulus.len(),
            "Generated RSA key pair"
        );

        Ok(Self {
            private_key,
            public_key,
            components,
        })
    }

    /// URL-safe base64 modulus
    pub fn modulus(&self) -> &str {
        &self.components.modulus
    }

    /// URL-safe base64 public exponent
    pub fn exponent(&self) -> &str {
        &self.components.exponent
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// RSA-OAEP (SHA-1) decryption with the private key
    pub fn decrypt_oaep(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.private_key
            .decrypt(Oaep::new::<Sha1>(), ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }

    /// AES-CBC decryption of IV-prefixed content
    pub fn decrypt_aes(&self, ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        crate::symmetric::decrypt_aes(ciphertext, key)
    }
}

impl std::fmt::Debug for KeyCryptographer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCryptographer")
            .field("components", &self.components)
            .finish_non_exhaustive()
    }
}

/// Extract the base64 modulus and exponent from a DER `RSAPublicKey`.
///
/// A modulus with its high bit set is DER-encoded with a leading zero byte;
/// that byte is dropped whenever the integer is longer than the key size.
pub fn public_components(der: &[u8], key_size_bits: usize) -> Result<PublicComponents> {
    let (sequence, _) = read_element(der, TAG_SEQUENCE)?;
    let (mut modulus, rest) = read_element(sequence, TAG_INTEGER)?;
    let (exponent, _) = read_element(rest, TAG_INTEGER)?;

    if modulus.len() > key_size_bits / 8 && modulus.first() == Some(&0) {
        modulus = &modulus[1..];
    }

    let encoded = STANDARD.encode(modulus);
    if encoded.len() < MIN_MODULUS_LEN {
        return Err(CryptoError::InvalidModulus(encoded.len()));
    }

    Ok(PublicComponents {
        modulus: url_path_safe(encoded),
        exponent: url_path_safe(STANDARD.encode(exponent)),
    })
}

fn url_path_safe(encoded: String) -> String {
    encoded.replace('/', "_")
}

/// Read one DER element with the expected tag, returning (content, remainder)
fn read_element(input: &[u8], tag: u8) -> Result<(&[u8], &[u8])> {
    let (&found, rest) = input
        .split_first()
        .ok_or_else(|| CryptoError::MalformedPublicKey("unexpected end of input".to_string()))?;
    if found != tag {
        return Err(CryptoError::MalformedPublicKey(format!(
            "expected tag {tag:#04x}, found {found:#04x}"
        )));
    }

    let (&first, rest) = rest
        .split_first()
        .ok_or_else(|| CryptoError::MalformedPublicKey("missing length".to_string()))?;

    let (len, rest) = if first & 0x80 == 0 {
        (first as usize, rest)
    } else {
        let count = (first & 0x7f) as usize;
        if count == 0 || count > 4 || rest.len() < count {
            return Err(CryptoError::MalformedPublicKey(
                "unsupported length encoding".to_string(),
            ));
        }
        let len = rest[..count]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        (len, &rest[count..])
    };

    if rest.len() < len {
        return Err(CryptoError::MalformedPublicKey(format!(
            "element length {len} exceeds remaining {}",
            rest.len()
        )));
    }

    Ok(rest.split_at(len))
}
