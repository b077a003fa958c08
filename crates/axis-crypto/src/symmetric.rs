//! AES-CBC content decryption
//!
//! Encrypted resources carry their IV in the first 16 bytes; the remainder
//! is AES-CBC with PKCS7 padding. The key size selects AES-128/192/256.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};

use crate::error::CryptoError;
use crate::Result;

pub const AES_IV_LEN: usize = 16;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub fn decrypt_aes(ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < AES_IV_LEN {
        return Err(CryptoError::DecryptionFailed(format!(
            "ciphertext of {} bytes has no IV",
            ciphertext.len()
        )));
    }
    let (iv, body) = ciphertext.split_at(AES_IV_LEN);

    match key.len() {
        16 => decrypt_with::<Aes128CbcDec>(key, iv, body),
        24 => decrypt_with::<Aes192CbcDec>(key, iv, body),
        32 => decrypt_with::<Aes256CbcDec>(key, iv, body),
        len => Err(CryptoError::DecryptionFailed(format!(
            "invalid AES key length: {len}"
        ))),
    }
}

fn decrypt_with<D>(key: &[u8], iv: &[u8], body: &[u8]) -> Result<Vec<u8>>
where
    D: KeyIvInit + BlockDecryptMut,
{
    D::new_from_slices(key, iv)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?
        .decrypt_padded_vec_mut::<Pkcs7>(body)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}
