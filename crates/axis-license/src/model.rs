//! License request and document model

use std::path::{Path, PathBuf};

use axis_crypto::KeyCryptographer;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::LicenseError;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseRequest {
    pub isbn: String,
    pub vault_id: String,
    pub device_id: String,
    pub client_ip: String,
}

/// `<base>/license/<isbn>/<vault>/<device>/<ip>/<modulus>/<exponent>`
pub fn license_url(base: &str, request: &LicenseRequest, keys: &KeyCryptographer) -> Result<String> {
    let mut url = url::Url::parse(base).map_err(|e| LicenseError::InvalidUrl(e.to_string()))?;

    url.path_segments_mut()
        .map_err(|_| LicenseError::InvalidUrl(format!("{base} cannot be a base URL")))?
        .pop_if_empty()
        .extend([
            "license",
            request.isbn.as_str(),
            request.vault_id.as_str(),
            request.device_id.as_str(),
            request.client_ip.as_str(),
            keys.modulus(),
            keys.exponent(),
        ]);

    Ok(url.into())
}

/// Provider-issued license JSON. Only the fields the pipeline reads are modelled.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LicenseDocument {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub encryption: Option<EncryptionSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EncryptionSection {
    #[serde(default)]
    pub user_key: Option<UserKey>,
    #[serde(default)]
    pub content_key: Option<ContentKey>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserKey {
    #[serde(default)]
    pub key_check: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentKey {
    #[serde(default)]
    pub encrypted_value: Option<String>,
}

impl LicenseDocument {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| LicenseError::Corrupt(e.to_string()))
    }

    /// `encryption.user_key.key_check`, base64 decoded
    pub fn key_check(&self) -> Result<Vec<u8>> {
        let value = self
            .encryption
            .as_ref()
            .and_then(|e| e.user_key.as_ref())
            .and_then(|k| k.key_check.as_deref())
            .ok_or_else(|| LicenseError::Corrupt("missing encryption.user_key.key_check".to_string()))?;

        decode("key_check", value)
    }

    /// `encryption.content_key.encrypted_value`, base64 decoded
    pub fn encrypted_content_key(&self) -> Result<Vec<u8>> {
        let value = self
            .encryption
            .as_ref()
            .and_then(|e| e.content_key.as_ref())
            .and_then(|k| k.encrypted_value.as_deref())
            .ok_or_else(|| {
                LicenseError::Corrupt("missing encryption.content_key.encrypted_value".to_string())
            })?;

        decode("encrypted_value", value)
    }
}

fn decode(field: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value.trim())
        .map_err(|e| LicenseError::Corrupt(format!("{field} is not base64: {e}")))
}

/// What a later session needs to request the license again
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseRecord {
    pub isbn: String,
    pub vault_id: String,
    pub local_path: PathBuf,
}

impl LicenseRecord {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LicenseError::io(parent, e))?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(|e| LicenseError::io(path, e))?;
        std::fs::write(path, json).map_err(|e| LicenseError::io(path, e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| LicenseError::io(path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| LicenseError::Corrupt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_license_fields() {
        let json = br#"{
            "id": "lic-1",
            "encryption": {
                "user_key": { "key_check": "dmF1bHQ=" },
                "content_key": { "encrypted_value": "a2V5" }
            }
        }"#;

        let doc = LicenseDocument::parse(json).unwrap();
        assert_eq!(doc.id.as_deref(), Some("lic-1"));
        assert_eq!(doc.key_check().unwrap(), b"vault");
        assert_eq!(doc.encrypted_content_key().unwrap(), b"key");
    }

    #[test]
    fn test_missing_fields_are_corrupt() {
        let doc = LicenseDocument::parse(br#"{"encryption": {}}"#).unwrap();
        assert!(matches!(doc.key_check(), Err(LicenseError::Corrupt(_))));
        assert!(matches!(
            doc.encrypted_content_key(),
            Err(LicenseError::Corrupt(_))
        ));

        assert!(matches!(
            LicenseDocument::parse(b"not json"),
            Err(LicenseError::Corrupt(_))
        ));
    }

    #[test]
    fn test_bad_base64_is_corrupt() {
        let doc = LicenseDocument::parse(
            br#"{"encryption": {"user_key": {"key_check": "***"}}}"#,
        )
        .unwrap();
        assert!(matches!(doc.key_check(), Err(LicenseError::Corrupt(_))));
    }

    #[test]
    fn test_record_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("9780000000001/book_info.json");
        let record = LicenseRecord {
            isbn: "9780000000001".to_string(),
            vault_id: "vault-1".to_string(),
            local_path: dir.path().join("9780000000001"),
        };

        record.save(&path).unwrap();
        assert_eq!(LicenseRecord::load(&path).unwrap(), record);
    }
}
