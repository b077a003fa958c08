//! Structural parsing of container and package documents
//!
//! Only attribute lookup is needed, so documents go through the lenient
//! markup parser instead of a strict XML reader. Attribute names are matched
//! case-insensitively.

use scraper::Html;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("document is not valid UTF-8: {0}")]
    Encoding(String),

    #[error("document is empty")]
    Empty,
}

pub struct StructuredDocument {
    html: Html,
}

impl StructuredDocument {
    pub fn parse(bytes: &[u8]) -> Result<Self, DocumentError> {
        let text = std::str::from_utf8(bytes).map_err(|e| DocumentError::Encoding(e.to_string()))?;
        let text = text.trim_start_matches('\u{feff}');
        if text.trim().is_empty() {
            return Err(DocumentError::Empty);
        }

        Ok(Self {
            html: Html::parse_document(text),
        })
    }

    /// Values of every `key` attribute, in document order
    pub fn find_attribute_values(&self, key: &str) -> Vec<String> {
        let key = key.to_ascii_lowercase();
        self.html
            .root_element()
            .descendants()
            .filter_map(|node| node.value().as_element())
            .filter_map(|element| element.attr(&key))
            .map(str::to_string)
            .collect()
    }

    pub fn find_first_attribute_value(&self, key: &str) -> Option<String> {
        let key = key.to_ascii_lowercase();
        self.html
            .root_element()
            .descendants()
            .filter_map(|node| node.value().as_element())
            .find_map(|element| element.attr(&key))
            .map(str::to_string)
    }
}
