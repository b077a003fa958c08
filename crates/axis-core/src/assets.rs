//! Package manifest resolution
//!
//! Every path produced here is relative to the book directory, uses `/`
//! separators, and never escapes the book directory.

use std::collections::HashSet;

use crate::document::StructuredDocument;
use crate::error::FulfillmentError;
use crate::Result;

/// Relative path of the package manifest named by `container.xml`
pub fn package_path(container: &[u8]) -> Result<String> {
    let doc = StructuredDocument::parse(container)
        .map_err(|e| FulfillmentError::InvalidContainerFile(e.to_string()))?;

    let full_path = doc.find_first_attribute_value("full-path").ok_or_else(|| {
        FulfillmentError::InvalidContainerFile("no rootfile full-path".to_string())
    })?;

    resolve_href("", &full_path).ok_or_else(|| {
        FulfillmentError::InvalidContainerFile(format!("unusable full-path: {full_path}"))
    })
}

/// Book-relative paths of the assets a package manifest references, in
/// document order with duplicates collapsed
pub fn asset_paths(package_path: &str, package: &[u8]) -> Result<Vec<String>> {
    let doc = StructuredDocument::parse(package)
        .map_err(|e| FulfillmentError::InvalidPackageFile(e.to_string()))?;

    let base_dir = package_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
    let mut seen: HashSet<String> = HashSet::from([package_path.to_string()]);
    let mut assets = Vec::new();

    for href in doc.find_attribute_values("href") {
        match resolve_href(base_dir, &href) {
            Some(path) => {
                if seen.insert(path.clone()) {
                    assets.push(path);
                }
            }
            None => tracing::debug!(href = %href, "Skipping package reference"),
        }
    }

    if assets.is_empty() {
        return Err(FulfillmentError::InvalidPackageFile(format!(
            "{package_path} references no assets"
        )));
    }
    Ok(assets)
}

/// Schemes whose references never name a file inside the book
const EXTERNAL_SCHEMES: &[&str] = &[
    "http", "https", "data", "mailto", "urn", "ftp", "file", "javascript",
];

/// Resolve `href` against `base_dir`.
///
/// Absolute URLs, rooted paths, pure fragments and paths climbing above the
/// book directory resolve to `None`. Fragments and queries are dropped and
/// each segment is percent-decoded, so the result names the file on disk.
pub fn resolve_href(base_dir: &str, href: &str) -> Option<String> {
    let href = href.split(['#', '?']).next().unwrap_or_default().trim();
    if href.is_empty() || href.starts_with('/') || has_external_scheme(href) {
        return None;
    }

    let mut segments: Vec<String> = base_dir
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    for segment in href.split('/') {
        let segment = decode_segment(segment)?;
        match segment.as_str() {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            _ => segments.push(segment),
        }
    }

    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

fn has_external_scheme(href: &str) -> bool {
    let Some((scheme, _)) = href.split_once(':') else {
        return false;
    };
    !scheme.contains('/')
        && EXTERNAL_SCHEMES
            .iter()
            .any(|known| scheme.eq_ignore_ascii_case(known))
}

/// A decoded segment may not smuggle in a separator
fn decode_segment(segment: &str) -> Option<String> {
    let decoded = urlencoding::decode(segment).ok()?;
    if decoded.contains(['/', '\\', '\0']) {
        return None;
    }
    Some(decoded.into_owned())
}
