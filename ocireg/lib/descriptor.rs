use std::{cmp::Ordering, collections::BTreeMap};

use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::{Digest, OciregError, OciregResult, Platform};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A content-addressed pointer to a blob or manifest.
///
/// Field order matches the OCI descriptor specification so constructed
/// descriptors serialize canonically.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// The media type of the referenced content.
    pub media_type: String,

    /// The digest of the referenced content.
    pub digest: Digest,

    /// The size of the referenced content in bytes.
    pub size: u64,

    /// Optional URLs the content may also be fetched from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,

    /// Optional annotations. Keys are unique and kept in sorted order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Optional inline content, base64 encoded. Must hash to `digest`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    /// Optional platform, present on index entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,

    /// Optional artifact type of the referenced manifest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

/// Predicate and ordering options for matching descriptors in a list.
#[derive(Debug, Clone, Default)]
pub struct MatchOpt {
    /// Require this artifact type.
    pub artifact_type: Option<String>,

    /// Require this subset of annotations. An empty value matches any value
    /// for that key.
    pub annotations: Option<BTreeMap<String, String>>,

    /// Require a matching platform.
    pub platform: Option<Platform>,

    /// Annotation to order matches by. Values parse as RFC3339 dates when
    /// possible, else compare as strings.
    pub sort_annotation: Option<String>,

    /// Reverse the sort order.
    pub sort_desc: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Descriptor {
    /// Creates a descriptor with only the required fields.
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            urls: None,
            annotations: None,
            data: None,
            platform: None,
            artifact_type: None,
        }
    }

    /// Returns the inline data when present and consistent with the digest
    /// and size; [`OciregError::NotFound`] otherwise.
    pub fn get_data(&self) -> OciregResult<Bytes> {
        let encoded = self
            .data
            .as_ref()
            .ok_or_else(|| OciregError::NotFound(format!("no inline data for {}", self.digest)))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| OciregError::NotFound(format!("undecodable inline data for {}", self.digest)))?;
        if decoded.len() as u64 != self.size
            || Digest::from_bytes(self.digest.algorithm(), &decoded) != self.digest
        {
            return Err(OciregError::NotFound(format!(
                "inline data does not match descriptor {}",
                self.digest
            )));
        }
        Ok(Bytes::from(decoded))
    }

    /// Stores inline data, keeping digest and size consistent.
    pub fn set_data(&mut self, data: &[u8]) {
        self.digest = Digest::from_bytes(self.digest.algorithm(), data);
        self.size = data.len() as u64;
        self.data = Some(base64::engine::general_purpose::STANDARD.encode(data));
    }

    /// A single annotation value.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.as_ref()?.get(key).map(String::as_str)
    }

    /// Adds or replaces an annotation.
    pub fn set_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
    }

    /// True when this descriptor satisfies the predicate parts of `opt`.
    pub fn matches(&self, opt: &MatchOpt) -> bool {
        if let Some(artifact_type) = &opt.artifact_type {
            if self.artifact_type.as_ref() != Some(artifact_type) {
                return false;
            }
        }
        if let Some(required) = &opt.annotations {
            for (key, value) in required {
                match self.annotation(key) {
                    Some(found) if value.is_empty() || found == value => {}
                    _ => return false,
                }
            }
        }
        if let Some(platform) = &opt.platform {
            match &self.platform {
                Some(own) if own.matches(platform) => {}
                _ => return false,
            }
        }
        true
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for Descriptor {
    /// Descriptors are equal when digest, size, media type, and annotations
    /// match. URLs, inline data, and platform are presentation details.
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
            && self.size == other.size
            && self.media_type == other.media_type
            && self.annotations == other.annotations
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Filters a descriptor list by `opt` and orders the result.
///
/// Entries carrying the sort annotation come first, ordered by its value
/// (RFC3339 dates compare as dates, otherwise as strings). Ties, and all
/// entries without the annotation, keep descending list order: later entries
/// win.
pub fn match_descriptors(list: &[Descriptor], opt: &MatchOpt) -> Vec<Descriptor> {
    let mut matched: Vec<(usize, &Descriptor)> = list
        .iter()
        .enumerate()
        .filter(|(_, d)| d.matches(opt))
        .collect();

    matched.sort_by(|(ai, a), (bi, b)| {
        if let Some(key) = &opt.sort_annotation {
            let ord = match (a.annotation(key), b.annotation(key)) {
                (Some(av), Some(bv)) => {
                    let ord = compare_annotation_values(av, bv);
                    if opt.sort_desc {
                        ord.reverse()
                    } else {
                        ord
                    }
                }
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        bi.cmp(ai)
    });

    matched.into_iter().map(|(_, d)| d.clone()).collect()
}

fn compare_annotation_values(a: &str, b: &str) -> Ordering {
    match (
        DateTime::<FixedOffset>::parse_from_rfc3339(a),
        DateTime::<FixedOffset>::parse_from_rfc3339(b),
    ) {
        (Ok(ad), Ok(bd)) => ad.cmp(&bd),
        _ => a.cmp(b),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediatype::MEDIA_TYPE_OCI_MANIFEST;

    fn descriptor(content: &[u8]) -> Descriptor {
        Descriptor::new(
            MEDIA_TYPE_OCI_MANIFEST,
            Digest::sha256(content),
            content.len() as u64,
        )
    }

    #[test]
    fn test_descriptor_serialize_field_names() {
        let mut desc = descriptor(b"content");
        desc.artifact_type = Some("application/vnd.example".into());
        let json = serde_json::to_string(&desc).unwrap();
        assert!(json.contains("\"mediaType\""));
        assert!(json.contains("\"artifactType\""));
        assert!(!json.contains("\"urls\""));
        let back: Descriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, desc);
    }

    #[test]
    fn test_descriptor_inline_data_verified() {
        let mut desc = descriptor(b"eggs");
        assert!(matches!(desc.get_data(), Err(OciregError::NotFound(_))));

        desc.set_data(b"eggs");
        assert_eq!(desc.get_data().unwrap(), Bytes::from_static(b"eggs"));

        // Tampered data is rejected
        desc.data = Some(base64::engine::general_purpose::STANDARD.encode(b"spam"));
        assert!(matches!(desc.get_data(), Err(OciregError::NotFound(_))));
    }

    #[test]
    fn test_descriptor_equality_ignores_urls_and_data() {
        let mut a = descriptor(b"same");
        let mut b = descriptor(b"same");
        a.urls = Some(vec!["https://mirror.example/x".into()]);
        b.data = Some("c2FtZQ==".into());
        assert_eq!(a, b);

        b.set_annotation("key", "value");
        assert_ne!(a, b);
    }

    #[test]
    fn test_descriptor_match_predicates() {
        let mut desc = descriptor(b"artifact");
        desc.artifact_type = Some("application/vnd.example".into());
        desc.set_annotation("color", "blue");
        desc.platform = Some("linux/amd64".parse().unwrap());

        let mut opt = MatchOpt {
            artifact_type: Some("application/vnd.example".into()),
            ..Default::default()
        };
        assert!(desc.matches(&opt));

        opt.annotations = Some(BTreeMap::from([("color".to_string(), "blue".to_string())]));
        assert!(desc.matches(&opt));

        // Empty annotation value matches any value for the key
        opt.annotations = Some(BTreeMap::from([("color".to_string(), String::new())]));
        assert!(desc.matches(&opt));

        opt.annotations = Some(BTreeMap::from([("color".to_string(), "red".to_string())]));
        assert!(!desc.matches(&opt));

        opt.annotations = None;
        opt.platform = Some("linux/arm64".parse().unwrap());
        assert!(!desc.matches(&opt));

        opt.platform = None;
        opt.artifact_type = Some("application/vnd.other".into());
        assert!(!desc.matches(&opt));
    }

    #[test]
    fn test_descriptor_sort_by_annotation_and_tie_break() {
        let mut a = descriptor(b"a");
        a.set_annotation("created", "2024-01-02T00:00:00Z");
        let mut b = descriptor(b"b");
        b.set_annotation("created", "2024-01-01T00:00:00Z");
        let c = descriptor(b"c");
        let d = descriptor(b"d");

        let list = vec![a.clone(), b.clone(), c.clone(), d.clone()];
        let opt = MatchOpt {
            sort_annotation: Some("created".into()),
            ..Default::default()
        };
        let sorted = match_descriptors(&list, &opt);
        // Annotated entries first in date order, then the rest by descending
        // original position.
        assert_eq!(sorted, vec![b.clone(), a.clone(), d.clone(), c.clone()]);

        let opt_desc = MatchOpt {
            sort_annotation: Some("created".into()),
            sort_desc: true,
            ..Default::default()
        };
        let sorted = match_descriptors(&list, &opt_desc);
        assert_eq!(sorted[0], a);
        assert_eq!(sorted[1], b);
    }

    #[test]
    fn test_descriptor_sort_without_annotation_is_descending_order() {
        let list = vec![descriptor(b"one"), descriptor(b"two"), descriptor(b"three")];
        let sorted = match_descriptors(&list, &MatchOpt::default());
        assert_eq!(sorted[0], list[2]);
        assert_eq!(sorted[2], list[0]);
    }
}
