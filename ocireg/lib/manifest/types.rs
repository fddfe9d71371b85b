use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Descriptor, Digest};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Body of a single-platform image manifest (OCI v1 or Docker schema2).
///
/// Struct field order is the canonical serialization order for these media
/// types; serializing a constructed body emits fields in exactly this order
/// with minimal whitespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageBody {
    /// Always 2 for the media types this variant covers.
    pub schema_version: u32,

    /// The manifest's own media type, echoed in the body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// Artifact type, set on OCI artifact manifests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    /// The config blob descriptor.
    pub config: Descriptor,

    /// Ordered layer descriptors.
    pub layers: Vec<Descriptor>,

    /// The subject this manifest refers to, set on referrer manifests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,

    /// Optional annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Body of a multi-platform index (OCI index or Docker manifest list).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexBody {
    /// Always 2 for the media types this variant covers.
    pub schema_version: u32,

    /// The manifest's own media type, echoed in the body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// Artifact type, set on artifact indexes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    /// Ordered child manifest descriptors.
    pub manifests: Vec<Descriptor>,

    /// The subject this index refers to, set on referrer indexes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,

    /// Optional annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Parsed header fields of a legacy Docker schema1 manifest. The body is
/// byte-preserving: these structs are never re-serialized.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema1Body {
    /// Always 1.
    pub schema_version: u32,

    /// Repository name recorded in the manifest.
    #[serde(default)]
    pub name: String,

    /// Tag recorded in the manifest.
    #[serde(default)]
    pub tag: String,

    /// Image architecture.
    #[serde(default)]
    pub architecture: String,

    /// Layer references, most recent first.
    #[serde(default)]
    pub fs_layers: Vec<Schema1FsLayer>,
}

/// A schema1 layer reference.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema1FsLayer {
    /// The digest of the compressed layer blob.
    pub blob_sum: Digest,
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediatype::{MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_LAYER_GZIP, MEDIA_TYPE_OCI_MANIFEST};

    #[test]
    fn test_types_image_body_canonical_field_order() {
        let body = ImageBody {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.into()),
            artifact_type: None,
            config: Descriptor::new(MEDIA_TYPE_OCI_CONFIG, Digest::sha256(b"{}"), 2),
            layers: vec![Descriptor::new(
                MEDIA_TYPE_OCI_LAYER_GZIP,
                Digest::sha256(b"layer"),
                5,
            )],
            subject: None,
            annotations: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        let schema_pos = json.find("schemaVersion").unwrap();
        let media_pos = json.find("mediaType").unwrap();
        let config_pos = json.find("config").unwrap();
        let layers_pos = json.find("layers").unwrap();
        assert!(schema_pos < media_pos && media_pos < config_pos && config_pos < layers_pos);
        // Minimal whitespace
        assert!(!json.contains('\n'));
        assert!(!json.contains(": "));
    }

    #[test]
    fn test_types_schema1_parses_fs_layers() {
        let raw = format!(
            r#"{{"schemaVersion":1,"name":"repo","tag":"v1","architecture":"amd64","fsLayers":[{{"blobSum":"{}"}}],"history":[]}}"#,
            Digest::sha256(b"layer")
        );
        let body: Schema1Body = serde_json::from_str(&raw).unwrap();
        assert_eq!(body.schema_version, 1);
        assert_eq!(body.fs_layers.len(), 1);
    }
}
