//! Typed manifest values over the digest-addressed descriptor graph.
//!
//! A [`Manifest`] always remembers the exact bytes it was parsed from so its
//! digest is stable; mutating the parsed structure drops the cached bytes and
//! the next serialization re-emits canonical JSON.

use bytes::Bytes;
use getset::Getters;

use crate::{
    mediatype::{self, *},
    Descriptor, Digest, DigestAlgorithm, MatchOpt, OciregError, OciregResult, Platform, RateLimit,
    Reference,
};

mod types;

pub use types::{ImageBody, IndexBody, Schema1Body, Schema1FsLayer};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Response metadata captured when a manifest is fetched.
#[derive(Debug, Clone, Default)]
pub struct ManifestHead {
    /// The `Docker-Content-Digest` header, when the registry sent one.
    pub digest: Option<Digest>,

    /// Rate limit headers captured at fetch time.
    pub rate_limit: RateLimit,
}

/// The parsed side of a manifest.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestBody {
    /// Single-platform image manifest (OCI v1 or Docker schema2).
    Image(ImageBody),

    /// Multi-platform index (OCI index or Docker manifest list).
    Index(IndexBody),

    /// Legacy Docker schema1, byte-preserving and read-only.
    Schema1(Schema1Body),
}

/// A manifest bound to its raw bytes, media type, and fetch metadata.
#[derive(Debug, Clone, Getters)]
pub struct Manifest {
    /// The reference the manifest was fetched from, when known.
    #[getset(get = "pub with_prefix")]
    reference: Option<Reference>,

    /// The manifest media type.
    #[getset(get = "pub with_prefix")]
    media_type: String,

    /// Response metadata captured at fetch time.
    #[getset(get = "pub with_prefix")]
    head: ManifestHead,

    /// Raw bytes as fetched. `None` after a mutation until re-serialized.
    raw: Option<Bytes>,

    /// The parsed structure.
    body: ManifestBody,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Manifest {
    /// Builds a manifest from a constructed body. The body's `mediaType`
    /// field is set to match and there are no cached raw bytes yet.
    pub fn new(media_type: impl Into<String>, body: ManifestBody) -> OciregResult<Self> {
        let media_type = media_type.into();
        let mut body = body;
        match &mut body {
            ManifestBody::Image(image) => {
                if mediatype::is_list_type(&media_type) || mediatype::is_legacy_type(&media_type) {
                    return Err(OciregError::UnsupportedMediaType(media_type));
                }
                image.media_type = Some(media_type.clone());
            }
            ManifestBody::Index(index) => {
                if !mediatype::is_list_type(&media_type) {
                    return Err(OciregError::UnsupportedMediaType(media_type));
                }
                index.media_type = Some(media_type.clone());
            }
            ManifestBody::Schema1(_) => {
                return Err(OciregError::UnsupportedMediaType(
                    "legacy manifests cannot be constructed".into(),
                ));
            }
        }
        Ok(Self {
            reference: None,
            media_type,
            head: ManifestHead::default(),
            raw: None,
            body,
        })
    }

    /// Parses raw manifest bytes. The media type is taken from
    /// `declared_media_type` (typically the response `Content-Type`) when
    /// present, else recovered from the body.
    pub fn parse(raw: impl Into<Bytes>, declared_media_type: Option<&str>) -> OciregResult<Self> {
        let raw: Bytes = raw.into();
        let value: serde_json::Value = serde_json::from_slice(&raw)?;

        let body_media_type = value.get("mediaType").and_then(|v| v.as_str());
        let media_type = match declared_media_type.filter(|m| !m.is_empty()) {
            Some(declared) => {
                if let Some(body_mt) = body_media_type {
                    if body_mt != declared {
                        return Err(OciregError::UnsupportedMediaType(format!(
                            "body mediaType {} does not match declared {}",
                            body_mt, declared
                        )));
                    }
                }
                declared.to_string()
            }
            None => match body_media_type {
                Some(mt) => mt.to_string(),
                None => sniff_media_type(&value)?,
            },
        };

        let body = if mediatype::is_legacy_type(&media_type) {
            ManifestBody::Schema1(serde_json::from_value(value)?)
        } else if mediatype::is_list_type(&media_type) {
            ManifestBody::Index(serde_json::from_value(value)?)
        } else if mediatype::is_manifest_type(&media_type) {
            ManifestBody::Image(serde_json::from_value(value)?)
        } else {
            return Err(OciregError::UnsupportedMediaType(media_type));
        };

        Ok(Self {
            reference: None,
            media_type,
            head: ManifestHead::default(),
            raw: Some(raw),
            body,
        })
    }

    /// Attaches the reference the manifest was fetched from.
    pub fn with_reference(mut self, reference: Reference) -> Self {
        self.reference = Some(reference);
        self
    }

    /// Attaches fetch metadata.
    pub fn with_head(mut self, head: ManifestHead) -> Self {
        self.head = head;
        self
    }

    /// The serialized bytes the digest covers. Returns the fetched bytes when
    /// they are still valid, else re-serializes canonically.
    pub fn bytes(&self) -> OciregResult<Bytes> {
        if let Some(raw) = &self.raw {
            return Ok(raw.clone());
        }
        match &self.body {
            ManifestBody::Image(image) => Ok(Bytes::from(serde_json::to_vec(image)?)),
            ManifestBody::Index(index) => Ok(Bytes::from(serde_json::to_vec(index)?)),
            ManifestBody::Schema1(_) => Err(OciregError::UnsupportedMediaType(
                "legacy manifests cannot be re-serialized".into(),
            )),
        }
    }

    /// The manifest digest, covering [`Manifest::bytes`].
    pub fn digest(&self) -> OciregResult<Digest> {
        let algorithm = self
            .head
            .digest
            .as_ref()
            .map(|d| d.algorithm())
            .or_else(|| {
                self.reference
                    .as_ref()
                    .and_then(|r| r.get_digest().as_ref().map(|d| d.algorithm()))
            })
            .unwrap_or(DigestAlgorithm::Sha256);
        Ok(Digest::from_bytes(algorithm, &self.bytes()?))
    }

    /// A descriptor for this manifest: media type, digest, and size.
    pub fn get_descriptor(&self) -> OciregResult<Descriptor> {
        let bytes = self.bytes()?;
        let mut desc = Descriptor::new(self.media_type.clone(), self.digest()?, bytes.len() as u64);
        desc.artifact_type = self.artifact_type().map(str::to_string);
        Ok(desc)
    }

    /// True for index / manifest-list variants.
    pub fn is_list(&self) -> bool {
        matches!(self.body, ManifestBody::Index(_))
    }

    /// The parsed body.
    pub fn body(&self) -> &ManifestBody {
        &self.body
    }

    /// Child manifest descriptors of an index.
    pub fn children(&self) -> OciregResult<Vec<Descriptor>> {
        match &self.body {
            ManifestBody::Index(index) => Ok(index.manifests.clone()),
            _ => Err(OciregError::UnsupportedMediaType(format!(
                "{} has no child manifests",
                self.media_type
            ))),
        }
    }

    /// The config descriptor of an image manifest.
    pub fn config(&self) -> OciregResult<Descriptor> {
        match &self.body {
            ManifestBody::Image(image) => Ok(image.config.clone()),
            _ => Err(OciregError::UnsupportedMediaType(format!(
                "{} has no config descriptor",
                self.media_type
            ))),
        }
    }

    /// The ordered layer descriptors of an image manifest. Legacy schema1
    /// layers surface with their blob digests and unknown sizes.
    pub fn layers(&self) -> OciregResult<Vec<Descriptor>> {
        match &self.body {
            ManifestBody::Image(image) => Ok(image.layers.clone()),
            ManifestBody::Schema1(schema1) => Ok(schema1
                .fs_layers
                .iter()
                .map(|l| Descriptor::new(MEDIA_TYPE_DOCKER2_LAYER_GZIP, l.blob_sum.clone(), 0))
                .collect()),
            ManifestBody::Index(_) => Err(OciregError::UnsupportedMediaType(format!(
                "{} has no layers",
                self.media_type
            ))),
        }
    }

    /// The subject descriptor, set on referrer manifests.
    pub fn subject(&self) -> Option<&Descriptor> {
        match &self.body {
            ManifestBody::Image(image) => image.subject.as_ref(),
            ManifestBody::Index(index) => index.subject.as_ref(),
            ManifestBody::Schema1(_) => None,
        }
    }

    /// The artifact type: the explicit `artifactType` field, falling back to
    /// the config media type for OCI artifact manifests.
    pub fn artifact_type(&self) -> Option<&str> {
        match &self.body {
            ManifestBody::Image(image) => image.artifact_type.as_deref().or_else(|| {
                // OCI artifact convention: a non-standard config media type
                // stands in for the artifact type.
                (self.media_type == MEDIA_TYPE_OCI_MANIFEST
                    && image.config.media_type != MEDIA_TYPE_OCI_CONFIG)
                    .then_some(image.config.media_type.as_str())
            }),
            ManifestBody::Index(index) => index.artifact_type.as_deref(),
            ManifestBody::Schema1(_) => None,
        }
    }

    /// The manifest annotations, when the variant carries any.
    pub fn annotations(&self) -> Option<&std::collections::BTreeMap<String, String>> {
        match &self.body {
            ManifestBody::Image(image) => image.annotations.as_ref(),
            ManifestBody::Index(index) => index.annotations.as_ref(),
            ManifestBody::Schema1(_) => None,
        }
    }

    /// Selects the child of an index matching `platform`, falling back to the
    /// host platform when none is given. [`OciregError::NotFound`] when no
    /// child matches.
    pub fn get_platform_descriptor(&self, platform: Option<&Platform>) -> OciregResult<Descriptor> {
        let ManifestBody::Index(index) = &self.body else {
            return Err(OciregError::UnsupportedMediaType(format!(
                "{} is not an index",
                self.media_type
            )));
        };
        let filter = platform.cloned().unwrap_or_else(Platform::local);
        let opt = MatchOpt {
            platform: Some(filter.clone()),
            ..Default::default()
        };
        crate::descriptor::match_descriptors(&index.manifests, &opt)
            .into_iter()
            .next()
            .ok_or_else(|| OciregError::NotFound(format!("no manifest for platform {}", filter)))
    }

    /// Replaces the children of an index, invalidating cached raw bytes.
    pub fn set_manifest_list(&mut self, manifests: Vec<Descriptor>) -> OciregResult<()> {
        match &mut self.body {
            ManifestBody::Index(index) => {
                index.manifests = manifests;
                self.raw = None;
                Ok(())
            }
            _ => Err(OciregError::UnsupportedMediaType(format!(
                "{} is not an index",
                self.media_type
            ))),
        }
    }

    /// Sets or clears the subject descriptor (OCI variants only),
    /// invalidating cached raw bytes.
    pub fn set_subject(&mut self, subject: Option<Descriptor>) -> OciregResult<()> {
        match (&mut self.body, self.media_type.as_str()) {
            (ManifestBody::Image(image), MEDIA_TYPE_OCI_MANIFEST) => {
                image.subject = subject;
            }
            (ManifestBody::Index(index), MEDIA_TYPE_OCI_INDEX) => {
                index.subject = subject;
            }
            _ => {
                return Err(OciregError::UnsupportedMediaType(format!(
                    "{} does not support a subject",
                    self.media_type
                )))
            }
        }
        self.raw = None;
        Ok(())
    }

    /// Adds or replaces an annotation, invalidating cached raw bytes.
    pub fn set_annotation(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> OciregResult<()> {
        let annotations = match &mut self.body {
            ManifestBody::Image(image) => &mut image.annotations,
            ManifestBody::Index(index) => &mut index.annotations,
            ManifestBody::Schema1(_) => {
                return Err(OciregError::UnsupportedMediaType(
                    "legacy manifests are read-only".into(),
                ))
            }
        };
        annotations
            .get_or_insert_with(Default::default)
            .insert(key.into(), value.into());
        self.raw = None;
        Ok(())
    }

    /// Rate limit headers captured when the manifest was fetched.
    pub fn get_rate_limit(&self) -> &RateLimit {
        &self.head.rate_limit
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Guesses the media type of a manifest body that does not declare one.
fn sniff_media_type(value: &serde_json::Value) -> OciregResult<String> {
    let schema_version = value.get("schemaVersion").and_then(|v| v.as_u64());
    if schema_version == Some(1) {
        return Ok(if value.get("signatures").is_some() {
            MEDIA_TYPE_DOCKER1_SIGNED.to_string()
        } else {
            MEDIA_TYPE_DOCKER1_MANIFEST.to_string()
        });
    }
    if value.get("manifests").is_some() {
        return Ok(MEDIA_TYPE_OCI_INDEX.to_string());
    }
    if value.get("config").is_some() {
        return Ok(MEDIA_TYPE_OCI_MANIFEST.to_string());
    }
    Err(OciregError::UnsupportedMediaType(
        "manifest body declares no recognizable media type".into(),
    ))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
