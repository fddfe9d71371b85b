//! Storage backends. A scheme is any backend implementing the full operation
//! set over manifests, blobs, tags, and referrers; the client dispatches on
//! the reference's scheme and treats both backends identically.

use async_trait::async_trait;

use crate::{
    manifest::{IndexBody, ManifestBody},
    mediatype::MEDIA_TYPE_OCI_INDEX,
    BlobReader, BlobSource, Descriptor, Manifest, OciregResult, OpCtx, Reference, TagList,
};

pub mod ocidir;
pub mod reg;

pub use ocidir::OciDirScheme;
pub use reg::RegScheme;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The outcome of a manifest put.
#[derive(Debug, Clone)]
pub struct ManifestPutResult {
    /// Descriptor of the stored manifest.
    pub descriptor: Descriptor,

    /// True when the backend recorded the manifest's `subject` relation
    /// itself (native referrers support). False means the caller must
    /// maintain the fallback tag index.
    pub subject_handled: bool,
}

/// Where a referrer listing came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferrerSource {
    /// The native referrers API.
    Api,

    /// The fallback tag scheme; carries the tag consulted.
    FallbackTag(String),
}

/// The raw result of a referrer listing: the OCI index enumerating referrers
/// (synthesized empty when none exist) and its provenance.
pub struct ReferrerResponse {
    /// The referrer index.
    pub manifest: Manifest,

    /// Where the index came from.
    pub source: ReferrerSource,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// An empty OCI index, the shape of "no referrers".
pub(crate) fn empty_referrer_index() -> OciregResult<Manifest> {
    Manifest::new(
        MEDIA_TYPE_OCI_INDEX,
        ManifestBody::Index(IndexBody {
            schema_version: 2,
            media_type: None,
            artifact_type: None,
            manifests: Vec::new(),
            subject: None,
            annotations: None,
        }),
    )
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The operation set every storage backend implements.
#[async_trait]
pub trait SchemeApi: Send + Sync {
    /// Fetches a manifest by digest when the reference has one, else by tag.
    async fn manifest_get(&self, ctx: &OpCtx, r: &Reference) -> OciregResult<Manifest>;

    /// Fetches manifest metadata without the body. The descriptor's digest
    /// comes from the backend when it provides one.
    async fn manifest_head(&self, ctx: &OpCtx, r: &Reference) -> OciregResult<Descriptor>;

    /// Stores a manifest under the reference's tag, or by digest when the
    /// reference has no tag.
    async fn manifest_put(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        manifest: &Manifest,
    ) -> OciregResult<ManifestPutResult>;

    /// Deletes a manifest. The reference must carry or resolve to a digest.
    async fn manifest_delete(&self, ctx: &OpCtx, r: &Reference) -> OciregResult<()>;

    /// Opens a blob for reading.
    async fn blob_get(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        desc: &Descriptor,
    ) -> OciregResult<BlobReader>;

    /// Checks for a blob and returns its metadata.
    async fn blob_head(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        desc: &Descriptor,
    ) -> OciregResult<Descriptor>;

    /// Associates an existing blob in `src`'s repository with `tgt`'s without
    /// re-uploading. Errors when the backend cannot complete the mount; the
    /// caller falls back to a streamed copy.
    async fn blob_mount(
        &self,
        ctx: &OpCtx,
        src: &Reference,
        tgt: &Reference,
        desc: &Descriptor,
    ) -> OciregResult<()>;

    /// Uploads a blob. The descriptor hint supplies digest and size when
    /// known; content with an unknown digest is spooled first.
    async fn blob_put(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        hint: Option<&Descriptor>,
        source: BlobSource,
    ) -> OciregResult<Descriptor>;

    /// Deletes a blob. Not all backends implement this.
    async fn blob_delete(&self, ctx: &OpCtx, r: &Reference, desc: &Descriptor) -> OciregResult<()>;

    /// Lists tags, with optional pagination.
    async fn tag_list(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        limit: Option<u32>,
        last: Option<&str>,
    ) -> OciregResult<TagList>;

    /// Lists referrers of the subject digest carried by `subject`. The
    /// `artifact_type` filter is a server-side hint only; callers re-filter.
    async fn referrer_list(
        &self,
        ctx: &OpCtx,
        subject: &Reference,
        artifact_type: Option<&str>,
    ) -> OciregResult<ReferrerResponse>;

    /// Verifies the backend is reachable and speaks the expected API.
    async fn ping(&self, ctx: &OpCtx, r: &Reference) -> OciregResult<()>;
}
