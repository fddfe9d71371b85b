//! The local OCI image layout backend: `oci-layout` + `index.json` +
//! `blobs/<algo>/<hex>`, with the same operation set as the registry scheme.
//!
//! `index.json` rewrites are serialized by a process-local lock per layout
//! path plus a file lock, so concurrent processes interleave safely; the
//! rewrite itself is write-to-temp + atomic rename.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use file_lock::{FileLock, FileOptions};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;

use crate::{
    manifest::IndexBody,
    scheme::{empty_referrer_index, ManifestPutResult, ReferrerResponse, ReferrerSource, SchemeApi},
    BlobReader, BlobSource, Descriptor, Digest, DigestAlgorithm, Manifest, OciregError,
    OciregResult, OpCtx, Reference, TagList,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The layout marker file.
const OCI_LAYOUT_FILENAME: &str = "oci-layout";

/// The layout version this implementation writes and accepts.
const OCI_LAYOUT_VERSION: &str = "1.0.0";

/// The root index document.
const INDEX_FILENAME: &str = "index.json";

/// Content-addressed blob directory.
const BLOBS_DIR: &str = "blobs";

/// Annotation carrying the tag of an index entry.
const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Contents of the `oci-layout` marker file.
#[derive(Debug, Serialize, Deserialize)]
struct OciLayout {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

/// The local OCI image layout backend.
pub struct OciDirScheme {
    /// Process-local write locks, one per canonicalized layout path.
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OciDirScheme {
    /// Creates the layout backend.
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn root(r: &Reference) -> PathBuf {
        PathBuf::from(r.get_path())
    }

    fn blob_path(root: &Path, digest: &Digest) -> PathBuf {
        root.join(BLOBS_DIR)
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    /// Reads `index.json`, yielding an empty index for a fresh layout.
    async fn read_index(root: &Path) -> OciregResult<IndexBody> {
        match tokio::fs::read(root.join(INDEX_FILENAME)).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(IndexBody {
                schema_version: 2,
                media_type: None,
                artifact_type: None,
                manifests: Vec::new(),
                subject: None,
                annotations: None,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Runs a read-modify-write of `index.json` under the process-local and
    /// file locks, writing the result via temp file + rename.
    async fn update_index<F>(&self, root: &Path, mutate: F) -> OciregResult<()>
    where
        F: FnOnce(&mut IndexBody) -> OciregResult<()> + Send + 'static,
    {
        let local = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(root.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = local.lock().await;

        Self::ensure_layout(root).await?;
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || -> OciregResult<()> {
            let lock_path = root.join(format!("{}.lock", INDEX_FILENAME));
            let options = FileOptions::new().write(true).create(true);
            let lock = FileLock::lock(&lock_path, true, options)?;

            let index_path = root.join(INDEX_FILENAME);
            let mut index = match std::fs::read(&index_path) {
                Ok(raw) => serde_json::from_slice(&raw)?,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => IndexBody {
                    schema_version: 2,
                    media_type: None,
                    artifact_type: None,
                    manifests: Vec::new(),
                    subject: None,
                    annotations: None,
                },
                Err(err) => return Err(err.into()),
            };

            mutate(&mut index)?;

            let mut tmp = tempfile::NamedTempFile::new_in(&root)?;
            serde_json::to_writer(&mut tmp, &index)?;
            tmp.persist(&index_path).map_err(|e| e.error)?;

            lock.unlock()?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    /// Creates the layout skeleton when missing.
    async fn ensure_layout(root: &Path) -> OciregResult<()> {
        tokio::fs::create_dir_all(root.join(BLOBS_DIR)).await?;
        let layout_path = root.join(OCI_LAYOUT_FILENAME);
        if tokio::fs::try_exists(&layout_path).await? {
            return Ok(());
        }
        let layout = OciLayout {
            image_layout_version: OCI_LAYOUT_VERSION.to_string(),
        };
        tokio::fs::write(&layout_path, serde_json::to_vec(&layout)?).await?;
        Ok(())
    }

    /// Resolves a reference to the descriptor of its manifest.
    async fn resolve(&self, r: &Reference) -> OciregResult<Descriptor> {
        let root = Self::root(r);
        let index = Self::read_index(&root).await?;

        if let Some(digest) = r.get_digest() {
            if let Some(entry) = index.manifests.iter().find(|d| d.digest == *digest) {
                return Ok(entry.clone());
            }
            // Digest-addressed content need not be in the index
            let path = Self::blob_path(&root, digest);
            let meta = tokio::fs::metadata(&path)
                .await
                .map_err(|_| OciregError::NotFound(r.common_name()))?;
            return Ok(Descriptor::new(String::new(), digest.clone(), meta.len()));
        }

        let tag = r
            .get_tag()
            .as_ref()
            .ok_or_else(|| OciregError::MissingTag(r.common_name()))?
            .clone();
        index
            .manifests
            .iter()
            .find(|d| d.annotation(ANNOTATION_REF_NAME) == Some(tag.as_str()))
            .cloned()
            .ok_or_else(|| OciregError::NotFound(r.common_name()))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for OciDirScheme {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchemeApi for OciDirScheme {
    async fn manifest_get(&self, _ctx: &OpCtx, r: &Reference) -> OciregResult<Manifest> {
        let root = Self::root(r);
        let desc = self.resolve(r).await?;
        let raw = tokio::fs::read(Self::blob_path(&root, &desc.digest))
            .await
            .map_err(|_| OciregError::NotFound(r.common_name()))?;

        let computed = Digest::from_bytes(desc.digest.algorithm(), &raw);
        if computed != desc.digest {
            return Err(OciregError::DigestMismatch {
                expected: desc.digest.to_string(),
                computed: computed.to_string(),
            });
        }

        let declared = Some(desc.media_type.as_str()).filter(|m| !m.is_empty());
        Ok(Manifest::parse(raw, declared)?.with_reference(r.clone()))
    }

    async fn manifest_head(&self, _ctx: &OpCtx, r: &Reference) -> OciregResult<Descriptor> {
        self.resolve(r).await
    }

    async fn manifest_put(
        &self,
        _ctx: &OpCtx,
        r: &Reference,
        manifest: &Manifest,
    ) -> OciregResult<ManifestPutResult> {
        let root = Self::root(r);
        Self::ensure_layout(&root).await?;

        let bytes = manifest.bytes()?;
        let digest = manifest.digest()?;
        let blob_path = Self::blob_path(&root, &digest);
        tokio::fs::create_dir_all(blob_path.parent().expect("blob path has a parent")).await?;
        let spooled = BlobSource::Bytes(bytes.clone())
            .spool(digest.algorithm(), &root)
            .await?;
        spooled.path.persist(&blob_path).map_err(|e| e.error)?;

        let mut entry = Descriptor::new(manifest.get_media_type().clone(), digest, bytes.len() as u64);
        entry.artifact_type = manifest.artifact_type().map(str::to_string);
        let tag = r.get_tag().clone();
        if let Some(tag) = &tag {
            entry.set_annotation(ANNOTATION_REF_NAME, tag.clone());
        }

        self.update_index(&root, move |index| {
            // One descriptor per tag: drop entries this put replaces. Several
            // tags may keep pointing at the same digest via separate entries.
            index.manifests.retain(|d| match &tag {
                Some(tag) => d.annotation(ANNOTATION_REF_NAME) != Some(tag.as_str()),
                None => !(d.digest == entry.digest && d.annotation(ANNOTATION_REF_NAME).is_none()),
            });
            index.manifests.push(entry);
            Ok(())
        })
        .await?;

        Ok(ManifestPutResult {
            descriptor: manifest.get_descriptor()?,
            subject_handled: false,
        })
    }

    async fn manifest_delete(&self, ctx: &OpCtx, r: &Reference) -> OciregResult<()> {
        let root = Self::root(r);
        let desc = self.manifest_head(ctx, r).await?;
        let tag = r.get_tag().clone();
        let digest = desc.digest.clone();
        self.update_index(&root, move |index| {
            let before = index.manifests.len();
            index.manifests.retain(|d| match &tag {
                Some(tag) => {
                    !(d.digest == digest && d.annotation(ANNOTATION_REF_NAME) == Some(tag.as_str()))
                }
                None => d.digest != digest,
            });
            if index.manifests.len() == before {
                return Err(OciregError::NotFound(digest.to_string()));
            }
            Ok(())
        })
        .await
    }

    async fn blob_get(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        desc: &Descriptor,
    ) -> OciregResult<BlobReader> {
        let path = Self::blob_path(&Self::root(r), &desc.digest);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|_| OciregError::NotFound(format!("{}@{}", r.common_name(), desc.digest)))?;
        let mut descriptor = desc.clone();
        if descriptor.size == 0 {
            descriptor.size = file.metadata().await?.len();
        }
        let stream = ReaderStream::new(file)
            .map(|item| item.map_err(OciregError::from))
            .boxed();
        Ok(BlobReader::from_stream(descriptor, stream).with_cancel(ctx.cancel_token().clone()))
    }

    async fn blob_head(
        &self,
        _ctx: &OpCtx,
        r: &Reference,
        desc: &Descriptor,
    ) -> OciregResult<Descriptor> {
        let path = Self::blob_path(&Self::root(r), &desc.digest);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| OciregError::NotFound(format!("{}@{}", r.common_name(), desc.digest)))?;
        let mut descriptor = desc.clone();
        if descriptor.size == 0 {
            descriptor.size = meta.len();
        }
        Ok(descriptor)
    }

    async fn blob_mount(
        &self,
        _ctx: &OpCtx,
        _src: &Reference,
        _tgt: &Reference,
        _desc: &Descriptor,
    ) -> OciregResult<()> {
        // Layouts share one blob store per path; there is nothing to mount.
        Err(OciregError::NotImplemented("blob mount on ocidir".into()))
    }

    async fn blob_put(
        &self,
        _ctx: &OpCtx,
        r: &Reference,
        hint: Option<&Descriptor>,
        source: BlobSource,
    ) -> OciregResult<Descriptor> {
        let root = Self::root(r);
        Self::ensure_layout(&root).await?;

        let algorithm = hint
            .map(|h| h.digest.algorithm())
            .unwrap_or(DigestAlgorithm::Sha256);
        let spooled = source.spool(algorithm, &root).await?;
        if let Some(expected) = hint.map(|h| &h.digest) {
            if *expected != spooled.digest {
                return Err(OciregError::DigestMismatch {
                    expected: expected.to_string(),
                    computed: spooled.digest.to_string(),
                });
            }
        }

        let blob_path = Self::blob_path(&root, &spooled.digest);
        tokio::fs::create_dir_all(blob_path.parent().expect("blob path has a parent")).await?;
        spooled.path.persist(&blob_path).map_err(|e| e.error)?;

        let media_type = hint
            .map(|h| h.media_type.clone())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        Ok(Descriptor::new(media_type, spooled.digest, spooled.size))
    }

    async fn blob_delete(&self, _ctx: &OpCtx, r: &Reference, desc: &Descriptor) -> OciregResult<()> {
        let path = Self::blob_path(&Self::root(r), &desc.digest);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|_| OciregError::NotFound(format!("{}@{}", r.common_name(), desc.digest)))
    }

    async fn tag_list(
        &self,
        _ctx: &OpCtx,
        r: &Reference,
        limit: Option<u32>,
        last: Option<&str>,
    ) -> OciregResult<TagList> {
        let index = Self::read_index(&Self::root(r)).await?;
        let mut tags: Vec<String> = index
            .manifests
            .iter()
            .filter_map(|d| d.annotation(ANNOTATION_REF_NAME))
            .map(str::to_string)
            .collect();
        tags.sort();
        tags.dedup();
        if let Some(last) = last {
            tags.retain(|t| t.as_str() > last);
        }
        if let Some(limit) = limit {
            tags.truncate(limit as usize);
        }
        Ok(TagList {
            name: r.get_path().clone(),
            tags,
        })
    }

    async fn referrer_list(
        &self,
        ctx: &OpCtx,
        subject: &Reference,
        _artifact_type: Option<&str>,
    ) -> OciregResult<ReferrerResponse> {
        let digest = subject
            .get_digest()
            .as_ref()
            .ok_or_else(|| OciregError::MissingDigest(subject.common_name()))?
            .clone();
        let tag = digest.fallback_tag();
        let tag_ref = subject.set_tag(tag.clone())?;
        let manifest = match self.manifest_get(ctx, &tag_ref).await {
            Ok(manifest) if manifest.is_list() => manifest,
            Ok(_) | Err(OciregError::NotFound(_)) => empty_referrer_index()?,
            Err(err) => return Err(err),
        };
        Ok(ReferrerResponse {
            manifest,
            source: ReferrerSource::FallbackTag(tag),
        })
    }

    async fn ping(&self, _ctx: &OpCtx, r: &Reference) -> OciregResult<()> {
        let root = Self::root(r);
        let raw = tokio::fs::read(root.join(OCI_LAYOUT_FILENAME))
            .await
            .map_err(|_| OciregError::NotFound(r.common_name()))?;
        let layout: OciLayout = serde_json::from_slice(&raw)?;
        if layout.image_layout_version != OCI_LAYOUT_VERSION {
            return Err(OciregError::UnsupportedConfigVersion(format!(
                "image layout version {}",
                layout.image_layout_version
            )));
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ImageBody, ManifestBody};
    use crate::mediatype::{MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_LAYER_GZIP, MEDIA_TYPE_OCI_MANIFEST};
    use bytes::Bytes;

    fn layout_ref(dir: &Path, suffix: &str) -> Reference {
        Reference::parse(&format!("ocidir://{}{}", dir.display(), suffix)).unwrap()
    }

    async fn put_image(
        scheme: &OciDirScheme,
        ctx: &OpCtx,
        r: &Reference,
        layer_content: &[u8],
    ) -> Manifest {
        let config = scheme
            .blob_put(
                ctx,
                r,
                Some(&Descriptor::new(
                    MEDIA_TYPE_OCI_CONFIG,
                    Digest::sha256(b"{}"),
                    2,
                )),
                BlobSource::Bytes(Bytes::from_static(b"{}")),
            )
            .await
            .unwrap();
        let layer = scheme
            .blob_put(
                ctx,
                r,
                Some(&Descriptor::new(
                    MEDIA_TYPE_OCI_LAYER_GZIP,
                    Digest::sha256(layer_content),
                    layer_content.len() as u64,
                )),
                BlobSource::Bytes(Bytes::copy_from_slice(layer_content)),
            )
            .await
            .unwrap();
        let manifest = Manifest::new(
            MEDIA_TYPE_OCI_MANIFEST,
            ManifestBody::Image(ImageBody {
                schema_version: 2,
                media_type: None,
                artifact_type: None,
                config,
                layers: vec![layer],
                subject: None,
                annotations: None,
            }),
        )
        .unwrap();
        scheme.manifest_put(ctx, r, &manifest).await.unwrap();
        manifest
    }

    #[test_log::test(tokio::test)]
    async fn test_ocidir_manifest_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let scheme = OciDirScheme::new();
        let ctx = OpCtx::new();
        let r = layout_ref(dir.path(), ":v1");

        let manifest = put_image(&scheme, &ctx, &r, b"layer-one").await;

        // Layout skeleton exists
        assert!(dir.path().join(OCI_LAYOUT_FILENAME).exists());
        assert!(dir.path().join(INDEX_FILENAME).exists());
        scheme.ping(&ctx, &r).await.unwrap();

        // Fetch by tag
        let fetched = scheme.manifest_get(&ctx, &r).await.unwrap();
        assert_eq!(fetched.digest().unwrap(), manifest.digest().unwrap());

        // Fetch by digest
        let by_digest = layout_ref(dir.path(), "").add_digest(manifest.digest().unwrap());
        let fetched = scheme.manifest_get(&ctx, &by_digest).await.unwrap();
        assert_eq!(fetched.digest().unwrap(), manifest.digest().unwrap());

        // Blob round trip
        let layer = fetched.layers().unwrap()[0].clone();
        let read = scheme
            .blob_get(&ctx, &r, &layer)
            .await
            .unwrap()
            .read_all()
            .await
            .unwrap();
        assert_eq!(read, Bytes::from_static(b"layer-one"));
    }

    #[test_log::test(tokio::test)]
    async fn test_ocidir_multiple_tags_same_digest() {
        let dir = tempfile::tempdir().unwrap();
        let scheme = OciDirScheme::new();
        let ctx = OpCtx::new();

        let v1 = layout_ref(dir.path(), ":v1");
        let manifest = put_image(&scheme, &ctx, &v1, b"shared").await;
        let latest = layout_ref(dir.path(), ":latest");
        scheme.manifest_put(&ctx, &latest, &manifest).await.unwrap();

        let tags = scheme.tag_list(&ctx, &v1, None, None).await.unwrap();
        assert_eq!(tags.tags, vec!["latest", "v1"]);

        // Both tags resolve to the same digest through separate entries
        let index = OciDirScheme::read_index(dir.path()).await.unwrap();
        assert_eq!(index.manifests.len(), 2);
        assert!(index.manifests.iter().all(|d| d.digest == manifest.digest().unwrap()));

        // Re-putting a tag replaces its entry instead of accumulating
        let manifest2 = put_image(&scheme, &ctx, &v1, b"rev-two").await;
        let index = OciDirScheme::read_index(dir.path()).await.unwrap();
        assert_eq!(index.manifests.len(), 2);
        let v1_entry = index
            .manifests
            .iter()
            .find(|d| d.annotation(ANNOTATION_REF_NAME) == Some("v1"))
            .unwrap();
        assert_eq!(v1_entry.digest, manifest2.digest().unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn test_ocidir_manifest_delete() {
        let dir = tempfile::tempdir().unwrap();
        let scheme = OciDirScheme::new();
        let ctx = OpCtx::new();
        let r = layout_ref(dir.path(), ":doomed");

        put_image(&scheme, &ctx, &r, b"bytes").await;
        scheme.manifest_delete(&ctx, &r).await.unwrap();
        assert!(matches!(
            scheme.manifest_get(&ctx, &r).await,
            Err(OciregError::NotFound(_))
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_ocidir_blob_put_rejects_digest_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let scheme = OciDirScheme::new();
        let ctx = OpCtx::new();
        let r = layout_ref(dir.path(), "");

        let wrong = Descriptor::new(MEDIA_TYPE_OCI_LAYER_GZIP, Digest::sha256(b"other"), 5);
        let err = scheme
            .blob_put(&ctx, &r, Some(&wrong), BlobSource::Bytes(Bytes::from_static(b"bytes")))
            .await
            .unwrap_err();
        assert!(matches!(err, OciregError::DigestMismatch { .. }));
    }

    #[test_log::test(tokio::test)]
    async fn test_ocidir_missing_tag_and_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let scheme = OciDirScheme::new();
        let ctx = OpCtx::new();

        let bare = layout_ref(dir.path(), "");
        assert!(matches!(
            scheme.manifest_get(&ctx, &bare).await,
            Err(OciregError::MissingTag(_))
        ));

        let absent = layout_ref(dir.path(), ":ghost");
        assert!(matches!(
            scheme.manifest_get(&ctx, &absent).await,
            Err(OciregError::NotFound(_))
        ));
    }
}
