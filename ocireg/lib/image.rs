//! Recursive image copy: the manifest closure (index children, config,
//! layers), and optionally referrers and digest-style tags, moved between
//! references with mount-or-stream decisioning per blob.

use std::collections::HashSet;

use async_recursion::async_recursion;
use futures::{StreamExt, TryStreamExt};

use crate::{
    client::{BlobCopyOpts, Client},
    config::DEFAULT_BLOB_CONCURRENCY,
    referrer::ReferrerOpts,
    scheme::SchemeApi,
    Digest, OciregError, OciregResult, OpCtx, Platform, ProgressFn, Reference,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Options for [`Client::image_copy`].
#[derive(Clone, Default)]
pub struct ImageCopyOpts {
    /// Descend into children even when the target already has the manifest.
    /// Without this, a target HEAD hit short-circuits the subtree.
    pub recursive: bool,

    /// Copy source tags that look like digest tags (`algo-hex` and
    /// `algo-hex.*`) of any manifest visited by the copy.
    pub digest_tags: bool,

    /// Copy referrers of every visited manifest.
    pub referrers: bool,

    /// For index manifests, keep only children matching one of these
    /// platforms; the reduced index gets a new digest.
    pub platforms: Vec<Platform>,

    /// Copy layers that carry external URLs. Skipped by default.
    pub include_external: bool,

    /// Concurrent blob copies within one manifest. 0 means the default.
    pub concurrency: usize,

    /// Progress callback for streamed blobs.
    pub progress: Option<ProgressFn>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Client {
    /// Copies the manifest closure of `src` to `tgt`.
    ///
    /// Every step checks the target first, so re-running a copy uploads
    /// nothing. Blob copies within one manifest run concurrently up to the
    /// configured fan-out; a manifest is only put after all blobs it
    /// references are present.
    pub async fn image_copy(
        &self,
        ctx: &OpCtx,
        src: &Reference,
        tgt: &Reference,
        opts: ImageCopyOpts,
    ) -> OciregResult<()> {
        let mut seen = HashSet::new();
        self.image_copy_inner(ctx, src, tgt, &opts, &mut seen).await?;

        if opts.digest_tags {
            self.copy_digest_tags(ctx, src, tgt, &opts, &seen).await?;
        }
        Ok(())
    }

    #[async_recursion]
    async fn image_copy_inner(
        &self,
        ctx: &OpCtx,
        src: &Reference,
        tgt: &Reference,
        opts: &ImageCopyOpts,
        seen: &mut HashSet<Digest>,
    ) -> OciregResult<()> {
        if ctx.is_canceled() {
            return Err(OciregError::Canceled);
        }

        // Full structure by default: no platform resolution on the source get.
        let mut manifest = self.scheme_for(src).manifest_get(ctx, src).await?;
        let digest = manifest.digest()?;

        // A digest handled once per operation terminates cycles and repeat
        // references.
        if !seen.insert(digest.clone()) {
            return Ok(());
        }

        let tgt_by_digest = tgt.set_digest(digest.clone());
        let present = self
            .scheme_for(tgt)
            .manifest_head(ctx, &tgt_by_digest)
            .await
            .is_ok();
        if present && !opts.recursive {
            // Blobs are already there; at most the tag needs to move.
            if tgt.get_tag().is_some() {
                self.manifest_put(ctx, tgt, &manifest).await?;
            }
            if opts.referrers {
                self.copy_referrers(ctx, src, tgt, &digest, opts, seen).await?;
            }
            return Ok(());
        }

        if manifest.is_list() {
            let mut children = manifest.children()?;
            if !opts.platforms.is_empty() {
                children.retain(|child| {
                    child.platform.as_ref().is_some_and(|p| {
                        opts.platforms.iter().any(|filter| p.matches(filter))
                    })
                });
                // The reduced list is a new manifest with a new digest.
                manifest.set_manifest_list(children.clone())?;
            }
            for child in &children {
                let child_src = src.set_digest(child.digest.clone());
                let child_tgt = tgt.set_digest(child.digest.clone());
                self.image_copy_inner(ctx, &child_src, &child_tgt, opts, seen)
                    .await?;
            }
        } else {
            let mut blobs = manifest.layers()?;
            if let Ok(config) = manifest.config() {
                blobs.push(config);
            }
            blobs.retain(|desc| {
                opts.include_external || desc.urls.as_ref().map_or(true, |urls| urls.is_empty())
            });

            let concurrency = if opts.concurrency == 0 {
                DEFAULT_BLOB_CONCURRENCY
            } else {
                opts.concurrency
            };
            futures::stream::iter(blobs.into_iter().map(|desc| {
                let copy_opts = BlobCopyOpts {
                    progress: opts.progress.clone(),
                };
                async move { self.blob_copy(ctx, src, tgt, &desc, copy_opts).await }
            }))
            .buffer_unordered(concurrency)
            .try_collect::<Vec<_>>()
            .await?;
        }

        // All referenced content confirmed present; the manifest goes last.
        self.manifest_put(ctx, tgt, &manifest).await?;

        if opts.referrers {
            self.copy_referrers(ctx, src, tgt, &digest, opts, seen).await?;
        }
        Ok(())
    }

    /// Copies every referrer of `digest` into the target repository. Each
    /// referrer's `subject` relation is re-established by the manifest put.
    async fn copy_referrers(
        &self,
        ctx: &OpCtx,
        src: &Reference,
        tgt: &Reference,
        digest: &Digest,
        opts: &ImageCopyOpts,
        seen: &mut HashSet<Digest>,
    ) -> OciregResult<()> {
        let subject = src.set_digest(digest.clone());
        let referrers = self
            .referrer_list(ctx, &subject, ReferrerOpts::default())
            .await?;
        for desc in &referrers.descriptors {
            let ref_src = src.set_digest(desc.digest.clone());
            let ref_tgt = tgt.set_digest(desc.digest.clone());
            self.image_copy_inner(ctx, &ref_src, &ref_tgt, opts, seen)
                .await?;
        }
        Ok(())
    }

    /// Copies source tags shaped like digest tags of visited manifests
    /// (`algo-hex`, or `algo-hex.suffix` as used by signature tooling).
    async fn copy_digest_tags(
        &self,
        ctx: &OpCtx,
        src: &Reference,
        tgt: &Reference,
        opts: &ImageCopyOpts,
        seen: &HashSet<Digest>,
    ) -> OciregResult<()> {
        let prefixes: Vec<String> = seen.iter().map(|d| d.fallback_tag()).collect();
        let tags = self.tag_list(ctx, src).await?;
        for tag in &tags.tags {
            let matched = prefixes
                .iter()
                .any(|p| tag == p || tag.starts_with(&format!("{}.", p)));
            if !matched {
                continue;
            }
            let tag_src = src.set_tag(tag.clone())?;
            let tag_tgt = tgt.set_tag(tag.clone())?;
            let mut tag_seen = HashSet::new();
            self.image_copy_inner(ctx, &tag_src, &tag_tgt, opts, &mut tag_seen)
                .await?;
        }
        Ok(())
    }
}
