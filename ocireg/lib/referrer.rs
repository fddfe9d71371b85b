//! Referrer discovery and maintenance: the native API with its fallback-tag
//! scheme, client-side filtering, and the recursive manifest tree walk.

use std::collections::{BTreeMap, HashSet};

use async_recursion::async_recursion;

use crate::{
    client::{Client, ManifestHeadOpts},
    descriptor::match_descriptors,
    scheme::{empty_referrer_index, ReferrerSource, SchemeApi},
    Descriptor, Digest, Manifest, MatchOpt, OciregError, OciregResult, OpCtx, Platform, Reference,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Options for [`Client::referrer_list`].
#[derive(Debug, Clone, Default)]
pub struct ReferrerOpts {
    /// Keep only referrers with this artifact type.
    pub artifact_type: Option<String>,

    /// Keep only referrers carrying this annotation subset. Empty values
    /// match any value for the key.
    pub annotations: Option<BTreeMap<String, String>>,

    /// Keep only referrers for this platform.
    pub platform: Option<Platform>,

    /// Order results by this annotation (string, or RFC3339 when both values
    /// parse as dates).
    pub sort_annotation: Option<String>,

    /// Reverse the sort order.
    pub sort_desc: bool,
}

/// The referrers of a subject manifest.
#[derive(Debug)]
pub struct ReferrerList {
    /// The subject, with its digest resolved.
    pub subject: Reference,

    /// Matching referrer descriptors, filtered and ordered per the options.
    pub descriptors: Vec<Descriptor>,

    /// Where the listing came from (native API or a fallback tag).
    pub source: ReferrerSource,
}

/// One node of a recursive manifest walk: the manifest with its resolved
/// children and referrers, or the error that stopped this branch.
#[derive(Debug)]
pub struct TreeNode {
    /// The reference this node was fetched from.
    pub reference: Reference,

    /// The manifest, when the fetch succeeded.
    pub manifest: Option<Manifest>,

    /// Child manifests of an index.
    pub children: Vec<TreeNode>,

    /// Referrers of this manifest.
    pub referrers: Vec<TreeNode>,

    /// The error that stopped this branch (a fetch failure, or
    /// [`OciregError::LoopEncountered`] on a revisit).
    pub error: Option<OciregError>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TreeNode {
    fn leaf(reference: Reference, error: Option<OciregError>) -> Self {
        Self {
            reference,
            manifest: None,
            children: Vec::new(),
            referrers: Vec::new(),
            error,
        }
    }

    /// The first error anywhere in the tree, depth first.
    pub fn first_error(&self) -> Option<&OciregError> {
        if let Some(err) = &self.error {
            return Some(err);
        }
        self.children
            .iter()
            .chain(self.referrers.iter())
            .find_map(|node| node.first_error())
    }
}

impl Client {
    /// Lists the referrers of a manifest: artifacts whose `subject` is the
    /// manifest's digest.
    ///
    /// The subject digest is resolved with a HEAD when the reference only
    /// has a tag. Listing prefers the native referrers endpoint and falls
    /// back to the `algo-hex` tag; a missing fallback tag is an empty list.
    /// Filters are applied client side regardless of any server-side hint.
    pub async fn referrer_list(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        opts: ReferrerOpts,
    ) -> OciregResult<ReferrerList> {
        let subject = self.resolve_digest(ctx, r).await?;
        let scheme = self.scheme_for(&subject);
        let resp = scheme
            .referrer_list(ctx, &subject, opts.artifact_type.as_deref())
            .await?;

        let match_opt = MatchOpt {
            artifact_type: opts.artifact_type.clone(),
            annotations: opts.annotations.clone(),
            platform: opts.platform.clone(),
            sort_annotation: opts.sort_annotation.clone(),
            sort_desc: opts.sort_desc,
        };
        let all = resp.manifest.children()?;
        let descriptors = if match_opt.sort_annotation.is_some() {
            match_descriptors(&all, &match_opt)
        } else {
            // Without a sort annotation the server order is preserved.
            all.iter()
                .filter(|d| d.matches(&match_opt))
                .cloned()
                .collect()
        };

        Ok(ReferrerList {
            subject,
            descriptors,
            source: resp.source,
        })
    }

    /// Walks a manifest recursively: index children, then referrers of every
    /// visited manifest. A digest seen twice stops that branch with
    /// [`OciregError::LoopEncountered`]; the partial tree is still returned.
    pub async fn manifest_tree(&self, ctx: &OpCtx, r: &Reference) -> OciregResult<TreeNode> {
        let mut seen = HashSet::new();
        self.tree_walk(ctx, r, &mut seen).await
    }

    #[async_recursion]
    async fn tree_walk(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        seen: &mut HashSet<String>,
    ) -> OciregResult<TreeNode> {
        if ctx.is_canceled() {
            return Err(OciregError::Canceled);
        }
        let manifest = match self.scheme_for(r).manifest_get(ctx, r).await {
            Ok(manifest) => manifest,
            Err(err) => return Ok(TreeNode::leaf(r.clone(), Some(err))),
        };
        let digest = manifest.digest()?;
        if !seen.insert(digest.to_string()) {
            return Ok(TreeNode::leaf(
                r.clone(),
                Some(OciregError::LoopEncountered(r.common_name())),
            ));
        }

        let mut node = TreeNode {
            reference: r.clone(),
            children: Vec::new(),
            referrers: Vec::new(),
            error: None,
            manifest: None,
        };

        if manifest.is_list() {
            for child in manifest.children()? {
                let child_ref = r.set_digest(child.digest.clone());
                node.children.push(self.tree_walk(ctx, &child_ref, seen).await?);
            }
        }

        let subject_ref = r.set_digest(digest);
        let referrers = self
            .referrer_list(ctx, &subject_ref, ReferrerOpts::default())
            .await?;
        for desc in &referrers.descriptors {
            let referrer_ref = r.set_digest(desc.digest.clone());
            node.referrers
                .push(self.tree_walk(ctx, &referrer_ref, seen).await?);
        }

        node.manifest = Some(manifest);
        Ok(node)
    }

    /// Resolves a reference to one carrying a digest, via the HEAD cache.
    pub(crate) async fn resolve_digest(
        &self,
        ctx: &OpCtx,
        r: &Reference,
    ) -> OciregResult<Reference> {
        if r.get_digest().is_some() {
            return Ok(r.clone());
        }
        let desc = self
            .manifest_head(ctx, r, ManifestHeadOpts { require_digest: true })
            .await?;
        Ok(r.add_digest(desc.digest))
    }

    /// Adds `entry` to the fallback tag index of `subject`, creating the
    /// index when absent. Used when a backend does not record `subject`
    /// relations natively.
    pub(crate) async fn referrer_fallback_add(
        &self,
        ctx: &OpCtx,
        subject: &Reference,
        entry: Descriptor,
    ) -> OciregResult<()> {
        let (tag_ref, mut index) = self.fallback_index(ctx, subject).await?;
        let mut children = index.children()?;
        if children.iter().any(|d| d.digest == entry.digest) {
            return Ok(());
        }
        children.push(entry);
        index.set_manifest_list(children)?;
        self.scheme_for(subject)
            .manifest_put(ctx, &tag_ref, &index)
            .await?;
        Ok(())
    }

    /// Removes the referrer with `digest` from the fallback tag index of
    /// `subject`, deleting the index when it becomes empty.
    pub(crate) async fn referrer_fallback_remove(
        &self,
        ctx: &OpCtx,
        subject: &Reference,
        digest: &Digest,
    ) -> OciregResult<()> {
        let (tag_ref, mut index) = self.fallback_index(ctx, subject).await?;
        let children = index.children()?;
        let kept: Vec<Descriptor> = children
            .iter()
            .filter(|d| d.digest != *digest)
            .cloned()
            .collect();
        if kept.len() == children.len() {
            return Ok(());
        }
        let scheme = self.scheme_for(subject);
        if kept.is_empty() {
            match scheme.manifest_delete(ctx, &tag_ref).await {
                Ok(()) | Err(OciregError::NotFound(_)) => {}
                // Registries without tag deletion keep an empty index.
                Err(OciregError::NotImplemented(_)) => {
                    index.set_manifest_list(kept)?;
                    scheme.manifest_put(ctx, &tag_ref, &index).await?;
                }
                Err(err) => return Err(err),
            }
            return Ok(());
        }
        index.set_manifest_list(kept)?;
        scheme.manifest_put(ctx, &tag_ref, &index).await?;
        Ok(())
    }

    /// The fallback tag reference of a subject and the index stored there
    /// (empty when the tag does not exist).
    async fn fallback_index(
        &self,
        ctx: &OpCtx,
        subject: &Reference,
    ) -> OciregResult<(Reference, Manifest)> {
        let digest = subject
            .get_digest()
            .as_ref()
            .ok_or_else(|| OciregError::MissingDigest(subject.common_name()))?;
        let tag_ref = subject.set_tag(digest.fallback_tag())?;
        let index = match self.scheme_for(subject).manifest_get(ctx, &tag_ref).await {
            Ok(manifest) if manifest.is_list() => manifest,
            Ok(_) | Err(OciregError::NotFound(_)) => empty_referrer_index()?,
            Err(err) => return Err(err),
        };
        Ok((tag_ref, index))
    }
}
