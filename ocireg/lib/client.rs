//! The top-level client: host configuration, scheme dispatch, the manifest
//! HEAD cache, and the blob/manifest/tag operation families.

use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use async_recursion::async_recursion;

use crate::{
    config::{Config, Host, DEFAULT_MANIFEST_CACHE_SIZE, DEFAULT_MANIFEST_CACHE_TTL_SECS},
    scheme::{OciDirScheme, RegScheme, SchemeApi},
    transport::Transport,
    BlobReader, BlobSource, Credential, CredentialProvider, Descriptor, Manifest, OciregError,
    OciregResult, OpCtx, Platform, ProgressFn, RefScheme, Reference, RepoList, TagList,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Options for [`Client::manifest_get`].
#[derive(Debug, Clone, Default)]
pub struct ManifestGetOpts {
    /// Resolve index manifests to the child matching this platform.
    pub platform: Option<Platform>,
}

/// Options for [`Client::manifest_head`].
#[derive(Debug, Clone, Default)]
pub struct ManifestHeadOpts {
    /// Fall back to a full GET when the backend reports no digest.
    pub require_digest: bool,
}

/// Options for [`Client::manifest_delete`].
#[derive(Debug, Clone, Default)]
pub struct ManifestDeleteOpts {
    /// Delete referrers of the manifest before the manifest itself.
    pub check_referrers: bool,
}

/// Options for [`Client::blob_copy`].
#[derive(Clone, Default)]
pub struct BlobCopyOpts {
    /// Progress callback, invoked at a bounded frequency.
    pub progress: Option<ProgressFn>,
}

/// The registry client. Cheap to share: all state lives behind `Arc`s.
pub struct Client {
    config: Arc<RwLock<Config>>,
    reg: RegScheme,
    ocidir: OciDirScheme,
    head_cache: Mutex<HeadCache>,
}

/// Credential lookups backed by the host config table.
struct ConfigCredentials {
    config: Arc<RwLock<Config>>,
}

/// TTL-bounded LRU for manifest HEAD results, keyed by canonical reference.
struct HeadCache {
    entries: HashMap<String, (Instant, Descriptor)>,
    order: VecDeque<String>,
    ttl: Duration,
    capacity: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HeadCache {
    fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            ttl,
            capacity,
        }
    }

    fn get(&mut self, key: &str) -> Option<Descriptor> {
        match self.entries.get(key) {
            Some((at, desc)) if at.elapsed() < self.ttl => Some(desc.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn insert(&mut self, key: String, desc: Descriptor) {
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, (Instant::now(), desc));
    }

    fn invalidate(&mut self, key: &str) {
        self.entries.remove(key);
    }
}

impl Client {
    /// Creates a client with an empty configuration.
    pub fn new() -> Self {
        Self::with_config(Config::new())
    }

    /// Creates a client over an explicit configuration.
    pub fn with_config(config: Config) -> Self {
        let config = Arc::new(RwLock::new(config));
        let provider: Arc<dyn CredentialProvider> = Arc::new(ConfigCredentials {
            config: config.clone(),
        });
        Self::with_provider(config, provider)
    }

    /// Creates a client with a custom credential provider (e.g. one backed by
    /// Docker config files or helpers).
    pub fn with_provider(
        config: Arc<RwLock<Config>>,
        provider: Arc<dyn CredentialProvider>,
    ) -> Self {
        let transport = Arc::new(Transport::new(provider));
        Self {
            reg: RegScheme::new(transport, config.clone()),
            ocidir: OciDirScheme::new(),
            config,
            head_cache: Mutex::new(HeadCache::new(
                Duration::from_secs(DEFAULT_MANIFEST_CACHE_TTL_SECS),
                DEFAULT_MANIFEST_CACHE_SIZE,
            )),
        }
    }

    /// Creates a client from the config file at its default location.
    pub async fn from_default_config() -> OciregResult<Self> {
        Ok(Self::with_config(Config::load_default().await?))
    }

    /// A point-in-time copy of the configuration.
    pub fn config(&self) -> Config {
        self.config.read().expect("config lock poisoned").clone()
    }

    /// Inserts or replaces a host entry. Persist with [`Client::config_save`].
    pub fn set_host(&self, host: Host) {
        self.config
            .write()
            .expect("config lock poisoned")
            .set_host(host);
    }

    /// Saves the configuration to `path` with write-to-temp + atomic rename.
    pub async fn config_save(&self, path: impl AsRef<Path>) -> OciregResult<()> {
        let config = self.config();
        config.save(path).await
    }

    /// The backend for a reference's scheme.
    pub(crate) fn scheme_for(&self, r: &Reference) -> &dyn SchemeApi {
        match r.get_scheme() {
            RefScheme::Reg => &self.reg,
            RefScheme::OciDir => &self.ocidir,
        }
    }

    // ---- manifest operations ----

    /// Fetches a manifest. With a platform option, an index resolves to the
    /// matching child manifest.
    pub async fn manifest_get(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        opts: ManifestGetOpts,
    ) -> OciregResult<Manifest> {
        let scheme = self.scheme_for(r);
        let manifest = scheme.manifest_get(ctx, r).await?;
        if let Some(platform) = &opts.platform {
            if manifest.is_list() {
                let child = manifest.get_platform_descriptor(Some(platform))?;
                let child_ref = r.set_digest(child.digest.clone());
                return scheme.manifest_get(ctx, &child_ref).await;
            }
        }
        Ok(manifest)
    }

    /// Fetches manifest metadata, served from the HEAD cache when fresh.
    pub async fn manifest_head(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        opts: ManifestHeadOpts,
    ) -> OciregResult<Descriptor> {
        let key = r.common_name();
        if let Some(hit) = self
            .head_cache
            .lock()
            .expect("head cache lock poisoned")
            .get(&key)
        {
            return Ok(hit);
        }

        let scheme = self.scheme_for(r);
        let desc = match scheme.manifest_head(ctx, r).await {
            Ok(desc) => desc,
            Err(OciregError::MissingDigest(_)) if opts.require_digest => {
                scheme.manifest_get(ctx, r).await?.get_descriptor()?
            }
            Err(err) => return Err(err),
        };
        self.head_cache
            .lock()
            .expect("head cache lock poisoned")
            .insert(key, desc.clone());
        Ok(desc)
    }

    /// Stores a manifest. When the manifest carries a `subject` and the
    /// backend does not record the relation natively, the subject's fallback
    /// tag index is updated to include this manifest.
    pub async fn manifest_put(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        manifest: &Manifest,
    ) -> OciregResult<Descriptor> {
        let scheme = self.scheme_for(r);
        let result = scheme.manifest_put(ctx, r, manifest).await?;
        self.head_cache
            .lock()
            .expect("head cache lock poisoned")
            .invalidate(&r.common_name());

        if let Some(subject) = manifest.subject() {
            if !result.subject_handled {
                let subject_ref = r.set_digest(subject.digest.clone());
                let mut entry = result.descriptor.clone();
                entry.artifact_type = manifest.artifact_type().map(str::to_string);
                entry.annotations = manifest.annotations().cloned();
                self.referrer_fallback_add(ctx, &subject_ref, entry).await?;
            }
        }
        Ok(result.descriptor)
    }

    /// Deletes a manifest, optionally sweeping its referrers first and
    /// cleaning up the fallback tag index it appears in.
    #[async_recursion]
    pub async fn manifest_delete(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        opts: ManifestDeleteOpts,
    ) -> OciregResult<()> {
        let scheme = self.scheme_for(r);

        // Fetch first: the subject relation is needed for fallback cleanup.
        let manifest = scheme.manifest_get(ctx, r).await.ok();
        let digest = match r.get_digest() {
            Some(digest) => digest.clone(),
            None => match &manifest {
                Some(m) => m.digest()?,
                None => return Err(OciregError::NotFound(r.common_name())),
            },
        };
        let del_ref = r.add_digest(digest.clone());

        if opts.check_referrers {
            let referrers = self
                .referrer_list(ctx, &del_ref, Default::default())
                .await?;
            for desc in &referrers.descriptors {
                let child = r.set_digest(desc.digest.clone());
                self.manifest_delete(ctx, &child, ManifestDeleteOpts::default())
                    .await?;
            }
        }

        scheme.manifest_delete(ctx, &del_ref).await?;
        {
            let mut cache = self.head_cache.lock().expect("head cache lock poisoned");
            cache.invalidate(&r.common_name());
            cache.invalidate(&del_ref.common_name());
        }

        if let Some(subject) = manifest.as_ref().and_then(|m| m.subject()) {
            let subject_ref = r.set_digest(subject.digest.clone());
            self.referrer_fallback_remove(ctx, &subject_ref, &digest)
                .await?;
        }
        Ok(())
    }

    // ---- blob operations ----

    /// Opens a blob for reading. Descriptors carrying valid inline data are
    /// served without touching the backend.
    pub async fn blob_get(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        desc: &Descriptor,
    ) -> OciregResult<BlobReader> {
        if let Ok(data) = desc.get_data() {
            return Ok(BlobReader::from_bytes(desc.clone(), data));
        }
        self.scheme_for(r).blob_get(ctx, r, desc).await
    }

    /// Checks for a blob and returns its metadata.
    pub async fn blob_head(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        desc: &Descriptor,
    ) -> OciregResult<Descriptor> {
        self.scheme_for(r).blob_head(ctx, r, desc).await
    }

    /// Requests a cross-repository mount of `desc` from `src` into `tgt`.
    pub async fn blob_mount(
        &self,
        ctx: &OpCtx,
        src: &Reference,
        tgt: &Reference,
        desc: &Descriptor,
    ) -> OciregResult<()> {
        self.scheme_for(tgt).blob_mount(ctx, src, tgt, desc).await
    }

    /// Uploads a blob.
    pub async fn blob_put(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        hint: Option<&Descriptor>,
        source: BlobSource,
    ) -> OciregResult<Descriptor> {
        self.scheme_for(r).blob_put(ctx, r, hint, source).await
    }

    /// Deletes a blob, where the backend supports it.
    pub async fn blob_delete(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        desc: &Descriptor,
    ) -> OciregResult<()> {
        self.scheme_for(r).blob_delete(ctx, r, desc).await
    }

    /// Copies a blob between repositories: no-op within a repository or when
    /// the target already has it, a server-side mount within a registry, and
    /// a streamed get/put otherwise.
    pub async fn blob_copy(
        &self,
        ctx: &OpCtx,
        src: &Reference,
        tgt: &Reference,
        desc: &Descriptor,
        opts: BlobCopyOpts,
    ) -> OciregResult<()> {
        if src.equal_repository(tgt) {
            return Ok(());
        }
        if self.blob_head(ctx, tgt, desc).await.is_ok() {
            return Ok(());
        }
        if src.equal_registry(tgt) {
            match self.blob_mount(ctx, src, tgt, desc).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::debug!("mount of {} failed ({}), streaming instead", desc.digest, err);
                }
            }
        }

        let mut reader = self.blob_get(ctx, src, desc).await?;
        if let Some(progress) = &opts.progress {
            reader = reader.with_progress(progress.clone(), Duration::from_millis(250));
        }
        self.blob_put(
            ctx,
            tgt,
            Some(desc),
            BlobSource::Reader(Box::new(reader.into_async_read())),
        )
        .await?;
        Ok(())
    }

    // ---- tag and repository operations ----

    /// Lists tags of a repository.
    pub async fn tag_list(&self, ctx: &OpCtx, r: &Reference) -> OciregResult<TagList> {
        self.scheme_for(r).tag_list(ctx, r, None, None).await
    }

    /// Deletes a tag by deleting the manifest it resolves to.
    pub async fn tag_delete(&self, ctx: &OpCtx, r: &Reference) -> OciregResult<()> {
        if r.get_tag().is_none() {
            return Err(OciregError::MissingTag(r.common_name()));
        }
        self.manifest_delete(ctx, r, ManifestDeleteOpts::default())
            .await
    }

    /// Lists the repositories of a registry. Only the registry scheme has a
    /// catalog.
    pub async fn repo_list(&self, ctx: &OpCtx, r: &Reference) -> OciregResult<RepoList> {
        match r.get_scheme() {
            RefScheme::Reg => self.reg.repo_list(ctx, r, None, None).await,
            RefScheme::OciDir => Err(OciregError::NotImplemented(
                "repository catalog on ocidir".into(),
            )),
        }
    }

    /// Verifies the backend behind a reference is reachable.
    pub async fn ping(&self, ctx: &OpCtx, r: &Reference) -> OciregResult<()> {
        self.scheme_for(r).ping(ctx, r).await
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialProvider for ConfigCredentials {
    fn credential(&self, hostname: &str) -> Option<Credential> {
        self.config
            .read()
            .expect("config lock poisoned")
            .host(hostname)
            .credential()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mediatype::MEDIA_TYPE_OCI_MANIFEST, Digest};

    fn descriptor(content: &[u8]) -> Descriptor {
        Descriptor::new(
            MEDIA_TYPE_OCI_MANIFEST,
            Digest::sha256(content),
            content.len() as u64,
        )
    }

    #[test]
    fn test_client_head_cache_ttl_and_eviction() {
        let mut cache = HeadCache::new(Duration::from_secs(60), 2);
        cache.insert("a".into(), descriptor(b"a"));
        cache.insert("b".into(), descriptor(b"b"));
        assert!(cache.get("a").is_some());

        // Capacity 2: inserting a third evicts the oldest
        cache.insert("c".into(), descriptor(b"c"));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());

        cache.invalidate("b");
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn test_client_head_cache_expiry() {
        let mut cache = HeadCache::new(Duration::ZERO, 10);
        cache.insert("a".into(), descriptor(b"a"));
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn test_client_config_credentials() {
        let client = Client::new();
        let mut host = Host::new("registry.example.com");
        host.user = Some("user".into());
        host.pass = Some("pass".into());
        client.set_host(host);

        let provider = ConfigCredentials {
            config: client.config.clone(),
        };
        let cred = provider.credential("registry.example.com").unwrap();
        assert_eq!(cred.user.as_deref(), Some("user"));
        assert!(provider.credential("anon.example.com").is_none());
    }
}
