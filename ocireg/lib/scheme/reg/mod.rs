//! The remote registry backend: the HTTP Distribution API state machine over
//! [`Transport`].

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use reqwest::{Method, StatusCode};

use crate::{
    config::Config,
    scheme::{ManifestPutResult, ReferrerResponse, SchemeApi},
    transport::{Transport, TransportRequest, TransportResponse},
    BlobReader, BlobSource, Descriptor, Manifest, OciregError, OciregResult, OpCtx, Reference,
    TagList,
};

mod blob;
mod manifest;
mod referrer;

pub use crate::tag::RepoList;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Client for registries speaking the HTTP Distribution API.
pub struct RegScheme {
    transport: Arc<Transport>,
    config: Arc<RwLock<Config>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegScheme {
    /// Creates the registry backend over a shared transport and config.
    pub fn new(transport: Arc<Transport>, config: Arc<RwLock<Config>>) -> Self {
        Self { transport, config }
    }

    /// A point-in-time copy of the host configuration.
    pub(crate) fn config(&self) -> Config {
        self.config.read().expect("config lock poisoned").clone()
    }

    /// Dispatches a request to the registry a reference names.
    pub(crate) async fn send(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        req: TransportRequest,
    ) -> OciregResult<TransportResponse> {
        let config = self.config();
        self.transport
            .request(ctx, &config, r.get_registry(), req)
            .await
    }

    /// Lists the repositories of a registry via `/v2/_catalog`.
    pub async fn repo_list(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        limit: Option<u32>,
        last: Option<&str>,
    ) -> OciregResult<RepoList> {
        let mut req = TransportRequest::get("/v2/_catalog").scope("registry:catalog:*".to_string());
        if let Some(limit) = limit {
            req = req.query("n", limit.to_string());
        }
        if let Some(last) = last {
            req = req.query("last", last);
        }
        let resp = self.send(ctx, r, req).await?;
        let resp = expect_status(resp, &[StatusCode::OK], r.get_registry())?;
        Ok(serde_json::from_slice(&resp.bytes().await?)?)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl SchemeApi for RegScheme {
    async fn manifest_get(&self, ctx: &OpCtx, r: &Reference) -> OciregResult<Manifest> {
        self.manifest_get_reg(ctx, r).await
    }

    async fn manifest_head(&self, ctx: &OpCtx, r: &Reference) -> OciregResult<Descriptor> {
        self.manifest_head_reg(ctx, r).await
    }

    async fn manifest_put(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        manifest: &Manifest,
    ) -> OciregResult<ManifestPutResult> {
        self.manifest_put_reg(ctx, r, manifest).await
    }

    async fn manifest_delete(&self, ctx: &OpCtx, r: &Reference) -> OciregResult<()> {
        self.manifest_delete_reg(ctx, r).await
    }

    async fn blob_get(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        desc: &Descriptor,
    ) -> OciregResult<BlobReader> {
        self.blob_get_reg(ctx, r, desc).await
    }

    async fn blob_head(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        desc: &Descriptor,
    ) -> OciregResult<Descriptor> {
        self.blob_head_reg(ctx, r, desc).await
    }

    async fn blob_mount(
        &self,
        ctx: &OpCtx,
        src: &Reference,
        tgt: &Reference,
        desc: &Descriptor,
    ) -> OciregResult<()> {
        self.blob_mount_reg(ctx, src, tgt, desc).await
    }

    async fn blob_put(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        hint: Option<&Descriptor>,
        source: BlobSource,
    ) -> OciregResult<Descriptor> {
        self.blob_put_reg(ctx, r, hint, source).await
    }

    async fn blob_delete(&self, ctx: &OpCtx, r: &Reference, desc: &Descriptor) -> OciregResult<()> {
        let path = format!("/v2/{}/blobs/{}", r.get_repository(), desc.digest);
        let req = TransportRequest::new(Method::DELETE, path).scope(scope_push(r));
        let resp = self.send(ctx, r, req).await?;
        if resp.status() == StatusCode::METHOD_NOT_ALLOWED {
            return Err(OciregError::NotImplemented(format!(
                "blob delete on {}",
                r.get_registry()
            )));
        }
        expect_status(
            resp,
            &[StatusCode::ACCEPTED, StatusCode::OK, StatusCode::NO_CONTENT],
            &format!("{}@{}", r.common_name(), desc.digest),
        )?;
        Ok(())
    }

    async fn tag_list(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        limit: Option<u32>,
        last: Option<&str>,
    ) -> OciregResult<TagList> {
        let path = format!("/v2/{}/tags/list", r.get_repository());
        let mut req = TransportRequest::get(path).scope(scope_pull(r));
        if let Some(limit) = limit {
            req = req.query("n", limit.to_string());
        }
        if let Some(last) = last {
            req = req.query("last", last);
        }
        let resp = self.send(ctx, r, req).await?;
        let resp = expect_status(resp, &[StatusCode::OK], &r.common_name())?;
        Ok(serde_json::from_slice(&resp.bytes().await?)?)
    }

    async fn referrer_list(
        &self,
        ctx: &OpCtx,
        subject: &Reference,
        artifact_type: Option<&str>,
    ) -> OciregResult<ReferrerResponse> {
        self.referrer_list_reg(ctx, subject, artifact_type).await
    }

    async fn ping(&self, ctx: &OpCtx, r: &Reference) -> OciregResult<()> {
        let resp = self.send(ctx, r, TransportRequest::get("/v2/")).await?;
        expect_status(resp, &[StatusCode::OK], r.get_registry())?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The pull scope for a reference's repository.
pub(crate) fn scope_pull(r: &Reference) -> String {
    format!("repository:{}:pull", r.get_repository())
}

/// The pull+push scope for a reference's repository.
pub(crate) fn scope_push(r: &Reference) -> String {
    format!("repository:{}:pull,push", r.get_repository())
}

/// Maps unexpected statuses onto the error taxonomy: 404 is [`OciregError::NotFound`],
/// anything else unexpected is an HTTP status error.
pub(crate) fn expect_status(
    resp: TransportResponse,
    expected: &[StatusCode],
    resource: &str,
) -> OciregResult<TransportResponse> {
    let status = resp.status();
    if expected.contains(&status) {
        return Ok(resp);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(OciregError::NotFound(resource.to_string()));
    }
    Err(OciregError::http_status(status.as_u16(), resource))
}

/// Reduces an upload `Location` to a path under the host's API root. Absolute
/// URLs on the same root are stripped; foreign absolute URLs keep their path
/// and query.
pub(crate) fn location_to_path(api_root: &str, location: &str) -> String {
    if let Some(rest) = location.strip_prefix(api_root) {
        if rest.starts_with('/') {
            return rest.to_string();
        }
    }
    if let Some(scheme_end) = location.find("://") {
        let after = &location[scheme_end + 3..];
        return match after.find('/') {
            Some(idx) => after[idx..].to_string(),
            None => "/".to_string(),
        };
    }
    if location.starts_with('/') {
        location.to_string()
    } else {
        format!("/{}", location)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
