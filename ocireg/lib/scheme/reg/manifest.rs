//! Manifest endpoints of the Distribution API.

use reqwest::{Method, StatusCode};

use crate::{
    manifest::ManifestHead,
    mediatype,
    scheme::ManifestPutResult,
    transport::TransportRequest,
    Descriptor, Digest, Manifest, OciregError, OciregResult, OpCtx, Reference,
};

use super::{expect_status, scope_pull, scope_push, RegScheme};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegScheme {
    pub(crate) async fn manifest_get_reg(
        &self,
        ctx: &OpCtx,
        r: &Reference,
    ) -> OciregResult<Manifest> {
        let api_ref = r.api_reference()?;
        let path = format!("/v2/{}/manifests/{}", r.get_repository(), api_ref);
        let req = TransportRequest::get(path)
            .header("Accept", mediatype::accept_list().join(", "))
            .scope(scope_pull(r));

        let resp = self.send(ctx, r, req).await?;
        let resp = expect_status(resp, &[StatusCode::OK], &r.common_name())?;

        let media_type = resp
            .header_str("content-type")
            .unwrap_or_default();
        let header_digest = resp
            .header_str("docker-content-digest")
            .and_then(|v| v.parse::<Digest>().ok());
        let rate_limit = resp.rate_limit.clone();
        let body = resp.bytes().await?;

        // The body must hash to the digest it was requested by (or the digest
        // the registry claims). Anything else is corruption or tampering.
        let check = r.get_digest().as_ref().or(header_digest.as_ref());
        if let Some(expected) = check {
            let computed = Digest::from_bytes(expected.algorithm(), &body);
            if computed != *expected {
                return Err(OciregError::DigestMismatch {
                    expected: expected.to_string(),
                    computed: computed.to_string(),
                });
            }
        }

        let declared = Some(media_type.as_str()).filter(|m| !m.is_empty());
        Ok(Manifest::parse(body, declared)?
            .with_reference(r.clone())
            .with_head(ManifestHead {
                digest: header_digest,
                rate_limit,
            }))
    }

    /// HEAD metadata. [`OciregError::MissingDigest`] when the registry omits
    /// `Docker-Content-Digest`; callers that require a digest fall back to a
    /// full GET.
    pub(crate) async fn manifest_head_reg(
        &self,
        ctx: &OpCtx,
        r: &Reference,
    ) -> OciregResult<Descriptor> {
        let api_ref = r.api_reference()?;
        let path = format!("/v2/{}/manifests/{}", r.get_repository(), api_ref);
        let req = TransportRequest::new(Method::HEAD, path)
            .header("Accept", mediatype::accept_list().join(", "))
            .scope(scope_pull(r));

        let resp = self.send(ctx, r, req).await?;
        let resp = expect_status(resp, &[StatusCode::OK], &r.common_name())?;

        let media_type = resp
            .header_str("content-type")
            .unwrap_or_default();
        let size = resp
            .header_str("content-length")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let digest = match resp
            .header_str("docker-content-digest")
            .and_then(|v| v.parse::<Digest>().ok())
        {
            Some(digest) => digest,
            None => match r.get_digest() {
                Some(digest) => digest.clone(),
                None => return Err(OciregError::MissingDigest(r.common_name())),
            },
        };
        Ok(Descriptor::new(media_type, digest, size))
    }

    pub(crate) async fn manifest_put_reg(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        manifest: &Manifest,
    ) -> OciregResult<ManifestPutResult> {
        let body = manifest.bytes()?;
        let local_digest = manifest.digest()?;
        let api_ref = match r.get_tag() {
            Some(tag) => tag.clone(),
            None => local_digest.to_string(),
        };
        let path = format!("/v2/{}/manifests/{}", r.get_repository(), api_ref);
        let req = TransportRequest::new(Method::PUT, path)
            .header("Content-Type", manifest.get_media_type().clone())
            .body(body)
            .scope(scope_push(r));

        let resp = self.send(ctx, r, req).await?;
        let resp = expect_status(
            resp,
            &[StatusCode::CREATED, StatusCode::OK, StatusCode::ACCEPTED],
            &r.common_name(),
        )?;

        // A registry that echoes a digest must agree with ours.
        if let Some(remote) = resp
            .header_str("docker-content-digest")
            .and_then(|v| v.parse::<Digest>().ok())
        {
            if remote != local_digest {
                return Err(OciregError::DigestMismatch {
                    expected: local_digest.to_string(),
                    computed: remote.to_string(),
                });
            }
        }

        let subject_handled = resp.header_str("oci-subject").is_some();
        Ok(ManifestPutResult {
            descriptor: manifest.get_descriptor()?,
            subject_handled,
        })
    }

    pub(crate) async fn manifest_delete_reg(&self, ctx: &OpCtx, r: &Reference) -> OciregResult<()> {
        let digest = match r.get_digest() {
            Some(digest) => digest.clone(),
            None => self.manifest_head_reg(ctx, r).await?.digest,
        };
        let path = format!("/v2/{}/manifests/{}", r.get_repository(), digest);
        let req = TransportRequest::new(Method::DELETE, path).scope(scope_push(r));
        let resp = self.send(ctx, r, req).await?;
        if resp.status() == StatusCode::METHOD_NOT_ALLOWED {
            return Err(OciregError::NotImplemented(format!(
                "manifest delete on {}",
                r.get_registry()
            )));
        }
        expect_status(
            resp,
            &[StatusCode::ACCEPTED, StatusCode::OK, StatusCode::NO_CONTENT],
            &r.common_name(),
        )?;
        Ok(())
    }
}
