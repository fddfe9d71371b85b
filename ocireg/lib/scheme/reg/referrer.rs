//! The referrers endpoint with its tag fallback.

use reqwest::StatusCode;

use crate::{
    mediatype::MEDIA_TYPE_OCI_INDEX,
    scheme::{empty_referrer_index, ReferrerResponse, ReferrerSource, SchemeApi},
    transport::TransportRequest,
    Manifest, OciregError, OciregResult, OpCtx, Reference,
};

use super::{scope_pull, RegScheme};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegScheme {
    /// Lists referrers: the native `/v2/<name>/referrers/<digest>` endpoint
    /// first, falling back to the `algo-hex` tag on registries that answer
    /// 404. A missing fallback tag is an empty referrer list, not an error.
    pub(crate) async fn referrer_list_reg(
        &self,
        ctx: &OpCtx,
        subject: &Reference,
        artifact_type: Option<&str>,
    ) -> OciregResult<ReferrerResponse> {
        let digest = subject
            .get_digest()
            .as_ref()
            .ok_or_else(|| OciregError::MissingDigest(subject.common_name()))?
            .clone();

        let path = format!("/v2/{}/referrers/{}", subject.get_repository(), digest);
        let mut req = TransportRequest::get(path)
            .header("Accept", MEDIA_TYPE_OCI_INDEX)
            .scope(scope_pull(subject));
        if let Some(artifact_type) = artifact_type {
            req = req.query("artifactType", artifact_type);
        }

        match self.send(ctx, subject, req).await {
            Ok(resp) if resp.status() == StatusCode::OK => {
                let media_type = resp.header_str("content-type");
                let body = resp.bytes().await?;
                let manifest = Manifest::parse(body, media_type.as_deref())?;
                if manifest.is_list() {
                    return Ok(ReferrerResponse {
                        manifest,
                        source: ReferrerSource::Api,
                    });
                }
                // A non-index answer means the endpoint is not really
                // supported; fall through to the tag scheme.
            }
            Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {}
            Ok(resp) => {
                return Err(OciregError::http_status(
                    resp.status().as_u16(),
                    subject.common_name(),
                ))
            }
            Err(err) => return Err(err),
        }

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
}
