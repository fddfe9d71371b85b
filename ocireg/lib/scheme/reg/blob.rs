//! Blob endpoints of the Distribution API, including chunked resumable
//! uploads and cross-repository mounts.

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Method, StatusCode};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{
    transport::{TransportRequest, TransportResponse},
    BlobReader, BlobSource, Descriptor, Digest, DigestAlgorithm, OciregError, OciregResult, OpCtx,
    Reference,
};

use super::{expect_status, location_to_path, scope_pull, scope_push, RegScheme};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Times a chunk is re-sent after a range mismatch before giving up.
const CHUNK_RETRY_LIMIT: u32 = 3;

/// Media type reported for blobs without a descriptor hint.
const MEDIA_TYPE_OCTET_STREAM: &str = "application/octet-stream";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Upload content with random access, so chunks can be re-sent after a range
/// mismatch without rewinding the caller's stream.
enum PutContent {
    Mem(Bytes),
    File(tokio::fs::File, #[allow(dead_code)] tempfile::TempPath),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PutContent {
    async fn chunk(&mut self, start: u64, len: u64) -> OciregResult<Bytes> {
        match self {
            PutContent::Mem(bytes) => {
                let start = start as usize;
                let end = (start + len as usize).min(bytes.len());
                Ok(bytes.slice(start..end))
            }
            PutContent::File(file, _) => {
                file.seek(std::io::SeekFrom::Start(start)).await?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl RegScheme {
    pub(crate) async fn blob_get_reg(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        desc: &Descriptor,
    ) -> OciregResult<BlobReader> {
        let path = format!("/v2/{}/blobs/{}", r.get_repository(), desc.digest);
        let req = TransportRequest::get(path)
            .header("Accept", MEDIA_TYPE_OCTET_STREAM)
            .scope(scope_pull(r));
        let resp = self.send(ctx, r, req).await?;
        let resp = expect_status(
            resp,
            &[StatusCode::OK],
            &format!("{}@{}", r.common_name(), desc.digest),
        )?;

        let mut descriptor = desc.clone();
        if descriptor.size == 0 {
            if let Some(length) = resp
                .header_str("content-length")
                .and_then(|v| v.parse::<u64>().ok())
            {
                descriptor.size = length;
            }
        }
        let stream = resp
            .response
            .bytes_stream()
            .map_err(OciregError::from)
            .boxed();
        Ok(BlobReader::from_stream(descriptor, stream).with_cancel(ctx.cancel_token().clone()))
    }

    pub(crate) async fn blob_head_reg(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        desc: &Descriptor,
    ) -> OciregResult<Descriptor> {
        let path = format!("/v2/{}/blobs/{}", r.get_repository(), desc.digest);
        let req = TransportRequest::new(Method::HEAD, path).scope(scope_pull(r));
        let resp = self.send(ctx, r, req).await?;
        let resp = expect_status(
            resp,
            &[StatusCode::OK],
            &format!("{}@{}", r.common_name(), desc.digest),
        )?;

        let mut descriptor = desc.clone();
        if let Some(length) = resp
            .header_str("content-length")
            .and_then(|v| v.parse::<u64>().ok())
        {
            if descriptor.size == 0 {
                descriptor.size = length;
            }
        }
        Ok(descriptor)
    }

    pub(crate) async fn blob_mount_reg(
        &self,
        ctx: &OpCtx,
        src: &Reference,
        tgt: &Reference,
        desc: &Descriptor,
    ) -> OciregResult<()> {
        let path = format!("/v2/{}/blobs/uploads/", tgt.get_repository());
        let req = TransportRequest::new(Method::POST, path)
            .query("mount", desc.digest.to_string())
            .query("from", src.get_repository())
            .header("Content-Length", "0")
            .scope(scope_push(tgt))
            .scope(scope_pull(src));
        let resp = self.send(ctx, tgt, req).await?;
        match resp.status() {
            StatusCode::CREATED => Ok(()),
            // 202 means the registry opened a plain upload session instead of
            // mounting; the abandoned session is collected server-side.
            status => Err(OciregError::http_status(
                status.as_u16(),
                format!("mount {} into {}", desc.digest, tgt.common_name()),
            )),
        }
    }

    pub(crate) async fn blob_put_reg(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        hint: Option<&Descriptor>,
        source: BlobSource,
    ) -> OciregResult<Descriptor> {
        let config = self.config();
        let host = config.host(r.get_registry());
        let media_type = hint
            .map(|h| h.media_type.clone())
            .unwrap_or_else(|| MEDIA_TYPE_OCTET_STREAM.to_string());
        let algorithm = hint
            .map(|h| h.digest.algorithm())
            .unwrap_or(DigestAlgorithm::Sha256);

        // Normalize the source into random-access content with a known digest.
        let (mut content, digest, size) = match source {
            BlobSource::Bytes(bytes) => {
                let computed = Digest::from_bytes(algorithm, &bytes);
                let size = bytes.len() as u64;
                (PutContent::Mem(bytes), computed, size)
            }
            BlobSource::Reader(reader) => {
                let spooled = BlobSource::Reader(reader)
                    .spool(algorithm, &std::env::temp_dir())
                    .await?;
                (
                    PutContent::File(spooled.file, spooled.path),
                    spooled.digest,
                    spooled.size,
                )
            }
        };
        if let Some(expected) = hint.map(|h| &h.digest) {
            if *expected != digest {
                return Err(OciregError::DigestMismatch {
                    expected: expected.to_string(),
                    computed: digest.to_string(),
                });
            }
        }
        if let Some(limit) = config.blob_limit.or(host.blob_max) {
            if size > limit {
                return Err(OciregError::BlobTooLarge { size, limit });
            }
        }

        let location = self.upload_start(ctx, r).await?;
        if size < host.blob_chunk {
            let body = content.chunk(0, size).await?;
            self.upload_finalize(ctx, r, &location, &digest, Some(body))
                .await?;
        } else {
            let location = self
                .upload_chunks(ctx, r, location, &mut content, size, host.blob_chunk)
                .await?;
            self.upload_finalize(ctx, r, &location, &digest, None).await?;
        }

        tracing::debug!("uploaded blob {} ({} bytes) to {}", digest, size, r.common_name());
        Ok(Descriptor::new(media_type, digest, size))
    }

    /// Opens an upload session and returns its location path.
    async fn upload_start(&self, ctx: &OpCtx, r: &Reference) -> OciregResult<String> {
        let path = format!("/v2/{}/blobs/uploads/", r.get_repository());
        let req = TransportRequest::new(Method::POST, path)
            .header("Content-Length", "0")
            .scope(scope_push(r));
        let resp = self.send(ctx, r, req).await?;
        let resp = expect_status(resp, &[StatusCode::ACCEPTED], &r.common_name())?;
        self.upload_location(r, &resp)
    }

    /// Sends the content as ordered chunks, re-synchronizing from the
    /// server-reported `Range` on a range mismatch. Returns the location for
    /// the finalizing PUT.
    async fn upload_chunks(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        mut location: String,
        content: &mut PutContent,
        size: u64,
        chunk_size: u64,
    ) -> OciregResult<String> {
        let mut start: u64 = 0;
        let mut retries: u32 = 0;
        while start < size {
            if ctx.is_canceled() {
                return Err(OciregError::Canceled);
            }
            let len = chunk_size.min(size - start);
            let body = content.chunk(start, len).await?;
            let end = start + len - 1;
            let req = TransportRequest::new(Method::PATCH, location.clone())
                .header("Content-Type", MEDIA_TYPE_OCTET_STREAM)
                .header("Content-Range", format!("{}-{}", start, end))
                .body(body)
                .scope(scope_push(r));
            let resp = self.send(ctx, r, req).await?;
            match resp.status() {
                StatusCode::ACCEPTED => {
                    start = match accepted_range(&resp) {
                        Some(last) => last + 1,
                        None => end + 1,
                    };
                    location = self.upload_location(r, &resp)?;
                    retries = 0;
                }
                StatusCode::RANGE_NOT_SATISFIABLE | StatusCode::BAD_REQUEST => {
                    retries += 1;
                    if retries > CHUNK_RETRY_LIMIT {
                        return Err(OciregError::http_status(
                            resp.status().as_u16(),
                            r.common_name(),
                        ));
                    }
                    // Resume from the last byte the server actually holds.
                    if let Some(last) = accepted_range(&resp) {
                        start = last + 1;
                    }
                    if let Ok(new_location) = self.upload_location(r, &resp) {
                        location = new_location;
                    }
                }
                status => {
                    return Err(OciregError::http_status(status.as_u16(), r.common_name()));
                }
            }
        }
        Ok(location)
    }

    /// Completes an upload session with `PUT <location>?digest=`.
    async fn upload_finalize(
        &self,
        ctx: &OpCtx,
        r: &Reference,
        location: &str,
        digest: &Digest,
        body: Option<Bytes>,
    ) -> OciregResult<()> {
        let mut req = TransportRequest::new(Method::PUT, location.to_string())
            .query("digest", digest.to_string())
            .header("Content-Type", MEDIA_TYPE_OCTET_STREAM)
            .scope(scope_push(r));
        if let Some(body) = body {
            req = req.body(body);
        }
        let resp = self.send(ctx, r, req).await?;
        expect_status(
            resp,
            &[StatusCode::CREATED, StatusCode::OK, StatusCode::NO_CONTENT],
            &format!("{}@{}", r.common_name(), digest),
        )?;
        Ok(())
    }

    /// Extracts the next upload location from a response.
    fn upload_location(&self, r: &Reference, resp: &TransportResponse) -> OciregResult<String> {
        let host = self.config().host(r.get_registry());
        resp.header_str("location")
            .map(|l| location_to_path(&host.api_root(), &l))
            .ok_or_else(|| {
                OciregError::NetworkFatal(format!(
                    "upload to {} returned no Location header",
                    r.common_name()
                ))
            })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses the server's `Range: 0-N` header; `N` is the last accepted byte.
fn accepted_range(resp: &TransportResponse) -> Option<u64> {
    let value = resp.header_str("range")?;
    let value = value.strip_prefix("bytes=").unwrap_or(&value);
    let (_, end) = value.split_once('-')?;
    end.trim().parse().ok()
}
