//! Blob streaming: a reader that digests content as it flows and verifies it
//! against its descriptor on close, and the source type blob uploads consume.

use std::{
    path::Path,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::{stream::BoxStream, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{Descriptor, Digest, DigestAlgorithm, Digester, OciregError, OciregResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Progress callback: `(bytes_so_far, total_expected)`. Total is 0 when the
/// size is not known up front. Must be callable from worker tasks.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// A blob being read. The descriptor grows as bytes flow; the digest and
/// size are finalized when the stream ends, and a mismatch against the
/// expected digest surfaces as [`OciregError::DigestMismatch`].
pub struct BlobReader {
    stream: BoxStream<'static, OciregResult<Bytes>>,
    descriptor: Descriptor,
    expected: Option<Digest>,
    digester: Option<Digester>,
    read: u64,
    progress: Option<(ProgressFn, Duration, Instant)>,
    cancel: Option<CancellationToken>,
    finished: bool,
}

/// Content handed to a blob upload.
pub enum BlobSource {
    /// In-memory content.
    Bytes(Bytes),

    /// Streamed content of unknown digest.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

/// A blob spooled to a temp file with its digest computed, ready for upload
/// or rename into a layout.
pub struct SpooledBlob {
    /// Open handle positioned at the start of the content.
    pub file: tokio::fs::File,

    /// The temp file path; dropping it deletes the file.
    pub path: tempfile::TempPath,

    /// Digest of the spooled content.
    pub digest: Digest,

    /// Size of the spooled content in bytes.
    pub size: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BlobReader {
    /// Wraps a byte stream, verifying it against `descriptor` on completion.
    pub fn from_stream(
        descriptor: Descriptor,
        stream: BoxStream<'static, OciregResult<Bytes>>,
    ) -> Self {
        let expected = Some(descriptor.digest.clone());
        let digester = Digester::new(descriptor.digest.algorithm());
        Self {
            stream,
            descriptor,
            expected,
            digester: Some(digester),
            read: 0,
            progress: None,
            cancel: None,
            finished: false,
        }
    }

    /// Wraps in-memory content that already matched its descriptor.
    pub fn from_bytes(descriptor: Descriptor, bytes: Bytes) -> Self {
        let stream = futures::stream::once(async move { Ok(bytes) }).boxed();
        Self::from_stream(descriptor, stream)
    }

    /// Attaches a progress callback, invoked at most once per `interval`.
    pub fn with_progress(mut self, progress: ProgressFn, interval: Duration) -> Self {
        self.progress = Some((progress, interval, Instant::now()));
        self
    }

    /// Binds the reader to a cancellation token: once canceled, the next
    /// read yields [`OciregError::Canceled`].
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// The descriptor as currently known. Size and digest are final only
    /// after the stream has been fully consumed.
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Reads the remaining stream into memory, verifying the digest.
    pub async fn read_all(mut self) -> OciregResult<Bytes> {
        let mut buf = Vec::with_capacity(self.descriptor.size as usize);
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buf))
    }

    /// Converts into an [`AsyncRead`], mapping stream errors onto io errors.
    pub fn into_async_read(self) -> impl AsyncRead + Send + Unpin {
        tokio_util::io::StreamReader::new(
            self.map(|item| item.map_err(|e| std::io::Error::other(e.to_string()))),
        )
    }

    fn finish(&mut self) -> OciregResult<()> {
        self.finished = true;
        let Some(digester) = self.digester.take() else {
            return Ok(());
        };
        let computed = digester.finalize();
        self.descriptor.size = self.read;
        if let Some(expected) = &self.expected {
            if *expected != computed {
                return Err(OciregError::DigestMismatch {
                    expected: expected.to_string(),
                    computed: computed.to_string(),
                });
            }
        }
        self.descriptor.digest = computed;
        Ok(())
    }
}

impl BlobSource {
    /// Spools the content to a temp file in `dir`, computing its digest on
    /// the fly. Used when an upload needs a digest before the first byte hits
    /// the wire, and by layout stores that rename blobs into place.
    pub async fn spool(self, algorithm: DigestAlgorithm, dir: &Path) -> OciregResult<SpooledBlob> {
        let (file, path) = tempfile::NamedTempFile::new_in(dir)?.into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let mut digester = Digester::new(algorithm);
        let mut size: u64 = 0;

        match self {
            BlobSource::Bytes(bytes) => {
                digester.update(&bytes);
                size = bytes.len() as u64;
                file.write_all(&bytes).await?;
            }
            BlobSource::Reader(mut reader) => {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    let n = reader.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    digester.update(&buf[..n]);
                    size += n as u64;
                    file.write_all(&buf[..n]).await?;
                }
            }
        }

        file.flush().await?;
        file.seek(std::io::SeekFrom::Start(0)).await?;
        Ok(SpooledBlob {
            file,
            path,
            digest: digester.finalize(),
            size,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Stream for BlobReader {
    type Item = OciregResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if this.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            this.finished = true;
            return Poll::Ready(Some(Err(OciregError::Canceled)));
        }
        match this.stream.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(digester) = &mut this.digester {
                    digester.update(&chunk);
                }
                this.read += chunk.len() as u64;
                if this.read > this.descriptor.size {
                    this.descriptor.size = this.read;
                }
                if let Some((progress, interval, last)) = &mut this.progress {
                    if last.elapsed() >= *interval {
                        *last = Instant::now();
                        progress(this.read, this.descriptor.size);
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.finished = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => match this.finish() {
                Ok(()) => {
                    if let Some((progress, _, _)) = &this.progress {
                        progress(this.read, this.descriptor.size);
                    }
                    Poll::Ready(None)
                }
                Err(err) => Poll::Ready(Some(Err(err))),
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediatype::MEDIA_TYPE_OCI_LAYER_GZIP;

    fn layer_descriptor(content: &[u8]) -> Descriptor {
        Descriptor::new(
            MEDIA_TYPE_OCI_LAYER_GZIP,
            Digest::sha256(content),
            content.len() as u64,
        )
    }

    #[tokio::test]
    async fn test_blob_reader_verifies_digest() {
        let content = b"layer bytes".to_vec();
        let reader = BlobReader::from_bytes(layer_descriptor(&content), Bytes::from(content.clone()));
        let read = reader.read_all().await.unwrap();
        assert_eq!(read, Bytes::from(content));
    }

    #[tokio::test]
    async fn test_blob_reader_detects_corruption() {
        let descriptor = layer_descriptor(b"expected");
        let reader = BlobReader::from_bytes(descriptor, Bytes::from_static(b"tampered"));
        let err = reader.read_all().await.unwrap_err();
        assert!(matches!(err, OciregError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn test_blob_reader_descriptor_finalizes_on_close() {
        let content = b"chunked content".to_vec();
        let chunks: Vec<OciregResult<Bytes>> = content
            .chunks(4)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let mut descriptor = layer_descriptor(&content);
        descriptor.size = 0; // size not known up front
        let mut reader =
            BlobReader::from_stream(descriptor, futures::stream::iter(chunks).boxed());

        while let Some(chunk) = reader.next().await {
            chunk.unwrap();
        }
        assert_eq!(reader.descriptor().size, content.len() as u64);
        assert_eq!(reader.descriptor().digest, Digest::sha256(&content));
    }

    #[tokio::test]
    async fn test_blob_source_spool_digests_content() {
        let dir = tempfile::tempdir().unwrap();
        let content = b"spooled".to_vec();
        let source = BlobSource::Reader(Box::new(std::io::Cursor::new(content.clone())));
        let mut spooled = source
            .spool(DigestAlgorithm::Sha256, dir.path())
            .await
            .unwrap();

        assert_eq!(spooled.digest, Digest::sha256(&content));
        assert_eq!(spooled.size, content.len() as u64);

        let mut read_back = Vec::new();
        spooled.file.read_to_end(&mut read_back).await.unwrap();
        assert_eq!(read_back, content);
    }
}
