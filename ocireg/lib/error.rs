use std::time::SystemTimeError;

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an ocireg operation.
pub type OciregResult<T> = Result<T, OciregError>;

/// An error that occurred during a registry or image-layout operation.
#[derive(pretty_error_debug::Debug, Error)]
pub enum OciregError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred during an HTTP middleware operation.
    #[error("http middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// An error that occurred when a Serde JSON error occurred.
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// An error that occurred when converting system time.
    #[error("system time error: {0}")]
    SystemTime(#[from] SystemTimeError),

    /// An error that occurred when parsing an image reference.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// An error that occurred when parsing a `WWW-Authenticate` challenge.
    #[error("invalid auth challenge: {0}")]
    InvalidChallenge(String),

    /// An error that occurred when a manifest media type is not supported for the operation.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// An error that occurred when a config file version is newer than this library understands.
    #[error("unsupported config version: {0}")]
    UnsupportedConfigVersion(String),

    /// An error that occurred when a manifest, blob, or tag was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// An error that occurred when an operation requires a tag and the reference has none.
    #[error("reference is missing a tag: {0}")]
    MissingTag(String),

    /// An error that occurred when an operation requires a digest and none could be resolved.
    #[error("reference is missing a digest: {0}")]
    MissingDigest(String),

    /// An error that occurred when the registry rejected the request as unauthorized.
    #[error("unauthorized: {0}")]
    HttpUnauthorized(String),

    /// An error that occurred when authentication is required but no credentials are configured.
    #[error("authentication required and no login available for {0}")]
    NoLogin(String),

    /// An error that occurred when a credential lookup failed.
    #[error("credentials not found for {0}")]
    CredentialsNotFound(String),

    /// An error that occurred when the registry rate limit was exhausted.
    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    /// A transient network error that persisted past the configured retry limit.
    #[error("network error (retries exhausted): {0}")]
    NetworkTransient(String),

    /// A network error that is not retriable.
    #[error("network error: {0}")]
    NetworkFatal(String),

    /// An unexpected HTTP status from the registry. The hint, when present,
    /// suggests a likely config fix (e.g. TLS scheme mismatch).
    #[error("unexpected http status {status} for {url}{}", hint.as_deref().map(|h| format!(" ({h})")).unwrap_or_default())]
    HttpStatus {
        /// The HTTP status code.
        status: u16,

        /// The URL of the failed request.
        url: String,

        /// An optional remediation hint.
        hint: Option<String>,
    },

    /// An error that occurred when a manifest or referrer graph contains a cycle.
    #[error("loop encountered in manifest graph at {0}")]
    LoopEncountered(String),

    /// An error that occurred when content did not hash to the digest of its descriptor.
    /// Never retried: it indicates registry corruption or an in-path attacker.
    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch {
        /// The digest the descriptor promised.
        expected: String,

        /// The digest computed over the received bytes.
        computed: String,
    },

    /// An error that occurred when the operation was canceled by its context.
    #[error("operation canceled")]
    Canceled,

    /// An error that occurred when a blob exceeds the configured size limit.
    #[error("blob size {size} exceeds limit {limit}")]
    BlobTooLarge {
        /// The blob size in bytes.
        size: u64,

        /// The configured limit in bytes.
        limit: u64,
    },

    /// An error that occurred when a backend does not implement the requested operation.
    #[error("operation not supported by this scheme: {0}")]
    NotImplemented(String),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OciregError {
    /// Creates an `HttpStatus` error without a hint.
    pub fn http_status(status: u16, url: impl Into<String>) -> Self {
        OciregError::HttpStatus {
            status,
            url: url.into(),
            hint: None,
        }
    }

    /// Returns true when retrying the operation could succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            OciregError::RateLimit(_) | OciregError::NetworkTransient(_)
        )
    }
}
