//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The newest config file version this library understands.
pub const CONFIG_VERSION: u32 = 1;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "OCIREG_CONFIG";

/// Directory name under the platform config root.
pub const CONFIG_DIR: &str = "ocireg";

/// Config file name.
pub const CONFIG_FILENAME: &str = "config.json";

/// Default chunk size for chunked blob uploads, in bytes.
pub const DEFAULT_BLOB_CHUNK: u64 = 1024 * 1024;

/// Default number of transient-error retries per request.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Default minimum backoff delay between retries, in milliseconds.
pub const DEFAULT_DELAY_MIN_MS: u64 = 1_000;

/// Default maximum backoff delay between retries, in milliseconds.
pub const DEFAULT_DELAY_MAX_MS: u64 = 30_000;

/// Default number of blobs copied concurrently within one manifest.
pub const DEFAULT_BLOB_CONCURRENCY: usize = 4;

/// Default time-to-live of manifest HEAD cache entries, in seconds.
pub const DEFAULT_MANIFEST_CACHE_TTL_SECS: u64 = 300;

/// Default capacity of the manifest HEAD cache.
pub const DEFAULT_MANIFEST_CACHE_SIZE: usize = 500;

/// The `User-Agent` sent on every request.
pub const DEFAULT_USER_AGENT: &str = concat!("ocireg/", env!("CARGO_PKG_VERSION"));
