use std::{
    collections::HashMap,
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{
    reference::{normalize_registry, DOCKER_REGISTRY, DOCKER_REGISTRY_DNS},
    Credential, OciregError, OciregResult,
};

use super::defaults::{DEFAULT_BLOB_CHUNK, DEFAULT_DELAY_MAX_MS, DEFAULT_DELAY_MIN_MS, DEFAULT_RETRY_LIMIT};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How the client connects to a registry host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// HTTPS with certificate verification.
    #[default]
    Enabled,

    /// HTTPS without certificate verification.
    Insecure,

    /// Plain HTTP.
    Disabled,
}

/// Per-registry configuration: connection settings, credentials, mirrors, and
/// upload tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Host {
    /// The registry name references use.
    pub name: String,

    /// The hostname requests actually go to. Differs from `name` for Docker
    /// Hub and for mirrors.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    /// TLS mode for this host.
    pub tls: TlsMode,

    /// PEM of a CA certificate to trust for this host.
    #[serde(rename = "regcert", skip_serializing_if = "Option::is_none")]
    pub reg_cert: Option<String>,

    /// PEM of a client certificate for mTLS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<String>,

    /// PEM of the client key for mTLS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,

    /// Username for authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Password or personal access token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,

    /// Pre-issued session token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Name of an external credential helper.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cred_helper: Option<String>,

    /// Path inserted between the host and the repository in API URLs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,

    /// Registries to try before this one, ordered by [`Host::priority`].
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mirrors: Vec<String>,

    /// Mirror ordering weight; higher is tried first.
    pub priority: u32,

    /// Chunk size for chunked blob uploads, in bytes.
    pub blob_chunk: u64,

    /// Maximum blob size accepted for upload. `None` means unlimited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_max: Option<u64>,

    /// Number of transient-error retries per request.
    pub retry_limit: u32,

    /// Minimum backoff delay between retries, in milliseconds.
    pub delay_min_ms: u64,

    /// Maximum backoff delay between retries, in milliseconds.
    pub delay_max_ms: u64,

    /// Per-request timeout in seconds. `None` means no host-level timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Free-form API toggles (e.g. extra legacy media types).
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub api_opts: HashMap<String, String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Host {
    /// Creates a host entry with defaults for a registry name. Docker Hub
    /// aliases resolve to the canonical name and its real API hostname.
    pub fn new(name: impl Into<String>) -> Self {
        let name = normalize_registry(&name.into());
        let hostname = if name == DOCKER_REGISTRY {
            DOCKER_REGISTRY_DNS.to_string()
        } else {
            name.clone()
        };
        Self {
            name,
            hostname,
            ..Default::default()
        }
    }

    /// The hostname requests are sent to.
    pub fn api_host(&self) -> &str {
        if self.hostname.is_empty() {
            &self.name
        } else {
            &self.hostname
        }
    }

    /// The URL scheme for this host per its TLS mode.
    pub fn scheme(&self) -> &'static str {
        match self.tls {
            TlsMode::Disabled => "http",
            _ => "https",
        }
    }

    /// The root URL of the Distribution API on this host.
    pub fn api_root(&self) -> String {
        let prefix = self
            .path_prefix
            .as_deref()
            .map(|p| format!("/{}", p.trim_matches('/')))
            .unwrap_or_default();
        format!("{}://{}{}", self.scheme(), self.api_host(), prefix)
    }

    /// The credential configured for this host, when any.
    pub fn credential(&self) -> Option<Credential> {
        if self.user.is_none() && self.pass.is_none() && self.token.is_none() {
            return None;
        }
        Some(Credential {
            user: self.user.clone(),
            password: self.pass.clone(),
            token: self.token.clone(),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for Host {
    fn default() -> Self {
        Self {
            name: String::new(),
            hostname: String::new(),
            tls: TlsMode::Enabled,
            reg_cert: None,
            client_cert: None,
            client_key: None,
            user: None,
            pass: None,
            token: None,
            cred_helper: None,
            path_prefix: None,
            mirrors: Vec::new(),
            priority: 0,
            blob_chunk: DEFAULT_BLOB_CHUNK,
            blob_max: None,
            retry_limit: DEFAULT_RETRY_LIMIT,
            delay_min_ms: DEFAULT_DELAY_MIN_MS,
            delay_max_ms: DEFAULT_DELAY_MAX_MS,
            timeout_secs: None,
            api_opts: HashMap::new(),
        }
    }
}

impl FromStr for TlsMode {
    type Err = OciregError;

    fn from_str(s: &str) -> OciregResult<Self> {
        match s {
            "enabled" => Ok(TlsMode::Enabled),
            "insecure" => Ok(TlsMode::Insecure),
            "disabled" => Ok(TlsMode::Disabled),
            other => Err(OciregError::UnsupportedConfigVersion(format!(
                "unknown tls mode: {}",
                other
            ))),
        }
    }
}

impl Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TlsMode::Enabled => "enabled",
            TlsMode::Insecure => "insecure",
            TlsMode::Disabled => "disabled",
        };
        write!(f, "{}", s)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
