//! Client configuration: the per-registry host table and the persisted
//! config file with its atomic save semantics.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{reference::normalize_registry, OciregError, OciregResult};

mod defaults;
mod host;

pub use defaults::*;
pub use host::{Host, TlsMode};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The persisted configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Config file format version.
    pub version: u32,

    /// Host entries keyed by registry name.
    pub hosts: HashMap<String, Host>,

    /// Defaults applied to hosts with no explicit entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_default: Option<Host>,

    /// Upper bound on blob sizes accepted for upload, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_limit: Option<u64>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Config {
    /// Creates an empty config at the current version.
    pub fn new() -> Self {
        Self {
            version: CONFIG_VERSION,
            ..Default::default()
        }
    }

    /// The config file location: the [`CONFIG_ENV`] override when set, else
    /// the platform config directory (`$XDG_CONFIG_HOME` / `%APPDATA%`).
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILENAME))
    }

    /// Loads a config file. A missing file yields an empty config.
    pub async fn load(path: impl AsRef<Path>) -> OciregResult<Self> {
        let path = path.as_ref();
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::new());
            }
            Err(err) => return Err(err.into()),
        };
        let mut config: Config = serde_json::from_slice(&raw)?;
        if config.version > CONFIG_VERSION {
            return Err(OciregError::UnsupportedConfigVersion(format!(
                "config version {} is newer than supported version {}",
                config.version, CONFIG_VERSION
            )));
        }
        if config.version == 0 {
            config.version = CONFIG_VERSION;
        }
        // Host names are authoritative over map keys
        for (name, host) in config.hosts.iter_mut() {
            if host.name.is_empty() {
                host.name = name.clone();
            }
            if host.hostname.is_empty() {
                host.hostname = Host::new(name.clone()).hostname;
            }
        }
        Ok(config)
    }

    /// Loads the config from [`Config::default_path`], or an empty config
    /// when no location resolves.
    pub async fn load_default() -> OciregResult<Self> {
        match Self::default_path() {
            Some(path) => Self::load(path).await,
            None => Ok(Self::new()),
        }
    }

    /// Saves the config: serialize to a temp file in the target directory,
    /// then atomically rename over the destination. The mode of an existing
    /// file is preserved; fresh files are created `0600`.
    pub async fn save(&self, path: impl AsRef<Path>) -> OciregResult<()> {
        let path = path.as_ref().to_path_buf();
        let json = serde_json::to_vec_pretty(self)?;
        tokio::task::spawn_blocking(move || -> OciregResult<()> {
            let parent = path.parent().unwrap_or(Path::new("."));
            std::fs::create_dir_all(parent)?;

            #[cfg(unix)]
            let mode = {
                use std::os::unix::fs::PermissionsExt;
                std::fs::metadata(&path)
                    .map(|m| m.permissions().mode())
                    .unwrap_or(0o600)
            };

            let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
            std::io::Write::write_all(&mut tmp, &json)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode))?;
            }

            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    /// The host entry for a registry name, synthesized from
    /// [`Config::host_default`] and built-in defaults when absent. Docker Hub
    /// aliases resolve to the canonical entry.
    pub fn host(&self, name: &str) -> Host {
        let name = normalize_registry(name);
        if let Some(host) = self.hosts.get(&name) {
            return host.clone();
        }
        let mut host = match &self.host_default {
            Some(default) => {
                let mut host = default.clone();
                host.name = name.clone();
                host.hostname = Host::new(name.clone()).hostname;
                host
            }
            None => Host::new(name.clone()),
        };
        if host.name.is_empty() {
            host.name = name;
        }
        host
    }

    /// Inserts or replaces a host entry.
    pub fn set_host(&mut self, host: Host) {
        self.hosts.insert(host.name.clone(), host);
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::DOCKER_REGISTRY;

    #[tokio::test]
    async fn test_config_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.json")).await.unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert!(config.hosts.is_empty());
    }

    #[tokio::test]
    async fn test_config_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::new();
        let mut host = Host::new("registry.example.com");
        host.user = Some("user".into());
        host.mirrors = vec!["mirror.example.com".into()];
        config.set_host(host);
        config.save(&path).await.unwrap();

        let loaded = Config::load(&path).await.unwrap();
        let host = loaded.host("registry.example.com");
        assert_eq!(host.user.as_deref(), Some("user"));
        assert_eq!(host.mirrors, vec!["mirror.example.com".to_string()]);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[tokio::test]
    async fn test_config_save_preserves_existing_mode() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("config.json");
            std::fs::write(&path, "{}").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).unwrap();

            Config::new().save(&path).await.unwrap();
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o640);
        }
    }

    #[tokio::test]
    async fn test_config_rejects_newer_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"version":99}"#).unwrap();
        let err = Config::load(&path).await.unwrap_err();
        assert!(matches!(err, OciregError::UnsupportedConfigVersion(_)));
    }

    #[test]
    fn test_config_host_lookup_aliases_and_defaults() {
        let mut config = Config::new();
        let mut hub = Host::new("docker.io");
        hub.user = Some("hubuser".into());
        config.set_host(hub);

        // Aliases land on the canonical entry
        let host = config.host("index.docker.io");
        assert_eq!(host.name, DOCKER_REGISTRY);
        assert_eq!(host.user.as_deref(), Some("hubuser"));

        // Unknown hosts get synthesized entries
        let host = config.host("ghcr.io");
        assert_eq!(host.name, "ghcr.io");
        assert_eq!(host.api_host(), "ghcr.io");

        // hostDefault seeds synthesized entries
        let mut default = Host::default();
        default.blob_chunk = 9999;
        config.host_default = Some(default);
        let host = config.host("other.example.com");
        assert_eq!(host.blob_chunk, 9999);
        assert_eq!(host.name, "other.example.com");
    }
}
