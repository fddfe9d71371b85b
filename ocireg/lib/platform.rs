use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{OciregError, OciregResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The platform a manifest targets, as carried in index descriptors.
///
/// Serialized field names follow the OCI image spec (`os.version`,
/// `os.features`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system, e.g. `linux`, `windows`.
    pub os: String,

    /// CPU architecture, e.g. `amd64`, `arm64`.
    pub architecture: String,

    /// Architecture variant, e.g. `v7` for arm.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,

    /// OS version, significant mainly on Windows.
    #[serde(rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    /// Required OS features.
    #[serde(rename = "os.features", skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Platform {
    /// Creates a platform from os and architecture.
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            ..Default::default()
        }
    }

    /// The platform of the running host, using OCI architecture names.
    pub fn local() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        };
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        Self::new(os, architecture)
    }

    /// True when `self` (an index entry) satisfies `filter`.
    ///
    /// OS and architecture must match exactly; empty filter fields match
    /// anything. Variant and OS version are compared only when the filter
    /// specifies them.
    pub fn matches(&self, filter: &Platform) -> bool {
        if !filter.os.is_empty() && self.os != filter.os {
            return false;
        }
        if !filter.architecture.is_empty() && self.architecture != filter.architecture {
            return false;
        }
        if let Some(variant) = &filter.variant {
            if self.variant.as_ref() != Some(variant) {
                return false;
            }
        }
        if let Some(os_version) = &filter.os_version {
            if self.os_version.as_ref() != Some(os_version) {
                return false;
            }
        }
        true
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for Platform {
    type Err = OciregError;

    /// Parses `os/arch[/variant]`. The literal `local` resolves to the host
    /// platform at runtime.
    fn from_str(s: &str) -> OciregResult<Self> {
        if s == "local" {
            return Ok(Self::local());
        }
        let mut parts = s.split('/');
        let os = parts.next().unwrap_or_default();
        let architecture = parts.next().unwrap_or_default();
        let variant = parts.next().map(str::to_string);
        if os.is_empty() || parts.next().is_some() {
            return Err(OciregError::InvalidReference(format!(
                "invalid platform: {}",
                s
            )));
        }
        Ok(Self {
            os: os.to_string(),
            architecture: architecture.to_string(),
            variant,
            ..Default::default()
        })
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parse_and_display() {
        let platform: Platform = "linux/arm64".parse().unwrap();
        assert_eq!(platform.os, "linux");
        assert_eq!(platform.architecture, "arm64");
        assert_eq!(platform.to_string(), "linux/arm64");

        let platform: Platform = "linux/arm/v7".parse().unwrap();
        assert_eq!(platform.variant.as_deref(), Some("v7"));
        assert_eq!(platform.to_string(), "linux/arm/v7");

        assert!("linux/arm/v7/extra".parse::<Platform>().is_err());
        assert!("".parse::<Platform>().is_err());
    }

    #[test]
    fn test_platform_local_resolves() {
        let local: Platform = "local".parse().unwrap();
        assert!(!local.os.is_empty());
        assert!(!local.architecture.is_empty());
        // OCI names, not Rust target names
        assert_ne!(local.architecture, "x86_64");
        assert_ne!(local.architecture, "aarch64");
    }

    #[test]
    fn test_platform_match_rules() {
        let entry: Platform = "linux/arm/v7".parse().unwrap();

        assert!(entry.matches(&"linux/arm".parse().unwrap()));
        assert!(entry.matches(&"linux/arm/v7".parse().unwrap()));
        assert!(!entry.matches(&"linux/arm/v6".parse().unwrap()));
        assert!(!entry.matches(&"linux/amd64".parse().unwrap()));
        assert!(!entry.matches(&"windows/arm".parse().unwrap()));

        // Empty filter fields match anything
        let any = Platform::default();
        assert!(entry.matches(&any));
        let os_only = Platform::new("linux", "");
        assert!(entry.matches(&os_only));

        // Filter with os.version requires equality
        let mut versioned = Platform::new("linux", "arm");
        versioned.os_version = Some("5.0".into());
        assert!(!entry.matches(&versioned));
    }

    #[test]
    fn test_platform_serde_field_names() {
        let mut platform = Platform::new("windows", "amd64");
        platform.os_version = Some("10.0.17763.1817".into());
        let json = serde_json::to_string(&platform).unwrap();
        assert!(json.contains("\"os.version\""));
        let back: Platform = serde_json::from_str(&json).unwrap();
        assert_eq!(back, platform);
    }
}
