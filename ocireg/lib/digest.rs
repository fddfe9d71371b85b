use std::{
    fmt::{self, Display},
    str::FromStr,
    sync::LazyLock,
};

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256, Sha512};

use crate::{OciregError, OciregResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Regular expression for a digest hex component, validated per algorithm length below.
static HEX_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9a-f]+$").unwrap());

/// Separator used in the fallback tag form of a digest (`algo-hex`).
const FALLBACK_TAG_SEPARATOR: char = '-';

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Hash algorithms accepted in digests. The set is closed: registries in the
/// wild only serve sha256 and sha512 content addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    /// SHA-256, 64 hex characters.
    Sha256,

    /// SHA-512, 128 hex characters.
    Sha512,
}

/// A content address: an algorithm and the hex-encoded hash value.
///
/// The canonical string form is `algorithm:hex`, e.g.
/// `sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

/// Incremental hasher that produces a [`Digest`]. Used by blob readers and
/// writers so content is verified as it streams.
pub struct Digester {
    inner: DigesterInner,
}

enum DigesterInner {
    Sha256(Sha256),
    Sha512(Sha512),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DigestAlgorithm {
    /// The algorithm name as it appears in a digest string.
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    /// The number of hex characters a digest of this algorithm carries.
    pub fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 64,
            DigestAlgorithm::Sha512 => 128,
        }
    }
}

impl Digest {
    /// Creates a digest from already-validated parts.
    pub fn new(algorithm: DigestAlgorithm, hex: impl Into<String>) -> OciregResult<Self> {
        let hex = hex.into();
        if hex.len() != algorithm.hex_len() || !HEX_REGEX.is_match(&hex) {
            return Err(OciregError::InvalidReference(format!(
                "invalid {} digest hex: {}",
                algorithm.as_str(),
                hex
            )));
        }
        Ok(Self { algorithm, hex })
    }

    /// Computes the digest of a byte slice with the given algorithm.
    pub fn from_bytes(algorithm: DigestAlgorithm, bytes: &[u8]) -> Self {
        let mut digester = Digester::new(algorithm);
        digester.update(bytes);
        digester.finalize()
    }

    /// Computes the sha256 digest of a byte slice.
    pub fn sha256(bytes: &[u8]) -> Self {
        Self::from_bytes(DigestAlgorithm::Sha256, bytes)
    }

    /// The hash algorithm.
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// The hex-encoded hash value.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// The fallback tag form of this digest: `algo-hex`. Registries without a
    /// native referrers endpoint store referrer indexes under this tag.
    pub fn fallback_tag(&self) -> String {
        format!(
            "{}{}{}",
            self.algorithm.as_str(),
            FALLBACK_TAG_SEPARATOR,
            self.hex
        )
    }

    /// Parses a fallback tag (`algo-hex`) back into a digest. Returns `None`
    /// for tags that do not follow the fallback form.
    pub fn from_fallback_tag(tag: &str) -> Option<Self> {
        let (algo, hex) = tag.split_once(FALLBACK_TAG_SEPARATOR)?;
        let algorithm = match algo {
            "sha256" => DigestAlgorithm::Sha256,
            "sha512" => DigestAlgorithm::Sha512,
            _ => return None,
        };
        Digest::new(algorithm, hex).ok()
    }
}

impl Digester {
    /// Creates a new digester for the given algorithm.
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        let inner = match algorithm {
            DigestAlgorithm::Sha256 => DigesterInner::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => DigesterInner::Sha512(Sha512::new()),
        };
        Self { inner }
    }

    /// Feeds bytes into the hash state.
    pub fn update(&mut self, bytes: &[u8]) {
        match &mut self.inner {
            DigesterInner::Sha256(h) => h.update(bytes),
            DigesterInner::Sha512(h) => h.update(bytes),
        }
    }

    /// Consumes the digester and returns the final digest.
    pub fn finalize(self) -> Digest {
        match self.inner {
            DigesterInner::Sha256(h) => Digest {
                algorithm: DigestAlgorithm::Sha256,
                hex: hex::encode(h.finalize()),
            },
            DigesterInner::Sha512(h) => Digest {
                algorithm: DigestAlgorithm::Sha512,
                hex: hex::encode(h.finalize()),
            },
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for DigestAlgorithm {
    type Err = OciregError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            other => Err(OciregError::InvalidReference(format!(
                "unsupported digest algorithm: {}",
                other
            ))),
        }
    }
}

impl FromStr for Digest {
    type Err = OciregError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, hex) = s.split_once(':').ok_or_else(|| {
            OciregError::InvalidReference(format!("digest must be in format 'algorithm:hex': {}", s))
        })?;
        Digest::new(algo.parse()?, hex)
    }
}

impl Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_digest_parse_valid() {
        let digest: Digest = format!("sha256:{}", EMPTY_SHA256).parse().unwrap();
        assert_eq!(digest.algorithm(), DigestAlgorithm::Sha256);
        assert_eq!(digest.hex(), EMPTY_SHA256);
        assert_eq!(digest.to_string(), format!("sha256:{}", EMPTY_SHA256));
    }

    #[test]
    fn test_digest_parse_invalid() {
        // Wrong separator
        assert!("sha256-abc".parse::<Digest>().is_err());
        // Unknown algorithm
        assert!(format!("blake3:{}", EMPTY_SHA256).parse::<Digest>().is_err());
        // Wrong hex length for sha256
        assert!("sha256:abcdef".parse::<Digest>().is_err());
        // Uppercase hex is rejected
        assert!(format!("sha256:{}", EMPTY_SHA256.to_uppercase())
            .parse::<Digest>()
            .is_err());
        // sha512 requires 128 hex chars
        assert!(format!("sha512:{}", EMPTY_SHA256).parse::<Digest>().is_err());
    }

    #[test]
    fn test_digest_from_bytes_matches_known_value() {
        let digest = Digest::sha256(b"");
        assert_eq!(digest.hex(), EMPTY_SHA256);

        let mut digester = Digester::new(DigestAlgorithm::Sha256);
        digester.update(b"he");
        digester.update(b"llo");
        assert_eq!(digester.finalize(), Digest::sha256(b"hello"));
    }

    #[test]
    fn test_digest_fallback_tag_roundtrip() {
        let digest = Digest::sha256(b"subject");
        let tag = digest.fallback_tag();
        assert!(tag.starts_with("sha256-"));
        assert_eq!(Digest::from_fallback_tag(&tag), Some(digest));

        assert_eq!(Digest::from_fallback_tag("latest"), None);
        assert_eq!(Digest::from_fallback_tag("sha256-zzz"), None);
    }

    #[test]
    fn test_digest_serde_as_string() {
        let digest = Digest::sha256(b"x");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", digest));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
