//! Content digests
//!
//! A digest is the lowercase hex SHA-256 of a byte sequence. It is the only
//! key used by the cache and by storage backends.

use crate::error::{IsolateError, IsolateResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of a hex-encoded SHA-256 digest
pub const DIGEST_HEX_LEN: usize = 64;

/// Hex-encoded SHA-256 content hash
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse and validate a digest string
    pub fn parse(s: &str) -> IsolateResult<Self> {
        let valid = s.len() == DIGEST_HEX_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(IsolateError::InvalidDigest(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Hash `content` and return its digest
    pub fn of(content: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(content))
    }

    /// Finish an incremental hash started by a streaming reader
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(hex::encode(hasher.finalize()))
    }

    /// The hex string form, also used as the cache file name
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl FromStr for Digest {
    type Err = IsolateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = IsolateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_sha256() {
        let digest = Digest::of(b"cat");
        assert_eq!(
            digest.as_str(),
            "77af778b51abd4a3c51c5ddd97204a9c3ae614ebccb75a606c3b6865aed6744e"
        );
    }

    #[test]
    fn identical_bytes_identical_digest() {
        assert_eq!(Digest::of(b"same"), Digest::of(b"same"));
        assert_ne!(Digest::of(b"same"), Digest::of(b"other"));
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut hasher = Sha256::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(Digest::from_hasher(hasher), Digest::of(b"hello world"));
    }

    #[test]
    fn rejects_malformed() {
        assert!(Digest::parse("").is_err());
        assert!(Digest::parse("abc").is_err());
        let upper = Digest::of(b"x").as_str().to_uppercase();
        assert!(Digest::parse(&upper).is_err());
        let traversal = format!("../{}", &Digest::of(b"x").as_str()[3..]);
        assert!(Digest::parse(&traversal).is_err());
    }

    #[test]
    fn serde_validates() {
        let digest = Digest::of(b"json");
        let encoded = serde_json::to_string(&digest).unwrap();
        let decoded: Digest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, digest);
        assert!(serde_json::from_str::<Digest>("\"nothex\"").is_err());
    }
}
