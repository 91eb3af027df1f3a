//! Digests and portable object identities
//!
//! Objects and action keys are addressed by BLAKE3 digests. [`CasId`] is the
//! externalized form used at system boundaries: the raw digest plus the hash
//! scheme tag, printed as `blake3:<hex>`.

use crate::errors::{CacheError, RecoveryHint, Result};
use std::fmt;

/// Width of a digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Name of the hash scheme, embedded in table headers and textual ids.
pub const HASH_SCHEME: &str = "blake3";

/// A raw content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Hash a byte buffer.
    pub fn compute(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    pub const fn from_array(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a digest from a raw slice, rejecting bad lengths.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; DIGEST_LEN] = bytes.try_into().map_err(|_| CacheError::InvalidId {
            text: hex::encode(bytes),
            reason: format!("expected {DIGEST_LEN} digest bytes, got {}", bytes.len()),
            recovery_hint: RecoveryHint::NoRecovery,
        })?;
        Ok(Self(array))
    }

    pub const fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental digest computation.
pub struct DigestHasher(blake3::Hasher);

impl DigestHasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    pub fn finalize(&self) -> Digest {
        Digest(*self.0.finalize().as_bytes())
    }
}

impl Default for DigestHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Portable object identity: a digest tagged with its hash scheme.
///
/// Parsed case-insensitively, printed lower-case.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CasId {
    digest: Digest,
}

impl CasId {
    pub const fn new(digest: Digest) -> Self {
        Self { digest }
    }

    pub const fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Parse the `scheme:<hex>` textual form.
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = |reason: String| CacheError::InvalidId {
            text: text.to_string(),
            reason,
            recovery_hint: RecoveryHint::NoRecovery,
        };

        let (scheme, hex_digest) = text
            .split_once(':')
            .ok_or_else(|| invalid("missing hash scheme prefix".to_string()))?;
        if !scheme.eq_ignore_ascii_case(HASH_SCHEME) {
            return Err(invalid(format!("unknown hash scheme '{scheme}'")));
        }
        let bytes = hex::decode(hex_digest.to_ascii_lowercase())
            .map_err(|e| invalid(format!("bad hex digest: {e}")))?;
        Ok(Self {
            digest: Digest::from_bytes(&bytes)?,
        })
    }
}

impl fmt::Display for CasId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{HASH_SCHEME}:{}", self.digest.to_hex())
    }
}

impl fmt::Debug for CasId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CasId({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable() {
        assert_eq!(Digest::compute(b"1"), Digest::compute(b"1"));
        assert_ne!(Digest::compute(b"1"), Digest::compute(b"2"));
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut hasher = DigestHasher::new();
        hasher.update(b"hello ").update(b"world");
        assert_eq!(hasher.finalize(), Digest::compute(b"hello world"));
    }

    #[test]
    fn test_id_round_trip() {
        let id = CasId::new(Digest::compute(b"round trip"));
        let printed = id.to_string();
        assert!(printed.starts_with("blake3:"));
        assert_eq!(CasId::parse(&printed).unwrap(), id);
    }

    #[test]
    fn test_id_parse_is_case_insensitive() {
        let id = CasId::new(Digest::compute(b"case"));
        let upper = id.to_string().to_ascii_uppercase();
        assert_eq!(CasId::parse(&upper).unwrap(), id);
    }

    #[test]
    fn test_id_parse_rejects_garbage() {
        assert!(CasId::parse("no-scheme-separator").is_err());
        assert!(CasId::parse("sha256:00").is_err());
        assert!(CasId::parse("blake3:zz").is_err());
        assert!(CasId::parse("blake3:00ff").is_err());
    }
}
