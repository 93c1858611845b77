//! Request fingerprints.
//!
//! A fingerprint is the SHA-256 of the canonical JSON encoding of a
//! normalized request, prefixed with a domain tag. It names the cached
//! audio file and keys the in-flight job registry.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::request::{OptionValue, SynthesisRequest};
use super::Result;

/// Domain separation tag; bump when the canonical encoding changes.
const FINGERPRINT_TAG: &[u8] = b"vocu-tts-request-v1\n";

/// Length of the hex-encoded digest.
pub const FINGERPRINT_HEX_LEN: usize = 64;

/// Deterministic cache key for a synthesis request.
///
/// Deserialization goes through [`Fingerprint::from_hex`], so a value read
/// back from disk is always 64 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

#[derive(Serialize)]
struct CanonicalRequest<'a> {
    options: &'a BTreeMap<String, OptionValue>,
    text: &'a str,
    voice_id: &'a str,
}

impl Fingerprint {
    /// Validate, normalize and fingerprint a request.
    pub fn of(request: &SynthesisRequest) -> Result<Self> {
        Ok(request.normalize()?.fingerprint().clone())
    }

    /// Hash already-normalized request parts.
    pub(crate) fn from_canonical(
        text: &str,
        voice_id: &str,
        options: &BTreeMap<String, OptionValue>,
    ) -> Self {
        let canonical = CanonicalRequest {
            options,
            text,
            voice_id,
        };
        // Serializing borrowed strings and a BTreeMap of scalars cannot fail.
        let encoded = serde_json::to_vec(&canonical).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_TAG);
        hasher.update(&encoded);
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a fingerprint from its hex form (e.g. a cache file stem).
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() == FINGERPRINT_HEX_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        Self::from_hex(&s).ok_or_else(|| format!("invalid fingerprint: {s:?}"))
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
