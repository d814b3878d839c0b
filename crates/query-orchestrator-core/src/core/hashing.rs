// crates/query-orchestrator-core/src/core/hashing.rs
// ============================================================================
// Module: Query Orchestrator Canonical Hashing
// Description: RFC 8785 JSON canonicalization, content hashing, and versions.
// Purpose: Provide deterministic digests for queue keys, cache keys, and tables.
// Dependencies: serde, serde_jcs, sha2
// ============================================================================

//! ## Overview
//! All JSON-able keys are canonicalized with RFC 8785 (JCS) before hashing so
//! every cooperating process derives the same digest for the same logical
//! key. Pre-aggregation versions are a short, fixed-width rendering of a
//! SHA-256 digest suitable for embedding in table names.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Alphabet used by [`version`]. Each character encodes five bits.
pub const VERSION_CHARSET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz012345";

/// Number of characters produced by [`version`].
pub const VERSION_LENGTH: usize = 8;

/// Number of digest bytes folded into a version (8 chars x 5 bits).
const VERSION_DIGEST_BYTES: usize = 5;

// ============================================================================
// SECTION: Hash Algorithm
// ============================================================================

/// Supported hash algorithms for orchestrator keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// SHA-256 hashing.
    Sha256,
}

/// Default hash algorithm for orchestrator keys.
pub const DEFAULT_HASH_ALGORITHM: HashAlgorithm = HashAlgorithm::Sha256;

// ============================================================================
// SECTION: Hash Digest
// ============================================================================

/// Deterministic content hash representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashDigest {
    /// Hash algorithm identifier.
    pub algorithm: HashAlgorithm,
    /// Lowercase hex-encoded digest bytes.
    pub value: String,
}

impl HashDigest {
    /// Creates a new digest from raw bytes.
    #[must_use]
    pub fn new(algorithm: HashAlgorithm, bytes: &[u8]) -> Self {
        Self {
            algorithm,
            value: hex_encode(bytes),
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised when computing canonical hashes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HashError {
    /// JSON canonicalization failed.
    #[error("failed to canonicalize json: {0}")]
    Canonicalization(String),
}

// ============================================================================
// SECTION: Hashing Helpers
// ============================================================================

/// Returns canonical JSON bytes for a serializable value using RFC 8785.
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when serialization fails.
pub fn canonical_json_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, HashError> {
    serde_jcs::to_vec(value).map_err(|err| HashError::Canonicalization(err.to_string()))
}

/// Hashes canonical JSON using the provided algorithm.
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when serialization fails.
pub fn hash_canonical_json<T: Serialize + ?Sized>(
    algorithm: HashAlgorithm,
    value: &T,
) -> Result<HashDigest, HashError> {
    let bytes = canonical_json_bytes(value)?;
    Ok(hash_bytes(algorithm, &bytes))
}

/// Hashes raw bytes using the provided algorithm.
#[must_use]
pub fn hash_bytes(algorithm: HashAlgorithm, bytes: &[u8]) -> HashDigest {
    match algorithm {
        HashAlgorithm::Sha256 => {
            HashDigest::new(HashAlgorithm::Sha256, &Sha256::digest(bytes))
        }
    }
}

// ============================================================================
// SECTION: Versions
// ============================================================================

/// Returns the 8-character version string for a JSON-able cache key.
///
/// The first five digest bytes are folded little-endian into an unsigned
/// accumulator and emitted five bits at a time, least significant first.
/// Output length is fixed regardless of leading zero bits.
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when serialization fails.
pub fn version<T: Serialize + ?Sized>(value: &T) -> Result<String, HashError> {
    let bytes = canonical_json_bytes(value)?;
    let digest = Sha256::digest(&bytes);
    let mut residue: u64 = 0;
    for (index, byte) in digest.iter().take(VERSION_DIGEST_BYTES).enumerate() {
        residue |= u64::from(*byte) << (8 * index);
    }
    let mut out = String::with_capacity(VERSION_LENGTH);
    for _ in 0 .. VERSION_LENGTH {
        let index = usize::try_from(residue & 0x1f).unwrap_or_default();
        out.push(char::from(VERSION_CHARSET[index]));
        residue >>= 5;
    }
    Ok(out)
}

// ============================================================================
// SECTION: Hex Encoding
// ============================================================================

/// Encodes bytes as a lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}
