//! OCI Content Digest validation and computation.
//!
//! This module provides a wrapper around the `oci_spec::image::Digest` type
//! to integrate with the crate's error handling, plus the sha256 helpers the
//! cache uses to address payloads it re-serializes.

use crate::error::{DepotError, Result};
use oci_spec::image::Digest as OciDigest;
use sha2::{Digest as Sha2Digest, Sha256};
use std::fmt;
use std::str::FromStr;


/// Prefix of every sha256 content digest.
pub const SHA256_PREFIX: &str = "sha256:";

/// Represents a content digest, wrapping the `oci_spec::image::Digest` type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest(OciDigest);

impl Digest {
    /// Returns the algorithm part, e.g. `sha256`.
    pub fn algorithm(&self) -> String {
        self.0.algorithm().to_string()
    }

    /// Returns the hex-encoded part.
    pub fn hex(&self) -> &str {
        self.0.digest()
    }
}

impl FromStr for Digest {
    type Err = DepotError;

    fn from_str(s: &str) -> Result<Self> {
        let oci_digest = OciDigest::from_str(s).map_err(|e| {
            DepotError::validation_with_source(format!("Invalid digest format: {}", e), e)
        })?;
        Ok(Digest(oci_digest))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Returns true when `reference` names content by digest rather than by tag.
pub fn is_digest(reference: &str) -> bool {
    reference.starts_with(SHA256_PREFIX)
}

/// Computes the sha256 digest string of `bytes`.
///
/// # Examples
///
/// ```
/// use libdepot::digest::sha256_of;
///
/// assert_eq!(
///     sha256_of(b""),
///     "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
/// );
/// ```
pub fn sha256_of(bytes: &[u8]) -> String {
    format!("{}{:x}", SHA256_PREFIX, Sha256::digest(bytes))
}
