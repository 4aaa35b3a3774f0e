//! Bootstrap script integrity and completion status.
//!
//! The bootstrap script runs with elevated privileges on first boot, so its
//! bytes are pinned by a SHA-256 digest checked immediately before launch.
//! The script itself reports completion by writing a status label onto the
//! instance, which the orchestrator polls after launch.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::provider::{BOOTSTRAP_TAG, tag_value};

/// Errors raised while verifying the bootstrap script.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum BootstrapError {
    /// Raised when the script's digest does not match the pinned digest.
    ///
    /// The script may have been corrupted in transit or deliberately
    /// modified; either way it must not run with elevated privileges.
    #[error(
        "bootstrap script failed integrity check: expected sha256 {expected} \
         but computed {actual} over {script_len} bytes; the script was \
         corrupted or modified and will not be launched"
    )]
    DigestMismatch {
        /// Digest the configuration pins, lowercase hex.
        expected: String,
        /// Digest computed over the script bytes, lowercase hex.
        actual: String,
        /// Length of the script in bytes.
        script_len: usize,
    },
    /// Raised when the pinned digest is not a 64-character hex string.
    #[error("pinned bootstrap digest '{digest}' is not a sha256 hex string")]
    MalformedDigest {
        /// The offending configured value.
        digest: String,
    },
}

const SHA256_HEX_LEN: usize = 64;

/// Checks the script's SHA-256 digest against the pinned value.
///
/// Comparison is case-insensitive on the configured digest.
///
/// # Errors
///
/// Returns [`BootstrapError::MalformedDigest`] when `expected_hex` is not a
/// valid digest and [`BootstrapError::DigestMismatch`] when the script's
/// bytes do not hash to it.
pub fn verify_script(script: &str, expected_hex: &str) -> Result<(), BootstrapError> {
    let expected = expected_hex.to_ascii_lowercase();
    if expected.len() != SHA256_HEX_LEN || !expected.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(BootstrapError::MalformedDigest {
            digest: expected_hex.to_owned(),
        });
    }

    let actual = hex::encode(Sha256::digest(script.as_bytes()));
    if actual != expected {
        return Err(BootstrapError::DigestMismatch {
            expected,
            actual,
            script_len: script.len(),
        });
    }
    Ok(())
}

/// Completion state the bootstrap script reports through instance labels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BootstrapStatus {
    /// The script has not finished yet.
    Pending,
    /// The script finished successfully.
    Complete,
    /// The script reported failure.
    Failed,
}

impl BootstrapStatus {
    /// Reads the status from an instance's labels.
    ///
    /// A missing or unrecognized label reads as [`BootstrapStatus::Pending`];
    /// the instance simply has not reported yet.
    #[must_use]
    pub fn from_tags(tags: &[String]) -> Self {
        match tag_value(tags, BOOTSTRAP_TAG) {
            Some("complete") => Self::Complete,
            Some("failed") => Self::Failed,
            _ => Self::Pending,
        }
    }
}
