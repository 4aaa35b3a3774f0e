//! Single-use SSH credentials for remote operations.
//!
//! Each remote operation gets a fresh Ed25519 keypair. The private half is
//! written with owner-only permissions into a scratch directory that is
//! removed when the credential is dropped, including on error paths; the
//! public half is pushed through the provider's out-of-band key-injection
//! channel by the caller. No key material outlives the single invocation.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;

use camino::{Utf8Path, Utf8PathBuf};
use rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use tempfile::TempDir;
use thiserror::Error;
use uuid::Uuid;

const PRIVATE_KEY_FILE: &str = "id_ed25519";
const PRIVATE_KEY_MODE: u32 = 0o600;

/// Errors raised while issuing an ephemeral credential.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Raised when keypair generation or encoding fails.
    #[error("failed to generate ephemeral keypair: {0}")]
    Generate(String),
    /// Raised when the private key cannot be written to the scratch
    /// directory.
    #[error("failed to write ephemeral key to {path}: {message}")]
    Io {
        /// Path that could not be written.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the scratch directory path is not valid UTF-8.
    #[error("scratch directory path is not valid UTF-8")]
    NonUtf8Path,
}

/// A single-use keypair whose private half lives only as long as this value.
///
/// Dropping the credential removes the scratch directory and the key file
/// with it; callers must not copy the private key elsewhere.
#[derive(Debug)]
pub struct EphemeralKey {
    // Held only so the scratch directory (and the key file inside it) is
    // removed when the credential is dropped.
    #[expect(dead_code, reason = "retained for its Drop behaviour")]
    scratch: TempDir,
    private_key_path: Utf8PathBuf,
    public_key: String,
}

impl EphemeralKey {
    /// Generates a fresh Ed25519 keypair and writes the private half into a
    /// scratch directory with owner-only permissions.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] when generation, encoding, or the restricted
    /// file write fails.
    pub fn generate() -> Result<Self, KeyError> {
        let mut private_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|err| KeyError::Generate(err.to_string()))?;
        private_key.set_comment(format!("ostriv-{}", Uuid::new_v4().simple()));

        let public_key = private_key
            .public_key()
            .to_openssh()
            .map_err(|err| KeyError::Generate(err.to_string()))?;
        let encoded = private_key
            .to_openssh(LineEnding::LF)
            .map_err(|err| KeyError::Generate(err.to_string()))?;

        let scratch = TempDir::new().map_err(|err| KeyError::Io {
            path: Utf8PathBuf::from("<tempdir>"),
            message: err.to_string(),
        })?;
        let scratch_path =
            Utf8Path::from_path(scratch.path()).ok_or(KeyError::NonUtf8Path)?;
        let private_key_path = scratch_path.join(PRIVATE_KEY_FILE);

        write_restricted(&private_key_path, encoded.as_bytes())?;

        Ok(Self {
            scratch,
            private_key_path,
            public_key,
        })
    }

    /// Path of the private key file, valid until this value is dropped.
    #[must_use]
    pub fn private_key_path(&self) -> &Utf8Path {
        &self.private_key_path
    }

    /// OpenSSH-encoded public half, pushed to the target host out-of-band.
    #[must_use]
    pub fn public_key(&self) -> &str {
        &self.public_key
    }
}

fn write_restricted(path: &Utf8Path, contents: &[u8]) -> Result<(), KeyError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(PRIVATE_KEY_MODE)
        .open(path)
        .map_err(|err| KeyError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
    file.write_all(contents).map_err(|err| KeyError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}
