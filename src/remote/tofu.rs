//! Trust-on-first-use host verification.
//!
//! A small persisted store maps each VM name to the SHA-256 fingerprint of
//! its host key, recorded on first successful contact. Before any
//! write-capable remote operation, the host key is probed out-of-band with a
//! bounded `ssh-keyscan` and compared against the record. A mismatch refuses
//! the operation outright: it is a distinct, high-priority error and is
//! never downgraded to a connection failure.

use std::ffi::OsString;
use std::io;
use std::net::IpAddr;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::toml;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::remote::RemoteConfig;
use crate::runner::CommandRunner;

const HOSTS_SECTION: &str = "hosts";
const TRUST_STORE_ENV_VAR: &str = "OSTRIV_TRUST_STORE";
const TRUST_STORE_FILE: &str = "known_hosts.toml";
const TRUST_STORE_TMP_FILE: &str = ".known_hosts.toml.tmp";

/// Errors raised while reading or updating the trust store.
#[derive(Debug, Error)]
pub enum TrustStoreError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when parsing existing TOML content fails.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when existing TOML has an unexpected structure.
    #[error("invalid trust store in {path}: {message}")]
    InvalidStructure {
        /// Path that had invalid content.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when no home directory is available to derive the default
    /// store location.
    #[error("cannot locate trust store: HOME is not set and {TRUST_STORE_ENV_VAR} is empty")]
    NoHome,
}

/// Persisted mapping from VM name to host-key fingerprint.
///
/// Updates are atomic per VM name: the whole file is rewritten to a sibling
/// temporary file and renamed into place.
#[derive(Clone, Debug)]
pub struct TrustStore {
    path: Utf8PathBuf,
}

impl TrustStore {
    /// Opens a trust store at an explicit path. The file may not exist yet.
    #[must_use]
    pub const fn open(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    /// Computes the default store location: `$OSTRIV_TRUST_STORE` when set,
    /// otherwise `$HOME/.config/ostriv/known_hosts.toml`.
    ///
    /// # Errors
    ///
    /// Returns [`TrustStoreError::NoHome`] when neither variable is set.
    pub fn default_location() -> Result<Utf8PathBuf, TrustStoreError> {
        if let Ok(explicit) = std::env::var(TRUST_STORE_ENV_VAR)
            && !explicit.trim().is_empty()
        {
            return Ok(Utf8PathBuf::from(explicit));
        }
        let home = std::env::var("HOME").map_err(|_| TrustStoreError::NoHome)?;
        if home.trim().is_empty() {
            return Err(TrustStoreError::NoHome);
        }
        Ok(Utf8PathBuf::from(home)
            .join(".config")
            .join("ostriv")
            .join(TRUST_STORE_FILE))
    }

    /// Returns the stored fingerprint for a VM name, if any.
    ///
    /// # Errors
    ///
    /// Returns [`TrustStoreError`] when the file cannot be read or parsed.
    pub fn lookup(&self, vm_name: &str) -> Result<Option<String>, TrustStoreError> {
        let Some(contents) = self.read_if_exists()? else {
            return Ok(None);
        };
        let value = parse_toml(&self.path, &contents)?;
        let hosts = hosts_table(&self.path, &value)?;
        hosts.get(vm_name).map_or(Ok(None), |raw| {
            raw.as_str().map(|fp| Some(fp.to_owned())).ok_or_else(|| {
                TrustStoreError::InvalidStructure {
                    path: self.path.clone(),
                    message: format!("{HOSTS_SECTION}.{vm_name} must be a string"),
                }
            })
        })
    }

    /// Records (or replaces) the fingerprint for a VM name.
    ///
    /// # Errors
    ///
    /// Returns [`TrustStoreError`] when the file cannot be updated.
    pub fn record(&self, vm_name: &str, fingerprint: &str) -> Result<(), TrustStoreError> {
        self.update(|hosts| {
            hosts.insert(
                vm_name.to_owned(),
                toml::Value::String(fingerprint.to_owned()),
            );
        })
    }

    /// Removes the fingerprint for a VM name. Returns `true` when a record
    /// was present. Removing an absent record is not an error, so the call
    /// is safe to repeat.
    ///
    /// # Errors
    ///
    /// Returns [`TrustStoreError`] when the file cannot be updated.
    pub fn forget(&self, vm_name: &str) -> Result<bool, TrustStoreError> {
        let mut removed = false;
        self.update(|hosts| {
            removed = hosts.remove(vm_name).is_some();
        })?;
        Ok(removed)
    }

    fn update(
        &self,
        mutate: impl FnOnce(&mut toml::value::Table),
    ) -> Result<(), TrustStoreError> {
        let contents = self.read_if_exists()?.unwrap_or_default();
        let mut value = parse_toml(&self.path, &contents)?;

        let table =
            value
                .as_table_mut()
                .ok_or_else(|| TrustStoreError::InvalidStructure {
                    path: self.path.clone(),
                    message: String::from("trust store root is not a table"),
                })?;
        let section = table
            .entry(String::from(HOSTS_SECTION))
            .or_insert_with(|| toml::Value::Table(toml::value::Table::new()));
        let hosts =
            section
                .as_table_mut()
                .ok_or_else(|| TrustStoreError::InvalidStructure {
                    path: self.path.clone(),
                    message: format!("[{HOSTS_SECTION}] must be a table"),
                })?;

        mutate(hosts);
        self.write_atomically(&value)
    }

    fn read_if_exists(&self) -> Result<Option<String>, TrustStoreError> {
        let (parent, file_name) = split_path(&self.path)?;
        let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(TrustStoreError::Io {
                    path: parent.to_path_buf(),
                    message: err.to_string(),
                });
            }
        };
        match dir.read_to_string(file_name) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(TrustStoreError::Io {
                path: self.path.clone(),
                message: err.to_string(),
            }),
        }
    }

    fn write_atomically(&self, value: &toml::Value) -> Result<(), TrustStoreError> {
        let (parent, file_name) = split_path(&self.path)?;
        Dir::create_ambient_dir_all(parent, ambient_authority()).map_err(|err| {
            TrustStoreError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            }
        })?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| {
            TrustStoreError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            }
        })?;

        let rendered = toml::to_string_pretty(value).map_err(|err| TrustStoreError::Parse {
            path: self.path.clone(),
            message: err.to_string(),
        })?;

        dir.write(TRUST_STORE_TMP_FILE, rendered)
            .map_err(|err| TrustStoreError::Io {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        dir.rename(TRUST_STORE_TMP_FILE, &dir, file_name)
            .map_err(|err| TrustStoreError::Io {
                path: self.path.clone(),
                message: err.to_string(),
            })
    }
}

fn split_path(path: &Utf8Path) -> Result<(&Utf8Path, &str), TrustStoreError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| TrustStoreError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("trust store path is missing a filename"),
        })?;
    Ok((parent, file_name))
}

fn parse_toml(path: &Utf8Path, contents: &str) -> Result<toml::Value, TrustStoreError> {
    if contents.trim().is_empty() {
        return Ok(toml::Value::Table(toml::value::Table::new()));
    }
    toml::from_str(contents).map_err(|err| TrustStoreError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn hosts_table(path: &Utf8Path, value: &toml::Value) -> Result<toml::value::Table, TrustStoreError> {
    let table = value
        .as_table()
        .ok_or_else(|| TrustStoreError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("trust store root is not a table"),
        })?;
    let Some(section) = table.get(HOSTS_SECTION) else {
        return Ok(toml::value::Table::new());
    };
    let hosts = section
        .as_table()
        .ok_or_else(|| TrustStoreError::InvalidStructure {
            path: path.to_path_buf(),
            message: format!("[{HOSTS_SECTION}] must be a table"),
        })?;
    Ok(hosts.clone())
}

/// Host verification failures.
///
/// These are security errors, kept apart from [`crate::remote::RemoteError`]
/// so callers can never mistake a trust violation for flaky connectivity.
#[derive(Debug, Error)]
pub enum TrustError {
    /// Raised when the out-of-band host-key probe fails or times out.
    #[error("could not read host key of {host}: {message}")]
    Probe {
        /// Host that was probed.
        host: String,
        /// Description of the probe failure.
        message: String,
    },
    /// Raised when keyscan output cannot be parsed into a fingerprint.
    #[error("malformed host key from keyscan: {detail}")]
    MalformedHostKey {
        /// What was wrong with the output.
        detail: String,
    },
    /// Raised when the stored fingerprint does not match the observed one.
    #[error(
        "host identity for VM '{vm_name}' has changed (stored {stored}, observed {observed}). \
         If the VM was legitimately rebuilt, run `ostriv trust forget {vm_name}` and retry; \
         otherwise treat this as a possible interception and do not proceed."
    )]
    Mismatch {
        /// VM whose identity changed.
        vm_name: String,
        /// Fingerprint recorded on first use.
        stored: String,
        /// Fingerprint observed now.
        observed: String,
    },
    /// Raised when the trust store itself cannot be read or updated.
    #[error(transparent)]
    Store(#[from] TrustStoreError),
}

/// Proof that a host's identity was verified within this invocation.
///
/// Produced only by [`HostVerifier::verify`]; write-capable remote calls
/// require one, so repeated calls in a multi-step workflow reuse the same
/// verification instead of re-probing the host.
#[derive(Clone, Debug)]
pub struct Verified {
    vm_name: String,
    fingerprint: String,
}

impl Verified {
    /// VM name the verification applies to.
    #[must_use]
    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    /// Fingerprint that was verified.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Wraps the remote execution primitive with TOFU host verification.
#[derive(Debug)]
pub struct HostVerifier<'a, R: CommandRunner> {
    store: &'a TrustStore,
    runner: &'a R,
    keyscan_bin: String,
    probe_timeout_secs: u64,
    ssh_port: u16,
}

impl<'a, R: CommandRunner> HostVerifier<'a, R> {
    /// Creates a verifier over the given store and runner.
    #[must_use]
    pub fn new(store: &'a TrustStore, runner: &'a R, config: &RemoteConfig) -> Self {
        Self {
            store,
            runner,
            keyscan_bin: config.keyscan_bin.clone(),
            probe_timeout_secs: config.connect_timeout_secs,
            ssh_port: config.ssh_port,
        }
    }

    /// Probes the host's key out-of-band and checks it against the stored
    /// record for `vm_name`.
    ///
    /// No prior record: the fingerprint is recorded now (trust on first
    /// use). A matching record proceeds. A mismatch refuses with
    /// [`TrustError::Mismatch`] before any remote command runs.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError`] when the probe fails, the key is malformed,
    /// the record mismatches, or the store cannot be updated.
    pub fn verify(&self, vm_name: &str, host: IpAddr) -> Result<Verified, TrustError> {
        let observed = self.probe_fingerprint(host)?;

        match self.store.lookup(vm_name)? {
            None => {
                self.store.record(vm_name, &observed)?;
                info!(vm = vm_name, fingerprint = %observed, "trusting host on first use");
            }
            Some(stored) if stored == observed => {}
            Some(stored) => {
                return Err(TrustError::Mismatch {
                    vm_name: vm_name.to_owned(),
                    stored,
                    observed,
                });
            }
        }

        Ok(Verified {
            vm_name: vm_name.to_owned(),
            fingerprint: observed,
        })
    }

    fn probe_fingerprint(&self, host: IpAddr) -> Result<String, TrustError> {
        let args = vec![
            OsString::from("-T"),
            OsString::from(self.probe_timeout_secs.to_string()),
            OsString::from("-p"),
            OsString::from(self.ssh_port.to_string()),
            OsString::from("-t"),
            OsString::from("ed25519"),
            OsString::from(host.to_string()),
        ];
        let output = self
            .runner
            .run(&self.keyscan_bin, &args)
            .map_err(|err| TrustError::Probe {
                host: host.to_string(),
                message: err.to_string(),
            })?;

        if !output.is_success() {
            return Err(TrustError::Probe {
                host: host.to_string(),
                message: probe_failure_message(output.code, &output.stderr),
            });
        }

        fingerprint_from_keyscan(&output.stdout)
    }
}

fn probe_failure_message(code: Option<i32>, stderr: &str) -> String {
    let status = code.map_or_else(|| String::from("no exit status"), |c| format!("status {c}"));
    let detail = stderr.trim();
    if detail.is_empty() {
        format!("ssh-keyscan exited with {status}")
    } else {
        format!("ssh-keyscan exited with {status}: {detail}")
    }
}

/// Extracts the first host key from `ssh-keyscan` output and returns its
/// OpenSSH-style SHA-256 fingerprint (`SHA256:<unpadded base64>`).
pub(crate) fn fingerprint_from_keyscan(stdout: &str) -> Result<String, TrustError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .ok_or_else(|| TrustError::MalformedHostKey {
            detail: String::from("keyscan returned no host key lines"),
        })?;

    let mut fields = line.split_whitespace();
    let _host = fields.next();
    let _key_type = fields.next();
    let blob = fields.next().ok_or_else(|| TrustError::MalformedHostKey {
        detail: format!("expected 'host type base64' fields, got: {line}"),
    })?;

    let raw = STANDARD
        .decode(blob)
        .map_err(|err| TrustError::MalformedHostKey {
            detail: format!("invalid base64 key material: {err}"),
        })?;
    let digest = Sha256::digest(&raw);
    Ok(format!("SHA256:{}", STANDARD_NO_PAD.encode(digest)))
}

#[cfg(test)]
mod tests {
    use super::*;

    // `ssh-keyscan` style line with a syntactically valid base64 blob.
    const KEYSCAN_LINE: &str = "192.0.2.10 ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

    #[test]
    fn fingerprint_from_keyscan_skips_comments() {
        let stdout = format!("# 192.0.2.10:22 SSH-2.0-OpenSSH_9.6\n{KEYSCAN_LINE}\n");
        let fingerprint = fingerprint_from_keyscan(&stdout)
            .unwrap_or_else(|err| panic!("fingerprint: {err}"));
        assert!(fingerprint.starts_with("SHA256:"), "got {fingerprint}");
        assert!(!fingerprint.ends_with('='), "fingerprint must be unpadded");
    }

    #[test]
    fn fingerprint_from_keyscan_is_deterministic() {
        let first = fingerprint_from_keyscan(KEYSCAN_LINE)
            .unwrap_or_else(|err| panic!("fingerprint: {err}"));
        let second = fingerprint_from_keyscan(KEYSCAN_LINE)
            .unwrap_or_else(|err| panic!("fingerprint: {err}"));
        assert_eq!(first, second);
    }

    #[test]
    fn fingerprint_from_keyscan_rejects_empty_output() {
        let err = fingerprint_from_keyscan("# only comments\n")
            .expect_err("comment-only output should be rejected");
        assert!(matches!(err, TrustError::MalformedHostKey { .. }));
    }

    #[test]
    fn fingerprint_from_keyscan_rejects_truncated_line() {
        let err = fingerprint_from_keyscan("192.0.2.10 ssh-ed25519\n")
            .expect_err("missing blob should be rejected");
        assert!(matches!(err, TrustError::MalformedHostKey { .. }));
    }
}
