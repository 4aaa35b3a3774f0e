//! Secure remote execution over the system `ssh` client.
//!
//! A remote operation is a single non-interactive command run with a
//! per-operation [`EphemeralKey`]. Connections carry an explicit connect
//! timeout so an unreachable or mid-boot host cannot hang the whole
//! command. Write-capable calls additionally require a [`Verified`] token
//! from the TOFU layer; read-only probes do not.

pub mod keys;
pub mod tofu;

use std::ffi::OsString;
use std::net::IpAddr;

use thiserror::Error;

use crate::remote::keys::EphemeralKey;
use crate::remote::tofu::Verified;
use crate::runner::{CommandRunner, RunnerError};

const DEFAULT_SSH_BIN: &str = "ssh";
const DEFAULT_KEYSCAN_BIN: &str = "ssh-keyscan";
const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

// OpenSSH reserves 255 for its own failures (DNS, refused, auth).
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Settings for reaching the workspace VM over SSH.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteConfig {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Path to the `ssh-keyscan` executable used for host-key probes.
    pub keyscan_bin: String,
    /// Remote user to connect as.
    pub ssh_user: String,
    /// TCP port for SSH.
    pub ssh_port: u16,
    /// Bound on connection establishment, in seconds.
    pub connect_timeout_secs: u64,
}

impl RemoteConfig {
    /// Builds a config for the given remote user with standard defaults.
    #[must_use]
    pub fn for_user(ssh_user: impl Into<String>) -> Self {
        Self {
            ssh_bin: String::from(DEFAULT_SSH_BIN),
            keyscan_bin: String::from(DEFAULT_KEYSCAN_BIN),
            ssh_user: ssh_user.into(),
            ssh_port: DEFAULT_SSH_PORT,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

/// Address and port of a reachable instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RemoteTarget {
    /// Public address of the instance.
    pub host: IpAddr,
    /// SSH port.
    pub port: u16,
}

/// Output captured from a remote command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteOutput {
    /// Exit code reported by the remote command.
    pub exit_code: i32,
    /// Captured standard output stream.
    pub stdout: String,
    /// Captured standard error stream.
    pub stderr: String,
}

impl RemoteOutput {
    /// Returns `true` when the remote command exited zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors surfaced while executing a remote command.
///
/// Trust violations are deliberately not represented here; they are
/// [`crate::remote::tofu::TrustError`] and short-circuit before execution.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// Raised when the local `ssh` process cannot be spawned.
    #[error(transparent)]
    Spawn(#[from] RunnerError),
    /// Raised when the SSH transport itself fails (unreachable host,
    /// refused connection, authentication failure).
    #[error("ssh connection to {host} failed: {detail}")]
    Connection {
        /// Host that could not be reached.
        host: String,
        /// Stderr captured from the ssh client.
        detail: String,
    },
    /// Raised when the process finishes without yielding an exit status.
    #[error("{program} did not return an exit code")]
    MissingExitCode {
        /// Command that completed without a status.
        program: String,
    },
}

/// Runs single non-interactive commands on the VM with issued credentials.
#[derive(Debug)]
pub struct RemoteExecutor<R: CommandRunner> {
    config: RemoteConfig,
    runner: R,
}

impl<R: CommandRunner> RemoteExecutor<R> {
    /// Creates an executor using the provided runner and configuration.
    #[must_use]
    pub const fn new(config: RemoteConfig, runner: R) -> Self {
        Self { config, runner }
    }

    /// Remote configuration in use.
    #[must_use]
    pub const fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Runner backing this executor.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Builds a target for the configured port.
    #[must_use]
    pub const fn target(&self, host: IpAddr) -> RemoteTarget {
        RemoteTarget {
            host,
            port: self.config.ssh_port,
        }
    }

    /// Executes a read-only command on the target host.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] when the ssh client cannot be spawned, the
    /// transport fails, or no exit code is reported.
    pub fn execute(
        &self,
        target: &RemoteTarget,
        credential: &EphemeralKey,
        command: &str,
    ) -> Result<RemoteOutput, RemoteError> {
        let args = self.build_ssh_args(target, credential, command);
        let output = self.runner.run(&self.config.ssh_bin, &args)?;
        let Some(exit_code) = output.code else {
            return Err(RemoteError::MissingExitCode {
                program: self.config.ssh_bin.clone(),
            });
        };

        if exit_code == SSH_TRANSPORT_FAILURE {
            return Err(RemoteError::Connection {
                host: target.host.to_string(),
                detail: output.stderr.trim().to_owned(),
            });
        }

        Ok(RemoteOutput {
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Executes a write-capable command. The [`Verified`] token proves the
    /// host's identity was checked within this invocation; obtaining one is
    /// the TOFU layer's job, and without it no mutating command can be
    /// expressed.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] under the same conditions as
    /// [`RemoteExecutor::execute`].
    pub fn execute_verified(
        &self,
        verified: &Verified,
        target: &RemoteTarget,
        credential: &EphemeralKey,
        command: &str,
    ) -> Result<RemoteOutput, RemoteError> {
        tracing::debug!(
            vm = verified.vm_name(),
            fingerprint = verified.fingerprint(),
            "executing verified remote command"
        );
        self.execute(target, credential, command)
    }

    fn build_ssh_args(
        &self,
        target: &RemoteTarget,
        credential: &EphemeralKey,
        command: &str,
    ) -> Vec<OsString> {
        vec![
            OsString::from("-i"),
            OsString::from(credential.private_key_path().as_str()),
            OsString::from("-p"),
            OsString::from(target.port.to_string()),
            OsString::from("-o"),
            OsString::from("BatchMode=yes"),
            OsString::from("-o"),
            OsString::from("IdentitiesOnly=yes"),
            OsString::from("-o"),
            OsString::from(format!(
                "ConnectTimeout={}",
                self.config.connect_timeout_secs
            )),
            // Host trust is enforced by the TOFU layer, not OpenSSH's
            // known_hosts database.
            OsString::from("-o"),
            OsString::from("StrictHostKeyChecking=no"),
            OsString::from("-o"),
            OsString::from("UserKnownHostsFile=/dev/null"),
            OsString::from(format!("{}@{}", self.config.ssh_user, target.host)),
            OsString::from(command),
        ]
    }
}
