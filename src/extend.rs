//! Explicit activity holds.
//!
//! An extend writes a future timestamp to a marker file on the VM. The
//! activity probes treat an unexpired marker as a positive signal, so a hold
//! blocks recreate even when no session or process would. Writing the marker
//! is a mutating remote operation and therefore runs through TOFU host
//! verification with a fresh ephemeral credential.

use std::time::{SystemTime, UNIX_EPOCH};

use camino::Utf8Path;
use thiserror::Error;
use tracing::info;

use crate::locator::{LocateError, locate_instance};
use crate::probe::HOLD_MARKER_PATH;
use crate::provider::{CloudProvider, InstanceState};
use crate::remote::keys::{EphemeralKey, KeyError};
use crate::remote::tofu::{HostVerifier, TrustError, TrustStore};
use crate::remote::{RemoteError, RemoteExecutor};
use crate::runner::CommandRunner;

const SECONDS_PER_HOUR: u64 = 3600;

/// What the operator asked for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExtendRequest {
    /// Stable VM name to hold.
    pub vm_name: String,
    /// Hold duration in hours from now.
    pub hours: u64,
}

/// Result of a successful extend.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExtendOutcome {
    /// Epoch second until which the VM is held.
    pub until_epoch: u64,
}

/// Errors raised while placing a hold.
#[derive(Debug, Error)]
pub enum ExtendError<ProviderError>
where
    ProviderError: std::error::Error + 'static,
{
    /// Raised for a zero-length hold.
    #[error("hold duration must be at least one hour")]
    ZeroDuration,
    /// Raised when the VM cannot be located unambiguously.
    #[error(transparent)]
    Locate(#[from] LocateError<ProviderError>),
    /// Raised when the VM is not running; a hold protects live work only.
    #[error("VM '{vm_name}' is {state}; only a running VM can be held")]
    NotRunning {
        /// VM name from the request.
        vm_name: String,
        /// State the instance was found in.
        state: InstanceState,
    },
    /// Raised when the VM has no public address to connect to.
    #[error("VM '{vm_name}' has no public address; cannot reach it to place a hold")]
    Unreachable {
        /// VM name from the request.
        vm_name: String,
    },
    /// Raised when the ephemeral credential cannot be issued.
    #[error(transparent)]
    Key(#[from] KeyError),
    /// Raised when the credential cannot be pushed to the instance.
    #[error("could not push credential to the instance: {0}")]
    KeyPush(#[source] ProviderError),
    /// Raised when host verification fails or refuses.
    #[error(transparent)]
    Trust(#[from] TrustError),
    /// Raised when the remote command cannot be executed.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// Raised when the marker write ran but exited nonzero.
    #[error("marker write exited with status {exit_code}: {stderr}")]
    MarkerWrite {
        /// Exit code of the remote command.
        exit_code: i32,
        /// Captured stderr of the remote command.
        stderr: String,
    },
}

/// Places a hold on the workspace VM.
pub struct ExtendOrchestrator<'a, P, R>
where
    P: CloudProvider,
    R: CommandRunner,
{
    provider: &'a P,
    executor: &'a RemoteExecutor<R>,
    trust: &'a TrustStore,
    owner: String,
}

impl<'a, P, R> ExtendOrchestrator<'a, P, R>
where
    P: CloudProvider,
    R: CommandRunner,
{
    /// Wires up an orchestrator over the given collaborators.
    #[must_use]
    pub fn new(
        provider: &'a P,
        executor: &'a RemoteExecutor<R>,
        trust: &'a TrustStore,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            executor,
            trust,
            owner: owner.into(),
        }
    }

    /// Writes the hold marker, verifying the host's identity first.
    ///
    /// # Errors
    ///
    /// Returns [`ExtendError`] when the VM cannot be located or reached,
    /// host verification refuses, or the marker write fails.
    pub async fn run(
        &self,
        request: &ExtendRequest,
    ) -> Result<ExtendOutcome, ExtendError<P::Error>> {
        let now_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        self.run_at(request, now_epoch).await
    }

    async fn run_at(
        &self,
        request: &ExtendRequest,
        now_epoch: u64,
    ) -> Result<ExtendOutcome, ExtendError<P::Error>> {
        if request.hours == 0 {
            return Err(ExtendError::ZeroDuration);
        }
        let until_epoch = now_epoch.saturating_add(request.hours.saturating_mul(SECONDS_PER_HOUR));

        let instance = locate_instance(self.provider, &self.owner, &request.vm_name).await?;
        if instance.state != InstanceState::Running {
            return Err(ExtendError::NotRunning {
                vm_name: request.vm_name.clone(),
                state: instance.state,
            });
        }
        let Some(host) = instance.public_ip else {
            return Err(ExtendError::Unreachable {
                vm_name: request.vm_name.clone(),
            });
        };

        let credential = EphemeralKey::generate()?;
        self.provider
            .push_ephemeral_key(&instance.zone, &instance.id, credential.public_key())
            .await
            .map_err(ExtendError::KeyPush)?;

        let verifier = HostVerifier::new(self.trust, self.executor.runner(), self.executor.config());
        let verified = verifier.verify(&request.vm_name, host)?;

        let target = self.executor.target(host);
        let output = self.executor.execute_verified(
            &verified,
            &target,
            &credential,
            &hold_command(until_epoch),
        )?;
        if !output.is_success() {
            return Err(ExtendError::MarkerWrite {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_owned(),
            });
        }

        info!(
            vm = %request.vm_name,
            until_epoch, "hold marker placed on the VM"
        );
        Ok(ExtendOutcome { until_epoch })
    }
}

/// Builds the remote command that persists the hold timestamp.
fn hold_command(until_epoch: u64) -> String {
    let marker = Utf8Path::new(HOLD_MARKER_PATH);
    let parent = marker.parent().unwrap_or_else(|| Utf8Path::new("/"));
    format!(
        "sudo mkdir -p {} && echo {until_epoch} | sudo tee {} >/dev/null",
        shell_escape::escape(parent.as_str().into()),
        shell_escape::escape(marker.as_str().into()),
    )
}
