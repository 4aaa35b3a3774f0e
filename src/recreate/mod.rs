//! Crash-safe recreation of the workspace VM.
//!
//! Recreate replaces the running instance with a fresh one from the current
//! image while carrying over the three durable resources: the data volume,
//! the floating address, and the identity labels. The sequence is ordered so
//! that an interruption at any point leaves the control plane describing
//! enough state for a rerun to finish the job; the only durable breadcrumb
//! is a reattachment marker tag on the volume, set before the old instance
//! is touched and cleared after the volume is attached to its successor.
//!
//! Destructive work is gated three times over: the instance must be in a
//! recreatable state, activity probes must come back idle, and the operator
//! must retype the VM name.

use std::fmt;
use std::io::{self, BufRead, Write};
use std::net::IpAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{info, warn};

use crate::bootstrap::{BootstrapError, BootstrapStatus, verify_script};
use crate::locator::{LocateError, locate_address, locate_instance, locate_volume};
use crate::probe::{
    ActivityProber, ActivityReport, ActivitySignal, ExecutorReader, format_signals,
};
use crate::provider::{
    BOOTSTRAP_TAG, CloudProvider, FloatingAddress, Instance, InstanceState, LaunchSpec, OWNER_TAG,
    PENDING_ATTACH_TAG, VM_NAME_TAG, Volume, VolumeState, tag, with_tag, without_tag,
};
use crate::remote::RemoteExecutor;
use crate::remote::keys::EphemeralKey;
use crate::remote::tofu::{TrustStore, TrustStoreError};
use crate::runner::CommandRunner;

/// What the operator asked for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecreateRequest {
    /// Stable VM name to recreate.
    pub vm_name: String,
    /// Skip the typed-name confirmation.
    pub assume_yes: bool,
    /// Skip the activity probes.
    pub ignore_activity: bool,
}

/// What the operator gets back on success.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecreateOutcome {
    /// Identifier of the replacement instance.
    pub instance_id: String,
    /// Stable address of the replacement, when one exists.
    pub address: Option<IpAddr>,
}

/// Launch parameters that do not depend on the located resources.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchTemplate {
    /// Human-friendly image label, resolved per zone at launch time.
    pub image_label: String,
    /// CPU architecture used to pick the image variant.
    pub architecture: String,
    /// Commercial type of the replacement instance.
    pub instance_type: String,
    /// Project for billing and ownership.
    pub project_id: String,
    /// Full text of the provisioning script.
    pub bootstrap_script: String,
    /// Pinned SHA-256 digest of the provisioning script, lowercase hex.
    pub bootstrap_script_sha256: String,
}

/// Bounds on the polling loops.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollSettings {
    /// How long to wait for the old instance to power off.
    pub stop_wait: Duration,
    /// How long to wait for the data volume to become detachable.
    pub detach_wait: Duration,
    /// How long to wait for the old instance to leave the control plane.
    pub terminate_wait: Duration,
    /// How long to wait for the provisioning script to report in.
    pub bootstrap_wait: Duration,
    /// Delay between polls.
    pub interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            stop_wait: Duration::from_secs(120),
            detach_wait: Duration::from_secs(120),
            terminate_wait: Duration::from_secs(120),
            bootstrap_wait: Duration::from_secs(600),
            interval: Duration::from_secs(3),
        }
    }
}

/// Asks the operator to retype the VM name before destruction.
pub trait ConfirmationPrompt {
    /// Shows the prompt and returns the operator's response verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`PromptError`] when the terminal cannot be read or written.
    fn confirm_name(&self, vm_name: &str) -> Result<String, PromptError>;
}

/// Errors raised while prompting for confirmation.
#[derive(Debug, Error)]
pub enum PromptError {
    /// Raised when stdin or stdout fails.
    #[error("could not read confirmation: {0}")]
    Io(String),
}

/// Prompt reading the confirmation from the controlling terminal.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdinPrompt;

impl ConfirmationPrompt for StdinPrompt {
    fn confirm_name(&self, vm_name: &str) -> Result<String, PromptError> {
        let mut stdout = io::stdout();
        write!(
            stdout,
            "This will destroy the current instance of '{vm_name}'. The data \
             volume and address are preserved.\nType the VM name to continue: "
        )
        .map_err(|err| PromptError::Io(err.to_string()))?;
        stdout
            .flush()
            .map_err(|err| PromptError::Io(err.to_string()))?;

        let mut entered = String::new();
        io::stdin()
            .lock()
            .read_line(&mut entered)
            .map_err(|err| PromptError::Io(err.to_string()))?;
        Ok(entered)
    }
}

/// A control-plane mutation in the recreate sequence, named for error
/// reporting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecreateStep {
    /// Stamp the reattachment marker onto the data volume.
    SetReattachMarker,
    /// Gracefully stop the old instance.
    StopInstance,
    /// Detach the data volume from the old instance.
    DetachVolume,
    /// Destroy the old instance.
    TerminateInstance,
    /// Resolve the image label to a concrete image.
    ResolveImage,
    /// Resolve the owner's security boundary resource.
    ResolveSecurityGroup,
    /// Launch the replacement instance.
    LaunchInstance,
    /// Attach the data volume to the replacement.
    AttachVolume,
    /// Rebind the floating address to the replacement.
    MoveAddress,
    /// Poll the replacement until the provisioning script reports in.
    AwaitBootstrap,
}

impl fmt::Display for RecreateStep {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SetReattachMarker => "set reattach marker",
            Self::StopInstance => "stop instance",
            Self::DetachVolume => "detach data volume",
            Self::TerminateInstance => "terminate instance",
            Self::ResolveImage => "resolve image",
            Self::ResolveSecurityGroup => "resolve security group",
            Self::LaunchInstance => "launch replacement",
            Self::AttachVolume => "attach data volume",
            Self::MoveAddress => "move floating address",
            Self::AwaitBootstrap => "await provisioning",
        };
        formatter.write_str(name)
    }
}

/// Errors raised by the recreate sequence.
#[derive(Debug, Error)]
pub enum RecreateError<ProviderError>
where
    ProviderError: std::error::Error + 'static,
{
    /// Raised when the VM's resources cannot be located unambiguously.
    #[error(transparent)]
    Locate(#[from] LocateError<ProviderError>),
    /// Raised when the instance is mid-transition and recreate cannot
    /// proceed safely.
    #[error("VM '{vm_name}' is {state}; wait for it to settle and retry")]
    WrongState {
        /// VM name from the request.
        vm_name: String,
        /// State the instance was found in.
        state: InstanceState,
    },
    /// Raised when activity probes report the VM in use.
    #[error(
        "recreate blocked; VM is in use: {}. Rerun with --ignore-activity to override",
        format_signals(.signals)
    )]
    Active {
        /// The signals that triggered the block.
        signals: Vec<ActivitySignal>,
    },
    /// Raised when the confirmation prompt itself fails.
    #[error(transparent)]
    Prompt(#[from] PromptError),
    /// Raised when the operator's typed confirmation does not match.
    #[error("confirmation '{entered}' does not match VM name '{expected}'; aborting")]
    ConfirmationMismatch {
        /// Name that had to be typed.
        expected: String,
        /// What the operator typed, trimmed.
        entered: String,
    },
    /// Raised when the provisioning script fails its integrity check.
    #[error(transparent)]
    ScriptIntegrity(#[from] BootstrapError),
    /// Raised when a control-plane mutation fails.
    #[error("recreate failed at step '{step}': {source}")]
    Step {
        /// The step that failed.
        step: RecreateStep,
        /// Provider error behind the failure.
        source: ProviderError,
    },
    /// Raised when a polling loop exhausts its bound.
    #[error("timed out after {waited_secs}s waiting for {waiting_for}")]
    WaitTimeout {
        /// What the loop was waiting on.
        waiting_for: String,
        /// Seconds waited before giving up.
        waited_secs: u64,
    },
    /// Raised when the host trust record cannot be invalidated. The old
    /// fingerprint must not survive the recreate, so this is fatal even
    /// though the replacement is already up.
    #[error("replacement is up but its predecessor's host trust could not be dropped: {0}")]
    TrustStore(#[from] TrustStoreError),
    /// Raised when the provisioning script reports failure.
    #[error("provisioning script failed on instance {instance_id}; inspect its console log")]
    BootstrapFailed {
        /// Replacement instance identifier.
        instance_id: String,
    },
}

/// Drives the recreate sequence end to end.
pub struct RecreateOrchestrator<'a, P, R, C>
where
    P: CloudProvider,
    R: CommandRunner,
    C: ConfirmationPrompt,
{
    provider: &'a P,
    executor: &'a RemoteExecutor<R>,
    prober: &'a ActivityProber,
    trust: &'a TrustStore,
    prompt: &'a C,
    owner: String,
    template: LaunchTemplate,
    poll: PollSettings,
}

impl<'a, P, R, C> RecreateOrchestrator<'a, P, R, C>
where
    P: CloudProvider,
    R: CommandRunner,
    C: ConfirmationPrompt,
{
    /// Wires up an orchestrator over the given collaborators.
    #[must_use]
    pub fn new(
        provider: &'a P,
        executor: &'a RemoteExecutor<R>,
        prober: &'a ActivityProber,
        trust: &'a TrustStore,
        prompt: &'a C,
        owner: impl Into<String>,
        template: LaunchTemplate,
    ) -> Self {
        Self {
            provider,
            executor,
            prober,
            trust,
            prompt,
            owner: owner.into(),
            template,
            poll: PollSettings::default(),
        }
    }

    /// Overrides the polling bounds.
    #[must_use]
    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    /// Runs the full sequence: guards, then the ordered teardown and
    /// rebuild, then the post-launch bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns [`RecreateError`] when a guard blocks the operation or any
    /// non-optional step fails. A missing floating address and the marker
    /// cleanup degrade to warnings instead.
    pub async fn run(
        &self,
        request: &RecreateRequest,
    ) -> Result<RecreateOutcome, RecreateError<P::Error>> {
        // The script runs with root privileges on the replacement; refuse to
        // destroy anything if its bytes are not the pinned ones.
        verify_script(
            &self.template.bootstrap_script,
            &self.template.bootstrap_script_sha256,
        )?;

        let instance = locate_instance(self.provider, &self.owner, &request.vm_name).await?;
        if instance.state != InstanceState::Running {
            return Err(RecreateError::WrongState {
                vm_name: request.vm_name.clone(),
                state: instance.state,
            });
        }

        let report = self.guard_activity(request, &instance).await;
        if report.is_active() {
            return Err(RecreateError::Active {
                signals: report.signals,
            });
        }
        for reason in &report.degraded {
            warn!(%reason, "proceeding with a weakened activity guard");
        }

        if !request.assume_yes {
            let entered = self.prompt.confirm_name(&request.vm_name)?;
            let entered = entered.trim();
            if entered != request.vm_name {
                return Err(RecreateError::ConfirmationMismatch {
                    expected: request.vm_name.clone(),
                    entered: entered.to_owned(),
                });
            }
        }

        let volume = locate_volume(self.provider, &self.owner, &request.vm_name).await?;
        let address = locate_address(self.provider, &self.owner, &request.vm_name).await?;

        let marked_tags = with_tag(&volume.tags, PENDING_ATTACH_TAG);
        self.provider
            .replace_volume_tags(&volume.zone, &volume.id, &marked_tags)
            .await
            .map_err(|source| RecreateError::Step {
                step: RecreateStep::SetReattachMarker,
                source,
            })?;

        self.tear_down(&instance, &volume).await?;
        let replacement = self.launch_replacement(request, &volume).await?;

        self.provider
            .attach_volume(&volume.zone, &replacement.id, &volume.id)
            .await
            .map_err(|source| RecreateError::Step {
                step: RecreateStep::AttachVolume,
                source,
            })?;

        let cleared_tags = without_tag(&marked_tags, PENDING_ATTACH_TAG);
        if let Err(err) = self
            .provider
            .replace_volume_tags(&volume.zone, &volume.id, &cleared_tags)
            .await
        {
            warn!(
                volume = %volume.id,
                error = %err,
                "volume attached but the reattach marker could not be cleared; \
                 a later run will remove it"
            );
        }

        let stable_address = self.move_address(address.as_ref(), &replacement).await?;

        // Never let the predecessor's host key vouch for the replacement.
        if self.trust.forget(&request.vm_name)? {
            info!(vm = %request.vm_name, "dropped host trust for the old instance");
        }

        let final_snapshot = self.await_bootstrap(&replacement).await?;

        Ok(RecreateOutcome {
            instance_id: replacement.id,
            address: stable_address.or(final_snapshot.public_ip),
        })
    }

    /// Probes for activity, or skips the probes when the request says so or
    /// the instance cannot be reached.
    async fn guard_activity(&self, request: &RecreateRequest, instance: &Instance) -> ActivityReport {
        if request.ignore_activity {
            warn!(vm = %request.vm_name, "activity probes skipped on request");
            return ActivityReport::default();
        }
        let Some(host) = instance.public_ip else {
            return ActivityReport::fully_degraded(
                "instance has no public address; activity probes skipped",
            );
        };

        let credential = match EphemeralKey::generate() {
            Ok(credential) => credential,
            Err(err) => {
                return ActivityReport::fully_degraded(format!(
                    "could not issue probe credential: {err}"
                ));
            }
        };
        if let Err(err) = self
            .provider
            .push_ephemeral_key(&instance.zone, &instance.id, credential.public_key())
            .await
        {
            return ActivityReport::fully_degraded(format!("could not push probe key: {err}"));
        }

        let reader = ExecutorReader::new(self.executor, self.executor.target(host), &credential);
        let now_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        self.prober.assess(&reader, now_epoch)
    }

    /// Stops, detaches, and terminates the old instance, waiting out each
    /// transition.
    async fn tear_down(
        &self,
        instance: &Instance,
        volume: &Volume,
    ) -> Result<(), RecreateError<P::Error>> {
        self.provider
            .stop_instance(&instance.zone, &instance.id)
            .await
            .map_err(|source| RecreateError::Step {
                step: RecreateStep::StopInstance,
                source,
            })?;
        self.wait_for_stop(instance).await?;

        if volume.attached_to.is_some() {
            self.provider
                .detach_volume(&volume.zone, &instance.id, &volume.id)
                .await
                .map_err(|source| RecreateError::Step {
                    step: RecreateStep::DetachVolume,
                    source,
                })?;
            self.wait_for_detach(volume).await?;
        }

        self.provider
            .terminate_instance(&instance.zone, &instance.id)
            .await
            .map_err(|source| RecreateError::Step {
                step: RecreateStep::TerminateInstance,
                source,
            })?;
        self.wait_for_terminate(instance).await
    }

    /// Resolves zone-scoped launch inputs and brings up the replacement in
    /// the volume's zone.
    async fn launch_replacement(
        &self,
        request: &RecreateRequest,
        volume: &Volume,
    ) -> Result<Instance, RecreateError<P::Error>> {
        let image_id = self
            .provider
            .resolve_image(&self.template.image_label, &self.template.architecture, &volume.zone)
            .await
            .map_err(|source| RecreateError::Step {
                step: RecreateStep::ResolveImage,
                source,
            })?;
        let security_group_id = self
            .provider
            .resolve_security_group(&self.owner, &volume.zone)
            .await
            .map_err(|source| RecreateError::Step {
                step: RecreateStep::ResolveSecurityGroup,
                source,
            })?;

        let spec = LaunchSpec {
            name: request.vm_name.clone(),
            zone: volume.zone.clone(),
            image_id,
            instance_type: self.template.instance_type.clone(),
            security_group_id,
            tags: vec![
                tag(OWNER_TAG, &self.owner),
                tag(VM_NAME_TAG, &request.vm_name),
                tag(BOOTSTRAP_TAG, "pending"),
            ],
            user_data: self.template.bootstrap_script.clone(),
            project_id: self.template.project_id.clone(),
        };
        self.provider
            .launch_instance(&spec)
            .await
            .map_err(|source| RecreateError::Step {
                step: RecreateStep::LaunchInstance,
                source,
            })
    }

    /// Rebinds the floating address, or warns when the VM has none.
    async fn move_address(
        &self,
        address: Option<&FloatingAddress>,
        replacement: &Instance,
    ) -> Result<Option<IpAddr>, RecreateError<P::Error>> {
        let Some(address) = address else {
            warn!(
                "no floating address carries this VM's labels; the replacement \
                 is reachable only through its dynamic address"
            );
            return Ok(None);
        };

        if let Some(bound_to) = &address.bound_to {
            if bound_to != &replacement.id {
                self.provider
                    .disassociate_address(&address.zone, &address.id)
                    .await
                    .map_err(|source| RecreateError::Step {
                        step: RecreateStep::MoveAddress,
                        source,
                    })?;
            }
        }
        self.provider
            .associate_address(&address.zone, &address.id, &replacement.id)
            .await
            .map_err(|source| RecreateError::Step {
                step: RecreateStep::MoveAddress,
                source,
            })?;
        Ok(Some(address.address))
    }

    async fn wait_for_stop(&self, instance: &Instance) -> Result<(), RecreateError<P::Error>> {
        let deadline = Instant::now() + self.poll.stop_wait;
        loop {
            let snapshot = self
                .provider
                .get_instance(&instance.zone, &instance.id)
                .await
                .map_err(|source| RecreateError::Step {
                    step: RecreateStep::StopInstance,
                    source,
                })?;
            match snapshot {
                None => return Ok(()),
                Some(current) if current.state == InstanceState::Stopped => return Ok(()),
                Some(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(RecreateError::WaitTimeout {
                    waiting_for: format!("instance {} to stop", instance.id),
                    waited_secs: self.poll.stop_wait.as_secs(),
                });
            }
            tokio::time::sleep(self.poll.interval).await;
        }
    }

    async fn wait_for_detach(&self, volume: &Volume) -> Result<(), RecreateError<P::Error>> {
        let deadline = Instant::now() + self.poll.detach_wait;
        loop {
            let snapshot = self
                .provider
                .get_volume(&volume.zone, &volume.id)
                .await
                .map_err(|source| RecreateError::Step {
                    step: RecreateStep::DetachVolume,
                    source,
                })?;
            if snapshot.is_some_and(|current| current.state == VolumeState::Available) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RecreateError::WaitTimeout {
                    waiting_for: format!("volume {} to detach", volume.id),
                    waited_secs: self.poll.detach_wait.as_secs(),
                });
            }
            tokio::time::sleep(self.poll.interval).await;
        }
    }

    async fn wait_for_terminate(&self, instance: &Instance) -> Result<(), RecreateError<P::Error>> {
        let deadline = Instant::now() + self.poll.terminate_wait;
        loop {
            let snapshot = self
                .provider
                .get_instance(&instance.zone, &instance.id)
                .await
                .map_err(|source| RecreateError::Step {
                    step: RecreateStep::TerminateInstance,
                    source,
                })?;
            match snapshot {
                None => return Ok(()),
                Some(current) if current.state == InstanceState::Terminated => return Ok(()),
                Some(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(RecreateError::WaitTimeout {
                    waiting_for: format!("instance {} to terminate", instance.id),
                    waited_secs: self.poll.terminate_wait.as_secs(),
                });
            }
            tokio::time::sleep(self.poll.interval).await;
        }
    }

    /// Polls the replacement's labels until the provisioning script reports
    /// completion, and returns the final snapshot.
    async fn await_bootstrap(
        &self,
        replacement: &Instance,
    ) -> Result<Instance, RecreateError<P::Error>> {
        let deadline = Instant::now() + self.poll.bootstrap_wait;
        loop {
            let snapshot = self
                .provider
                .get_instance(&replacement.zone, &replacement.id)
                .await
                .map_err(|source| RecreateError::Step {
                    step: RecreateStep::AwaitBootstrap,
                    source,
                })?;
            if let Some(current) = snapshot {
                match BootstrapStatus::from_tags(&current.tags) {
                    BootstrapStatus::Complete => return Ok(current),
                    BootstrapStatus::Failed => {
                        return Err(RecreateError::BootstrapFailed {
                            instance_id: replacement.id.clone(),
                        });
                    }
                    BootstrapStatus::Pending => {}
                }
            }
            if Instant::now() >= deadline {
                return Err(RecreateError::WaitTimeout {
                    waiting_for: format!(
                        "provisioning to complete on instance {}",
                        replacement.id
                    ),
                    waited_secs: self.poll.bootstrap_wait.as_secs(),
                });
            }
            tokio::time::sleep(self.poll.interval).await;
        }
    }
}

#[cfg(test)]
mod tests;
