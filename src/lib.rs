//! Core library for the Ostriv workspace VM manager.
//!
//! The crate manages the lifecycle of a single developer-workspace VM: a
//! destructive-but-safe `recreate` operation that replaces the instance while
//! preserving its identity (data volume, flexible IP, SSH trust), plus the
//! secure remote execution layer used by every command that talks to the VM
//! over the network.

pub mod bootstrap;
pub mod config;
pub mod extend;
pub mod locator;
pub mod probe;
pub mod provider;
pub mod recreate;
pub mod remote;
pub mod runner;
pub mod scaleway;

pub use bootstrap::{BootstrapError, BootstrapStatus, verify_script};
pub use config::{ConfigError, OstrivConfig};
pub use extend::{ExtendError, ExtendOrchestrator, ExtendOutcome, ExtendRequest};
pub use locator::{LocateError, locate_address, locate_instance, locate_volume};
pub use probe::{ActivityProber, ActivityReport, ActivitySignal, ExecutorReader, RemoteReader};
pub use provider::{
    CloudProvider, FloatingAddress, Instance, InstanceState, LaunchSpec, ProviderFuture, Volume,
    VolumeState,
};
pub use recreate::{
    ConfirmationPrompt, LaunchTemplate, PollSettings, PromptError, RecreateError,
    RecreateOrchestrator, RecreateOutcome, RecreateRequest, RecreateStep, StdinPrompt,
};
pub use remote::keys::{EphemeralKey, KeyError};
pub use remote::tofu::{HostVerifier, TrustError, TrustStore, TrustStoreError, Verified};
pub use remote::{RemoteConfig, RemoteError, RemoteExecutor, RemoteOutput, RemoteTarget};
pub use runner::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use scaleway::{ScalewayError, ScalewayProvider};
