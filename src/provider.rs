//! Control-plane abstraction for the workspace VM's resource group.
//!
//! The trait exposes exactly the operations the lifecycle orchestrator
//! needs. Resources are addressed by labels (owner, VM name) stamped as
//! `key=value` tags; nothing is looked up by a locally stored identifier.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

/// Tag key holding the ownership label.
pub const OWNER_TAG: &str = "owner";
/// Tag key holding the stable VM name.
pub const VM_NAME_TAG: &str = "vm";
/// Tag key holding the bootstrap status written by the provisioned host.
pub const BOOTSTRAP_TAG: &str = "bootstrap";
/// Bare tag marking an in-progress volume reattachment. Its presence is the
/// sole durable crash-recovery breadcrumb for an interrupted recreate.
pub const PENDING_ATTACH_TAG: &str = "pending-attach";

/// Renders a `key=value` tag.
#[must_use]
pub fn tag(key: &str, value: &str) -> String {
    format!("{key}={value}")
}

/// Extracts the value of a `key=value` tag, if present.
#[must_use]
pub fn tag_value<'a>(tags: &'a [String], key: &str) -> Option<&'a str> {
    tags.iter()
        .filter_map(|entry| entry.split_once('='))
        .find(|(entry_key, _)| *entry_key == key)
        .map(|(_, value)| value)
}

/// Returns `true` when a bare tag (no value) is present.
#[must_use]
pub fn has_tag(tags: &[String], key: &str) -> bool {
    tags.iter().any(|entry| entry == key)
}

/// Returns a tag list extended with `addition`, without duplicating it.
#[must_use]
pub fn with_tag(tags: &[String], addition: &str) -> Vec<String> {
    let mut updated: Vec<String> = tags.to_vec();
    if !updated.iter().any(|entry| entry == addition) {
        updated.push(addition.to_owned());
    }
    updated
}

/// Returns a tag list with every occurrence of `removal` removed.
#[must_use]
pub fn without_tag(tags: &[String], removal: &str) -> Vec<String> {
    tags.iter()
        .filter(|entry| entry.as_str() != removal)
        .cloned()
        .collect()
}

/// Lifecycle state reported by the control plane for an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstanceState {
    /// Instance is being created or booting.
    Pending,
    /// Instance is up.
    Running,
    /// Graceful stop in progress.
    Stopping,
    /// Instance is powered off but still exists.
    Stopped,
    /// Instance has been destroyed.
    Terminated,
    /// Provider-specific state outside the common set.
    Other(String),
}

impl InstanceState {
    /// Maps a provider wire state onto the common lifecycle set.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "pending" | "starting" => Self::Pending,
            "running" => Self::Running,
            "stopping" | "shutting-down" => Self::Stopping,
            "stopped" | "stopped in place" => Self::Stopped,
            "terminated" | "archived" => Self::Terminated,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => formatter.write_str("pending"),
            Self::Running => formatter.write_str("running"),
            Self::Stopping => formatter.write_str("stopping"),
            Self::Stopped => formatter.write_str("stopped"),
            Self::Terminated => formatter.write_str("terminated"),
            Self::Other(raw) => formatter.write_str(raw),
        }
    }
}

/// State reported by the control plane for a data volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VolumeState {
    /// Detached and ready to attach.
    Available,
    /// Attached to an instance.
    InUse,
    /// Provider-specific state outside the common set.
    Other(String),
}

impl VolumeState {
    /// Maps a provider wire state onto the common set.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "available" => Self::Available,
            "in_use" | "in-use" => Self::InUse,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// A compute instance as reconstructed from a control-plane query.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// Volatile provider identifier; reassigned on recreate.
    pub id: String,
    /// Server name as shown by the provider.
    pub name: String,
    /// Availability zone hosting the instance.
    pub zone: String,
    /// Current lifecycle state.
    pub state: InstanceState,
    /// Public address, when one is bound.
    pub public_ip: Option<IpAddr>,
    /// Provider tags, including the identity labels.
    pub tags: Vec<String>,
    /// Identifiers of attached volumes.
    pub volume_ids: Vec<String>,
}

/// A durable data volume holding user project data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Volume {
    /// Provider identifier.
    pub id: String,
    /// Availability zone hosting the volume. Replacement instances must
    /// launch in this zone or the attach call is rejected.
    pub zone: String,
    /// Current attachment state.
    pub state: VolumeState,
    /// Provider tags, including the identity labels and, during recreate,
    /// the pending-attach marker.
    pub tags: Vec<String>,
    /// Instance the volume is currently attached to, if any.
    pub attached_to: Option<String>,
}

/// A stable network address reassignable between instances.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FloatingAddress {
    /// Provider identifier.
    pub id: String,
    /// The address itself.
    pub address: IpAddr,
    /// Availability zone owning the address.
    pub zone: String,
    /// Instance the address is currently bound to. A binding to a
    /// terminated instance is an expected intermediate state.
    pub bound_to: Option<String>,
    /// Provider tags, including the identity labels.
    pub tags: Vec<String>,
}

/// Parameters for launching a replacement instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchSpec {
    /// Server name (the stable VM name).
    pub name: String,
    /// Zone to launch in; must match the data volume's zone.
    pub zone: String,
    /// Concrete image identifier.
    pub image_id: String,
    /// Commercial type.
    pub instance_type: String,
    /// Security boundary resource for the owner.
    pub security_group_id: String,
    /// Identity labels and the initial bootstrap status tag.
    pub tags: Vec<String>,
    /// Provisioning script applied on first boot.
    pub user_data: String,
    /// Project identifier for billing and ownership.
    pub project_id: String,
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Operations the lifecycle orchestrator requires from a cloud control plane.
///
/// Queries filter by identity labels; mutations address resources by the
/// identifiers those queries returned within the same invocation.
pub trait CloudProvider {
    /// Provider-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Lists instances carrying the given owner and VM-name labels.
    fn find_instances<'a>(
        &'a self,
        owner: &'a str,
        vm_name: &'a str,
    ) -> ProviderFuture<'a, Vec<Instance>, Self::Error>;

    /// Fetches a single instance, or `None` once it has left the control
    /// plane.
    fn get_instance<'a>(
        &'a self,
        zone: &'a str,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<Instance>, Self::Error>;

    /// Requests a graceful OS-level stop.
    fn stop_instance<'a>(
        &'a self,
        zone: &'a str,
        id: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Destroys the instance.
    fn terminate_instance<'a>(
        &'a self,
        zone: &'a str,
        id: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Launches a new instance and returns its initial snapshot.
    fn launch_instance<'a>(
        &'a self,
        spec: &'a LaunchSpec,
    ) -> ProviderFuture<'a, Instance, Self::Error>;

    /// Lists volumes carrying the given owner and VM-name labels.
    fn find_volumes<'a>(
        &'a self,
        owner: &'a str,
        vm_name: &'a str,
    ) -> ProviderFuture<'a, Vec<Volume>, Self::Error>;

    /// Fetches a single volume, or `None` when it does not exist.
    fn get_volume<'a>(
        &'a self,
        zone: &'a str,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<Volume>, Self::Error>;

    /// Replaces the full tag set on a volume.
    fn replace_volume_tags<'a>(
        &'a self,
        zone: &'a str,
        id: &'a str,
        tags: &'a [String],
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Attaches a volume to an instance.
    fn attach_volume<'a>(
        &'a self,
        zone: &'a str,
        instance_id: &'a str,
        volume_id: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Detaches a volume from an instance.
    fn detach_volume<'a>(
        &'a self,
        zone: &'a str,
        instance_id: &'a str,
        volume_id: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Lists floating addresses carrying the given owner and VM-name labels.
    fn find_addresses<'a>(
        &'a self,
        owner: &'a str,
        vm_name: &'a str,
    ) -> ProviderFuture<'a, Vec<FloatingAddress>, Self::Error>;

    /// Releases an address's current binding.
    fn disassociate_address<'a>(
        &'a self,
        zone: &'a str,
        address_id: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Binds an address to an instance.
    fn associate_address<'a>(
        &'a self,
        zone: &'a str,
        address_id: &'a str,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Resolves an image label and architecture to a concrete image
    /// identifier in the given zone. Zero matches is an error.
    fn resolve_image<'a>(
        &'a self,
        label: &'a str,
        architecture: &'a str,
        zone: &'a str,
    ) -> ProviderFuture<'a, String, Self::Error>;

    /// Resolves the security boundary resource for an owner in the given
    /// zone. Zero matches is an error.
    fn resolve_security_group<'a>(
        &'a self,
        owner: &'a str,
        zone: &'a str,
    ) -> ProviderFuture<'a, String, Self::Error>;

    /// Pushes an ephemeral SSH public key to the instance through the
    /// provider's out-of-band key-injection channel, replacing any key
    /// pushed by a previous invocation.
    fn push_ephemeral_key<'a>(
        &'a self,
        zone: &'a str,
        instance_id: &'a str,
        public_key: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error>;
}
