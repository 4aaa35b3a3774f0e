//! Stateless resource location by identity labels.
//!
//! Every command reconstructs the VM's resource group fresh from the control
//! plane, filtering by the owner and VM-name labels. No identifier is ever
//! read from local state, and nothing found here outlives the invocation.

use thiserror::Error;

use crate::provider::{CloudProvider, FloatingAddress, Instance, Volume};

/// Errors raised while locating a VM's resources.
#[derive(Debug, Error)]
pub enum LocateError<ProviderError>
where
    ProviderError: std::error::Error + 'static,
{
    /// Raised when no instance carries the requested labels.
    #[error("no VM named '{vm_name}' found for owner '{owner}'")]
    InstanceNotFound {
        /// Ownership label used for the query.
        owner: String,
        /// VM name used for the query.
        vm_name: String,
    },
    /// Raised when the labels match more than one instance.
    #[error("{count} instances carry the labels for VM '{vm_name}'; refusing to guess")]
    InstanceAmbiguous {
        /// VM name used for the query.
        vm_name: String,
        /// Number of matching instances.
        count: usize,
    },
    /// Raised when no data volume carries the requested labels.
    #[error("no data volume found for VM '{vm_name}'; cannot recreate without one")]
    VolumeMissing {
        /// VM name used for the query.
        vm_name: String,
    },
    /// Raised when the labels match more than one volume.
    #[error("{count} data volumes carry the labels for VM '{vm_name}'; refusing to guess")]
    VolumeAmbiguous {
        /// VM name used for the query.
        vm_name: String,
        /// Number of matching volumes.
        count: usize,
    },
    /// Raised when the underlying control-plane query fails.
    #[error("control-plane query failed: {0}")]
    Provider(#[source] ProviderError),
}

/// Finds the single instance labelled with `owner` and `vm_name`.
///
/// # Errors
///
/// Returns [`LocateError::InstanceNotFound`] when no instance matches,
/// [`LocateError::InstanceAmbiguous`] when several do, and
/// [`LocateError::Provider`] when the query itself fails.
pub async fn locate_instance<P: CloudProvider>(
    provider: &P,
    owner: &str,
    vm_name: &str,
) -> Result<Instance, LocateError<P::Error>> {
    let mut instances = provider
        .find_instances(owner, vm_name)
        .await
        .map_err(LocateError::Provider)?;

    match instances.len() {
        0 => Err(LocateError::InstanceNotFound {
            owner: owner.to_owned(),
            vm_name: vm_name.to_owned(),
        }),
        1 => instances.pop().ok_or(LocateError::InstanceNotFound {
            owner: owner.to_owned(),
            vm_name: vm_name.to_owned(),
        }),
        count => Err(LocateError::InstanceAmbiguous {
            vm_name: vm_name.to_owned(),
            count,
        }),
    }
}

/// Finds the exactly-one data volume labelled with `owner` and `vm_name`.
///
/// Zero or multiple matches is a fatal cardinality violation; recreate must
/// fail loudly rather than guess which volume holds the user's data.
///
/// # Errors
///
/// Returns [`LocateError::VolumeMissing`], [`LocateError::VolumeAmbiguous`],
/// or [`LocateError::Provider`].
pub async fn locate_volume<P: CloudProvider>(
    provider: &P,
    owner: &str,
    vm_name: &str,
) -> Result<Volume, LocateError<P::Error>> {
    let mut volumes = provider
        .find_volumes(owner, vm_name)
        .await
        .map_err(LocateError::Provider)?;

    match volumes.len() {
        0 => Err(LocateError::VolumeMissing {
            vm_name: vm_name.to_owned(),
        }),
        1 => volumes.pop().ok_or(LocateError::VolumeMissing {
            vm_name: vm_name.to_owned(),
        }),
        count => Err(LocateError::VolumeAmbiguous {
            vm_name: vm_name.to_owned(),
            count,
        }),
    }
}

/// Finds the floating address labelled with `owner` and `vm_name`, if any.
///
/// A VM without a stable address is a supported configuration, so absence is
/// `Ok(None)` rather than an error. When several addresses match, the first
/// one returned by the provider is used.
///
/// # Errors
///
/// Returns [`LocateError::Provider`] when the query fails.
pub async fn locate_address<P: CloudProvider>(
    provider: &P,
    owner: &str,
    vm_name: &str,
) -> Result<Option<FloatingAddress>, LocateError<P::Error>> {
    let mut addresses = provider
        .find_addresses(owner, vm_name)
        .await
        .map_err(LocateError::Provider)?;

    if addresses.is_empty() {
        return Ok(None);
    }
    Ok(Some(addresses.remove(0)))
}
