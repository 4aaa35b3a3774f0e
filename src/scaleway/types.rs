//! Wire representations of Scaleway Instance API payloads.
//!
//! These structs mirror only the fields the provider reads; unknown fields
//! are ignored on deserialization.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::Deserialize;

use crate::provider::{FloatingAddress, Instance, InstanceState, Volume, VolumeState};

use super::ScalewayError;

#[derive(Debug, Deserialize)]
pub(crate) struct ServersResponse {
    pub servers: Vec<ServerWire>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerResponse {
    pub server: ServerWire,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerWire {
    pub id: String,
    pub name: String,
    pub zone: String,
    pub state: String,
    pub public_ip: Option<PublicIpWire>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Attached volumes keyed by slot ("0" is the root volume).
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeRefWire>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublicIpWire {
    pub address: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VolumeRefWire {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VolumesResponse {
    pub volumes: Vec<VolumeWire>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VolumeResponse {
    pub volume: VolumeWire,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VolumeWire {
    pub id: String,
    pub zone: String,
    pub state: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub server: Option<ServerRefWire>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerRefWire {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IpsResponse {
    pub ips: Vec<IpWire>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IpWire {
    pub id: String,
    pub address: String,
    pub zone: String,
    pub server: Option<ServerRefWire>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImagesResponse {
    pub images: Vec<ImageWire>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImageWire {
    pub id: String,
    pub arch: String,
    pub state: String,
    pub creation_date: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SecurityGroupsResponse {
    pub security_groups: Vec<SecurityGroupWire>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SecurityGroupWire {
    pub id: String,
    pub name: String,
}

fn parse_address(endpoint: &str, raw: &str) -> Result<IpAddr, ScalewayError> {
    raw.parse().map_err(|_| ScalewayError::Decode {
        endpoint: endpoint.to_owned(),
        message: format!("'{raw}' is not an IP address"),
    })
}

impl ServerWire {
    pub(crate) fn into_instance(self, endpoint: &str) -> Result<Instance, ScalewayError> {
        let public_ip = self
            .public_ip
            .map(|ip| parse_address(endpoint, &ip.address))
            .transpose()?;
        Ok(Instance {
            id: self.id,
            name: self.name,
            zone: self.zone,
            state: InstanceState::parse(&self.state),
            public_ip,
            tags: self.tags,
            volume_ids: self.volumes.into_values().map(|slot| slot.id).collect(),
        })
    }
}

impl VolumeWire {
    pub(crate) fn into_volume(self) -> Volume {
        Volume {
            id: self.id,
            zone: self.zone,
            state: VolumeState::parse(&self.state),
            tags: self.tags,
            attached_to: self.server.map(|server| server.id),
        }
    }
}

impl IpWire {
    pub(crate) fn into_address(self, endpoint: &str) -> Result<FloatingAddress, ScalewayError> {
        let address = parse_address(endpoint, &self.address)?;
        Ok(FloatingAddress {
            id: self.id,
            address,
            zone: self.zone,
            bound_to: self.server.map(|server| server.id),
            tags: self.tags,
        })
    }
}
