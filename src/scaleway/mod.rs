//! Scaleway Instance API implementation of the control-plane abstraction.
//!
//! All calls are zone-scoped REST requests authenticated with the account's
//! secret key. Ephemeral SSH keys are injected through server tags, which
//! the Scaleway agent on the instance merges into the user's
//! `authorized_keys`; tag values cannot contain spaces, so the OpenSSH
//! encoding is carried with spaces replaced by underscores.

mod types;

use std::collections::BTreeMap;

use reqwest::{Client, Method, header};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::provider::{
    CloudProvider, FloatingAddress, Instance, LaunchSpec, ProviderFuture, Volume,
};

use types::{
    ImageWire, ImagesResponse, IpsResponse, SecurityGroupsResponse, ServerResponse,
    ServersResponse, VolumeRefWire, VolumeResponse, VolumesResponse,
};

const API_BASE: &str = "https://api.scaleway.com/instance/v1";
const AUTH_HEADER: &str = "X-Auth-Token";
const AUTHORIZED_KEY_PREFIX: &str = "AUTHORIZED_KEY=";
const SECURITY_GROUP_PREFIX: &str = "ostriv-";

/// Errors raised by the Scaleway control-plane client.
#[derive(Debug, Error)]
pub enum ScalewayError {
    /// Raised when the HTTP client cannot be constructed.
    #[error("could not build HTTP client: {message}")]
    Client {
        /// Underlying builder error.
        message: String,
    },
    /// Raised when a request fails before an HTTP response arrives.
    #[error("request to {endpoint} failed: {message}")]
    Transport {
        /// Endpoint that was being called.
        endpoint: String,
        /// Underlying transport error.
        message: String,
    },
    /// Raised when the API answers with a non-success status.
    #[error("{endpoint} returned HTTP {status}: {body}")]
    Api {
        /// Endpoint that was called.
        endpoint: String,
        /// HTTP status code.
        status: u16,
        /// Response body, verbatim.
        body: String,
    },
    /// Raised when a response body cannot be decoded.
    #[error("could not decode response from {endpoint}: {message}")]
    Decode {
        /// Endpoint that was called.
        endpoint: String,
        /// What failed to decode.
        message: String,
    },
    /// Raised when no available image matches the label and architecture.
    #[error("no available image matches '{label}' for {architecture} in {zone}")]
    ImageNotFound {
        /// Image label from the configuration.
        label: String,
        /// Requested architecture.
        architecture: String,
        /// Zone that was searched.
        zone: String,
    },
    /// Raised when the owner's security group does not exist.
    #[error(
        "security group '{SECURITY_GROUP_PREFIX}{owner}' not found in {zone}; \
         create it before recreating the VM"
    )]
    SecurityGroupNotFound {
        /// Ownership label.
        owner: String,
        /// Zone that was searched.
        zone: String,
    },
}

/// Scaleway-backed control plane.
#[derive(Clone, Debug)]
pub struct ScalewayProvider {
    client: Client,
    base_url: String,
    secret_key: String,
    project_id: String,
    /// Zone used for the tag-filtered list queries.
    query_zone: String,
}

impl ScalewayProvider {
    /// Creates a client authenticated with `secret_key`, listing resources
    /// in `query_zone`.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayError::Client`] when the HTTP client cannot be
    /// built.
    pub fn new(
        secret_key: impl Into<String>,
        project_id: impl Into<String>,
        query_zone: impl Into<String>,
    ) -> Result<Self, ScalewayError> {
        let client = Client::builder()
            .build()
            .map_err(|err| ScalewayError::Client {
                message: err.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: String::from(API_BASE),
            secret_key: secret_key.into(),
            project_id: project_id.into(),
            query_zone: query_zone.into(),
        })
    }

    fn url(&self, zone: &str, path: &str) -> String {
        format!("{}/zones/{zone}/{path}", self.base_url)
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, ScalewayError> {
        debug!(%method, url, "scaleway api call");
        let mut request = self
            .client
            .request(method, url)
            .header(AUTH_HEADER, &self.secret_key);
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|err| ScalewayError::Transport {
                endpoint: url.to_owned(),
                message: err.to_string(),
            })
    }

    async fn expect_success(
        url: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ScalewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ScalewayError::Api {
            endpoint: url.to_owned(),
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: DeserializeOwned>(
        url: &str,
        response: reqwest::Response,
    ) -> Result<T, ScalewayError> {
        response.json().await.map_err(|err| ScalewayError::Decode {
            endpoint: url.to_owned(),
            message: err.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned + Send>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ScalewayError> {
        debug!(url, "scaleway api query");
        let response = self
            .client
            .get(url)
            .header(AUTH_HEADER, &self.secret_key)
            .query(query)
            .send()
            .await
            .map_err(|err| ScalewayError::Transport {
                endpoint: url.to_owned(),
                message: err.to_string(),
            })?;
        let response = Self::expect_success(url, response).await?;
        Self::decode(url, response).await
    }

    /// GET that treats 404 as absence.
    async fn get_optional<T: DeserializeOwned + Send>(
        &self,
        url: &str,
    ) -> Result<Option<T>, ScalewayError> {
        let response = self.send(Method::GET, url, None).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::expect_success(url, response).await?;
        Ok(Some(Self::decode(url, response).await?))
    }

    async fn post_action(&self, zone: &str, id: &str, action: &str) -> Result<(), ScalewayError> {
        let url = self.url(zone, &format!("servers/{id}/action"));
        let response = self
            .send(Method::POST, &url, Some(&json!({ "action": action })))
            .await?;
        Self::expect_success(&url, response).await?;
        Ok(())
    }

    async fn patch(&self, url: &str, body: &Value) -> Result<(), ScalewayError> {
        let response = self.send(Method::PATCH, url, Some(body)).await?;
        Self::expect_success(url, response).await?;
        Ok(())
    }

    async fn fetch_server(
        &self,
        zone: &str,
        id: &str,
    ) -> Result<Option<types::ServerWire>, ScalewayError> {
        let url = self.url(zone, &format!("servers/{id}"));
        let response: Option<ServerResponse> = self.get_optional(&url).await?;
        Ok(response.map(|wrapped| wrapped.server))
    }

    fn identity_query(owner: &str, vm_name: &str) -> [(&'static str, String); 1] {
        [(
            "tags",
            format!(
                "{},{}",
                crate::provider::tag(crate::provider::OWNER_TAG, owner),
                crate::provider::tag(crate::provider::VM_NAME_TAG, vm_name)
            ),
        )]
    }

    async fn set_user_data(
        &self,
        zone: &str,
        id: &str,
        user_data: &str,
    ) -> Result<(), ScalewayError> {
        let url = self.url(zone, &format!("servers/{id}/user_data/cloud-init"));
        let response = self
            .client
            .patch(&url)
            .header(AUTH_HEADER, &self.secret_key)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(user_data.to_owned())
            .send()
            .await
            .map_err(|err| ScalewayError::Transport {
                endpoint: url.clone(),
                message: err.to_string(),
            })?;
        Self::expect_success(&url, response).await?;
        Ok(())
    }
}

/// Renders the key-injection tag; tag values cannot hold spaces.
fn authorized_key_tag(public_key: &str) -> String {
    format!(
        "{AUTHORIZED_KEY_PREFIX}{}",
        public_key.trim().replace(' ', "_")
    )
}

/// Picks the newest available image for the architecture.
fn pick_image(mut images: Vec<ImageWire>, architecture: &str) -> Option<String> {
    images.retain(|image| image.arch == architecture && image.state == "available");
    images.sort_by(|a, b| b.creation_date.cmp(&a.creation_date));
    images.into_iter().next().map(|image| image.id)
}

/// Rebuilds a server's volume map with `volume_id` in the first free slot.
fn volume_map_with(existing: &BTreeMap<String, VolumeRefWire>, volume_id: &str) -> Value {
    let mut map = serde_json::Map::new();
    for (slot, volume) in existing {
        map.insert(slot.clone(), json!({ "id": volume.id }));
    }
    let mut slot: u32 = 0;
    while map.contains_key(&slot.to_string()) {
        slot += 1;
    }
    map.insert(slot.to_string(), json!({ "id": volume_id }));
    Value::Object(map)
}

/// Rebuilds a server's volume map without `volume_id`.
fn volume_map_without(existing: &BTreeMap<String, VolumeRefWire>, volume_id: &str) -> Value {
    let mut map = serde_json::Map::new();
    for (slot, volume) in existing {
        if volume.id != volume_id {
            map.insert(slot.clone(), json!({ "id": volume.id }));
        }
    }
    Value::Object(map)
}

impl CloudProvider for ScalewayProvider {
    type Error = ScalewayError;

    fn find_instances<'a>(
        &'a self,
        owner: &'a str,
        vm_name: &'a str,
    ) -> ProviderFuture<'a, Vec<Instance>, ScalewayError> {
        Box::pin(async move {
            let url = self.url(&self.query_zone, "servers");
            let response: ServersResponse = self
                .get_json(&url, &Self::identity_query(owner, vm_name))
                .await?;
            response
                .servers
                .into_iter()
                .map(|server| server.into_instance(&url))
                .collect()
        })
    }

    fn get_instance<'a>(
        &'a self,
        zone: &'a str,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<Instance>, ScalewayError> {
        Box::pin(async move {
            let url = self.url(zone, &format!("servers/{id}"));
            let Some(server) = self.fetch_server(zone, id).await? else {
                return Ok(None);
            };
            server.into_instance(&url).map(Some)
        })
    }

    fn stop_instance<'a>(
        &'a self,
        zone: &'a str,
        id: &'a str,
    ) -> ProviderFuture<'a, (), ScalewayError> {
        Box::pin(self.post_action(zone, id, "poweroff"))
    }

    fn terminate_instance<'a>(
        &'a self,
        zone: &'a str,
        id: &'a str,
    ) -> ProviderFuture<'a, (), ScalewayError> {
        Box::pin(self.post_action(zone, id, "terminate"))
    }

    fn launch_instance<'a>(
        &'a self,
        spec: &'a LaunchSpec,
    ) -> ProviderFuture<'a, Instance, ScalewayError> {
        Box::pin(async move {
            let url = self.url(&spec.zone, "servers");
            let body = json!({
                "name": spec.name,
                "commercial_type": spec.instance_type,
                "image": spec.image_id,
                "tags": spec.tags,
                "security_group": spec.security_group_id,
                "project": self.project_id,
                "dynamic_ip_required": true,
            });
            let response = self.send(Method::POST, &url, Some(&body)).await?;
            let response = Self::expect_success(&url, response).await?;
            let created: ServerResponse = Self::decode(&url, response).await?;

            self.set_user_data(&spec.zone, &created.server.id, &spec.user_data)
                .await?;
            self.post_action(&spec.zone, &created.server.id, "poweron")
                .await?;
            created.server.into_instance(&url)
        })
    }

    fn find_volumes<'a>(
        &'a self,
        owner: &'a str,
        vm_name: &'a str,
    ) -> ProviderFuture<'a, Vec<Volume>, ScalewayError> {
        Box::pin(async move {
            let url = self.url(&self.query_zone, "volumes");
            let response: VolumesResponse = self
                .get_json(&url, &Self::identity_query(owner, vm_name))
                .await?;
            Ok(response
                .volumes
                .into_iter()
                .map(types::VolumeWire::into_volume)
                .collect())
        })
    }

    fn get_volume<'a>(
        &'a self,
        zone: &'a str,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<Volume>, ScalewayError> {
        Box::pin(async move {
            let url = self.url(zone, &format!("volumes/{id}"));
            let response: Option<VolumeResponse> = self.get_optional(&url).await?;
            Ok(response.map(|wrapped| wrapped.volume.into_volume()))
        })
    }

    fn replace_volume_tags<'a>(
        &'a self,
        zone: &'a str,
        id: &'a str,
        tags: &'a [String],
    ) -> ProviderFuture<'a, (), ScalewayError> {
        Box::pin(async move {
            let url = self.url(zone, &format!("volumes/{id}"));
            self.patch(&url, &json!({ "tags": tags })).await
        })
    }

    fn attach_volume<'a>(
        &'a self,
        zone: &'a str,
        instance_id: &'a str,
        volume_id: &'a str,
    ) -> ProviderFuture<'a, (), ScalewayError> {
        Box::pin(async move {
            let url = self.url(zone, &format!("servers/{instance_id}"));
            let server =
                self.fetch_server(zone, instance_id)
                    .await?
                    .ok_or_else(|| ScalewayError::Api {
                        endpoint: url.clone(),
                        status: 404,
                        body: format!("server {instance_id} not found"),
                    })?;
            let volumes = volume_map_with(&server.volumes, volume_id);
            self.patch(&url, &json!({ "volumes": volumes })).await
        })
    }

    fn detach_volume<'a>(
        &'a self,
        zone: &'a str,
        instance_id: &'a str,
        volume_id: &'a str,
    ) -> ProviderFuture<'a, (), ScalewayError> {
        Box::pin(async move {
            let url = self.url(zone, &format!("servers/{instance_id}"));
            let Some(server) = self.fetch_server(zone, instance_id).await? else {
                // Server already gone; the volume is free by definition.
                return Ok(());
            };
            let volumes = volume_map_without(&server.volumes, volume_id);
            self.patch(&url, &json!({ "volumes": volumes })).await
        })
    }

    fn find_addresses<'a>(
        &'a self,
        owner: &'a str,
        vm_name: &'a str,
    ) -> ProviderFuture<'a, Vec<FloatingAddress>, ScalewayError> {
        Box::pin(async move {
            let url = self.url(&self.query_zone, "ips");
            let response: IpsResponse = self
                .get_json(&url, &Self::identity_query(owner, vm_name))
                .await?;
            response
                .ips
                .into_iter()
                .map(|ip| ip.into_address(&url))
                .collect()
        })
    }

    fn disassociate_address<'a>(
        &'a self,
        zone: &'a str,
        address_id: &'a str,
    ) -> ProviderFuture<'a, (), ScalewayError> {
        Box::pin(async move {
            let url = self.url(zone, &format!("ips/{address_id}"));
            self.patch(&url, &json!({ "server": Value::Null })).await
        })
    }

    fn associate_address<'a>(
        &'a self,
        zone: &'a str,
        address_id: &'a str,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, (), ScalewayError> {
        Box::pin(async move {
            let url = self.url(zone, &format!("ips/{address_id}"));
            self.patch(&url, &json!({ "server": instance_id })).await
        })
    }

    fn resolve_image<'a>(
        &'a self,
        label: &'a str,
        architecture: &'a str,
        zone: &'a str,
    ) -> ProviderFuture<'a, String, ScalewayError> {
        Box::pin(async move {
            let url = self.url(zone, "images");
            let response: ImagesResponse = self
                .get_json(&url, &[("name", label.to_owned())])
                .await?;
            pick_image(response.images, architecture).ok_or_else(|| {
                ScalewayError::ImageNotFound {
                    label: label.to_owned(),
                    architecture: architecture.to_owned(),
                    zone: zone.to_owned(),
                }
            })
        })
    }

    fn resolve_security_group<'a>(
        &'a self,
        owner: &'a str,
        zone: &'a str,
    ) -> ProviderFuture<'a, String, ScalewayError> {
        Box::pin(async move {
            let url = self.url(zone, "security_groups");
            let response: SecurityGroupsResponse = self.get_json(&url, &[]).await?;
            let wanted = format!("{SECURITY_GROUP_PREFIX}{owner}");
            response
                .security_groups
                .into_iter()
                .find(|group| group.name == wanted)
                .map(|group| group.id)
                .ok_or_else(|| ScalewayError::SecurityGroupNotFound {
                    owner: owner.to_owned(),
                    zone: zone.to_owned(),
                })
        })
    }

    fn push_ephemeral_key<'a>(
        &'a self,
        zone: &'a str,
        instance_id: &'a str,
        public_key: &'a str,
    ) -> ProviderFuture<'a, (), ScalewayError> {
        Box::pin(async move {
            let url = self.url(zone, &format!("servers/{instance_id}"));
            let server =
                self.fetch_server(zone, instance_id)
                    .await?
                    .ok_or_else(|| ScalewayError::Api {
                        endpoint: url.clone(),
                        status: 404,
                        body: format!("server {instance_id} not found"),
                    })?;
            // Replace any key pushed by a previous invocation.
            let mut tags: Vec<String> = server
                .tags
                .into_iter()
                .filter(|entry| !entry.starts_with(AUTHORIZED_KEY_PREFIX))
                .collect();
            tags.push(authorized_key_tag(public_key));
            self.patch(&url, &json!({ "tags": tags })).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(id: &str, arch: &str, state: &str, created: &str) -> ImageWire {
        ImageWire {
            id: id.to_owned(),
            arch: arch.to_owned(),
            state: state.to_owned(),
            creation_date: created.to_owned(),
        }
    }

    #[test]
    fn pick_image_prefers_newest_available_for_arch() {
        let images = vec![
            image("img-old", "x86_64", "available", "2024-01-01T00:00:00Z"),
            image("img-new", "x86_64", "available", "2025-06-01T00:00:00Z"),
            image("img-arm", "arm64", "available", "2025-07-01T00:00:00Z"),
            image("img-broken", "x86_64", "error", "2025-08-01T00:00:00Z"),
        ];
        assert_eq!(pick_image(images, "x86_64"), Some(String::from("img-new")));
    }

    #[test]
    fn pick_image_returns_none_when_nothing_matches() {
        let images = vec![image("img-arm", "arm64", "available", "2025-01-01T00:00:00Z")];
        assert_eq!(pick_image(images, "x86_64"), None);
    }

    #[test]
    fn authorized_key_tag_replaces_spaces() {
        let tag = authorized_key_tag("ssh-ed25519 AAAAC3Nza comment\n");
        assert_eq!(tag, "AUTHORIZED_KEY=ssh-ed25519_AAAAC3Nza_comment");
        assert!(!tag.contains(' '));
    }

    fn slots(entries: &[(&str, &str)]) -> BTreeMap<String, VolumeRefWire> {
        entries
            .iter()
            .map(|(slot, id)| {
                ((*slot).to_owned(), VolumeRefWire { id: (*id).to_owned() })
            })
            .collect()
    }

    #[test]
    fn volume_map_with_uses_first_free_slot() {
        let existing = slots(&[("0", "vol-root")]);
        let map = volume_map_with(&existing, "vol-data");
        assert_eq!(map, serde_json::json!({
            "0": { "id": "vol-root" },
            "1": { "id": "vol-data" },
        }));
    }

    #[test]
    fn volume_map_without_drops_only_the_named_volume() {
        let existing = slots(&[("0", "vol-root"), ("1", "vol-data")]);
        let map = volume_map_without(&existing, "vol-data");
        assert_eq!(map, serde_json::json!({ "0": { "id": "vol-root" } }));
    }
}
