//! Configuration loading via `ortho-config`.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Ostriv configuration derived from defaults, configuration files,
/// environment variables, and CLI flags, in that order of precedence.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "OSTRIV")]
pub struct OstrivConfig {
    /// Secret key used to authenticate against the cloud control plane.
    pub secret_key: String,
    /// Project identifier used for billing and resource scoping.
    pub project_id: String,
    /// Ownership label stamped on every managed resource. Resources are
    /// rediscovered by this label on every invocation; nothing is cached.
    pub owner: String,
    /// Availability zone used for tag-filtered resource queries.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub zone: String,
    /// Human-friendly image label resolved to a concrete image at launch.
    #[ortho_config(default = "Ubuntu 24.04 Noble Numbat".to_owned())]
    pub image: String,
    /// CPU architecture used to select the correct image variant.
    #[ortho_config(default = "x86_64".to_owned())]
    pub architecture: String,
    /// Commercial type for replacement instances.
    #[ortho_config(default = "DEV1-M".to_owned())]
    pub instance_type: String,
    /// Remote user for SSH connections to the workspace VM.
    #[ortho_config(default = "dev".to_owned())]
    pub ssh_user: String,
    /// Process name the container activity probe searches for.
    #[ortho_config(default = "claude".to_owned())]
    pub assistant_process: String,
    /// Path to the provisioning script handed to replacement instances.
    pub bootstrap_script: String,
    /// Pinned SHA-256 digest (hex) of the provisioning script.
    pub bootstrap_script_sha256: String,
    /// Optional override for the host trust store location.
    pub trust_store_path: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl OstrivConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to ostriv.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("ostriv")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields. Error messages include
    /// guidance on how to provide missing values via environment variables or
    /// the configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.secret_key,
            &FieldMetadata::new("API secret key", "OSTRIV_SECRET_KEY", "secret_key"),
        )?;
        Self::require_field(
            &self.project_id,
            &FieldMetadata::new("project ID", "OSTRIV_PROJECT_ID", "project_id"),
        )?;
        Self::require_field(
            &self.owner,
            &FieldMetadata::new("ownership label", "OSTRIV_OWNER", "owner"),
        )?;
        Self::require_field(
            &self.zone,
            &FieldMetadata::new("availability zone", "OSTRIV_ZONE", "zone"),
        )?;
        Self::require_field(
            &self.image,
            &FieldMetadata::new("VM image label", "OSTRIV_IMAGE", "image"),
        )?;
        Self::require_field(
            &self.architecture,
            &FieldMetadata::new("CPU architecture", "OSTRIV_ARCHITECTURE", "architecture"),
        )?;
        Self::require_field(
            &self.instance_type,
            &FieldMetadata::new("instance type", "OSTRIV_INSTANCE_TYPE", "instance_type"),
        )?;
        Self::require_field(
            &self.ssh_user,
            &FieldMetadata::new("SSH user", "OSTRIV_SSH_USER", "ssh_user"),
        )?;
        Self::require_field(
            &self.bootstrap_script,
            &FieldMetadata::new(
                "provisioning script path",
                "OSTRIV_BOOTSTRAP_SCRIPT",
                "bootstrap_script",
            ),
        )?;
        Self::require_field(
            &self.bootstrap_script_sha256,
            &FieldMetadata::new(
                "provisioning script digest",
                "OSTRIV_BOOTSTRAP_SCRIPT_SHA256",
                "bootstrap_script_sha256",
            ),
        )?;
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
