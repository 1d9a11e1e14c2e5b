//! Capabilities the core requires from the control plane.
//!
//! The panel owns the source of truth for server definitions; the HTTP client
//! that talks to it lives with the API layer. The core depends only on this
//! trait so coordination logic stays independent of the wire protocol.

use async_trait::async_trait;
use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{server::ServerConfiguration, WardenResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An installation script definition fetched from the panel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct InstallationScript {
    /// The image the installer container runs from.
    #[serde(default)]
    #[builder(default, setter(into))]
    container_image: String,

    /// The interpreter the script was written for.
    #[serde(default)]
    #[builder(default, setter(into))]
    entrypoint: String,

    /// The script body.
    #[serde(default)]
    #[builder(default, setter(into))]
    script: String,
}

/// The terminal status of an installation, reported back to the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallStatusRequest {
    /// Whether the installation completed successfully.
    pub successful: bool,

    /// Whether this was a reinstall of an existing server.
    pub reinstall: bool,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The panel operations the coordinator depends on.
#[async_trait]
pub trait PanelClient: Send + Sync {
    /// Fetches the installation script for a server.
    async fn installation_script(&self, uuid: &str) -> WardenResult<InstallationScript>;

    /// Reports the terminal status of an installation.
    async fn set_installation_status(
        &self,
        uuid: &str,
        status: InstallStatusRequest,
    ) -> WardenResult<()>;

    /// Fetches the current configuration snapshot for a server.
    async fn server_configuration(&self, uuid: &str) -> WardenResult<ServerConfiguration>;
}
