use std::{collections::HashMap, path::PathBuf};

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::config::EnvPair;

use super::{Allocation, ResourceLimits};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The slice of a server's definition the environment controller needs to
/// materialise and run its workload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Settings {
    /// The container image the server process runs from.
    #[serde(default)]
    #[builder(default, setter(into))]
    image: String,

    /// How the server process is asked to stop.
    #[serde(default)]
    #[builder(default)]
    stop: StopConfiguration,

    /// Environment variables injected into the server and installer
    /// containers. Pairs with an empty name or value are not forwarded.
    #[serde(default)]
    #[builder(default)]
    environment: Vec<EnvPair>,

    /// The ports the server exposes.
    #[serde(default)]
    #[builder(default)]
    allocation: Allocation,

    /// Resource quotas for the workload.
    #[serde(default)]
    #[builder(default)]
    limits: ResourceLimits,

    /// Additional host paths mounted into the workload.
    #[serde(default)]
    #[builder(default)]
    mounts: Vec<Mount>,

    /// User-provided labels attached to the runtime pod. Reserved label keys
    /// are overwritten by the controller.
    #[serde(default)]
    #[builder(default)]
    labels: HashMap<String, String>,
}

/// How a server process is asked to stop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct StopConfiguration {
    /// The mechanism used to stop the process.
    #[serde(rename = "type", default)]
    #[builder(default)]
    method: StopMethod,

    /// The console command or signal name, depending on the method.
    #[serde(default)]
    #[builder(default, setter(into))]
    value: String,
}

/// The mechanism used to stop a server process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopMethod {
    /// Ask the orchestrator to stop the workload.
    #[default]
    Stop,

    /// Write a command to the process console.
    Command,

    /// Deliver a signal to the process.
    Signal,
}

/// One host path mounted into a server's containers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Mount {
    /// The host path to mount.
    #[builder(setter(into))]
    source: PathBuf,

    /// The path inside the container.
    #[builder(setter(into))]
    target: String,

    /// Whether the container sees the mount read-only.
    #[serde(default)]
    #[builder(default)]
    read_only: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl StopConfiguration {
    /// Whether sending `command` to the console is what stops this server.
    pub fn is_stop_command(&self, command: &str) -> bool {
        self.method == StopMethod::Command && self.value == command
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
