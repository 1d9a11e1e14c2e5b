//! Agent configuration types.
//!
//! Loading the configuration from disk belongs to the daemon entrypoint; the
//! core only consumes these in-memory types.

mod cluster;
mod env_pair;
mod system;

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The full agent configuration consumed by the core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct AgentConfig {
    /// Settings for the cluster the agent schedules workloads on.
    #[serde(default)]
    #[builder(default)]
    pub(crate) cluster: ClusterConfig,

    /// Settings for the host system the agent runs on.
    #[serde(default)]
    #[builder(default)]
    pub(crate) system: SystemConfig,
}

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use cluster::*;
pub use env_pair::*;
pub use system::*;
