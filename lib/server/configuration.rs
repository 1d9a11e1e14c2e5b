use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::environment::Settings;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A server's definition as handed over by the panel.
///
/// Treated as an immutable snapshot for the duration of one lifecycle
/// operation; a sync with the panel replaces it wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ServerConfiguration {
    /// The server's unique identifier.
    #[builder(setter(into))]
    uuid: String,

    /// Whether the panel asked for installation scripts to be skipped for
    /// this server.
    #[serde(default)]
    #[builder(default)]
    skip_egg_scripts: bool,

    /// Everything the environment controller needs to run the workload.
    #[serde(flatten)]
    #[builder(default)]
    settings: Settings,
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
