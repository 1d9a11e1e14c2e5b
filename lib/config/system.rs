use std::path::PathBuf;

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default directory where server data volumes are tracked.
pub const DEFAULT_DATA_DIRECTORY: &str = "/var/lib/warden/volumes";

/// The default directory for transient installation files.
pub const DEFAULT_TMP_DIRECTORY: &str = "/tmp/warden";

/// The default directory where persisted logs are written.
pub const DEFAULT_LOG_DIRECTORY: &str = "/var/log/warden";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Settings for the host system the agent runs on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SystemConfig {
    /// The user server processes run as.
    #[serde(default)]
    #[builder(default)]
    pub(crate) user: UserConfig,

    /// The directory where per-server data directories are created.
    #[serde(default = "default_data_directory")]
    #[builder(default = default_data_directory())]
    pub(crate) data_directory: PathBuf,

    /// The directory transient installation scripts are written to.
    #[serde(default = "default_tmp_directory")]
    #[builder(default = default_tmp_directory())]
    pub(crate) tmp_directory: PathBuf,

    /// The directory persisted logs (e.g. install output) are written to.
    #[serde(default = "default_log_directory")]
    #[builder(default = default_log_directory())]
    pub(crate) log_directory: PathBuf,
}

/// The user identity server containers run with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct UserConfig {
    /// The user id containers run as.
    #[serde(default)]
    #[builder(default)]
    pub(crate) uid: i64,

    /// The group id containers run as.
    #[serde(default)]
    #[builder(default)]
    pub(crate) gid: i64,

    /// Rootless overrides for the container user.
    #[serde(default)]
    #[builder(default)]
    pub(crate) rootless: RootlessConfig,
}

/// Rootless mode settings.
///
/// When enabled, containers run as the configured non-privileged user instead
/// of the system user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct RootlessConfig {
    /// Whether rootless mode is enabled.
    #[serde(default)]
    #[builder(default)]
    pub(crate) enabled: bool,

    /// The user id containers run as in rootless mode.
    #[serde(default)]
    #[builder(default)]
    pub(crate) container_uid: i64,

    /// The group id containers run as in rootless mode.
    #[serde(default)]
    #[builder(default)]
    pub(crate) container_gid: i64,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_data_directory() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIRECTORY)
}

fn default_tmp_directory() -> PathBuf {
    PathBuf::from(DEFAULT_TMP_DIRECTORY)
}

fn default_log_directory() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_DIRECTORY)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            user: UserConfig::default(),
            data_directory: default_data_directory(),
            tmp_directory: default_tmp_directory(),
            log_directory: default_log_directory(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_config_defaults() {
        let config = SystemConfig::default();
        assert_eq!(config.get_tmp_directory(), &PathBuf::from(DEFAULT_TMP_DIRECTORY));
        assert_eq!(config.get_log_directory(), &PathBuf::from(DEFAULT_LOG_DIRECTORY));
        assert!(!config.get_user().get_rootless().get_enabled());
    }

    #[test]
    fn test_system_config_deserialize_partial() -> anyhow::Result<()> {
        let config: SystemConfig = serde_json::from_str(
            r#"{"user": {"uid": 988, "gid": 988}, "tmp_directory": "/scratch"}"#,
        )?;
        assert_eq!(*config.get_user().get_uid(), 988);
        assert_eq!(config.get_tmp_directory(), &PathBuf::from("/scratch"));
        assert_eq!(config.get_log_directory(), &PathBuf::from(DEFAULT_LOG_DIRECTORY));
        Ok(())
    }
}
