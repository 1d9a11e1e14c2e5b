use std::{
    error::Error,
    fmt::{self, Display},
};

use thiserror::Error;

use crate::cluster::ClusterError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a warden-related operation.
pub type WardenResult<T> = Result<T, WardenError>;

/// An error that occurred while managing a server workload.
#[derive(Debug, Error)]
pub enum WardenError {
    /// A cluster operation performed by the environment controller failed.
    #[error("environment/kubernetes: {context}: {source}")]
    Environment {
        /// What the controller was doing when the call failed.
        context: String,
        /// The classified cluster failure.
        source: ClusterError,
    },

    /// A cluster operation performed by the installation process failed.
    #[error("install: {context}: {source}")]
    Install {
        /// What the installer was doing when the call failed.
        context: String,
        /// The classified cluster failure.
        source: ClusterError,
    },

    /// Another installation process already holds the per-server lock.
    #[error("install: cannot obtain installation lock")]
    InstallationLock,

    /// The installation pod terminated in a failed phase.
    #[error("install: {0}")]
    InstallFailed(String),

    /// The installation process was cancelled before it completed.
    #[error("install: installation process was cancelled")]
    InstallationCancelled,

    /// The server did not reach the offline state within the allotted time.
    #[error("environment/kubernetes: server did not stop within the allotted time")]
    StopTimeout,

    /// An error that occurred when parsing an environment variable pair.
    #[error("invalid environment variable pair: {0}")]
    InvalidEnvPair(String),

    /// An error that occurred when parsing a port binding.
    #[error("invalid port binding: {0}")]
    InvalidPortBinding(String),

    /// A cluster operation failed outside any specific component.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// An error that occurred when performing an IO operation.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A request to the panel failed.
    #[error("panel request failed: {0}")]
    Panel(String),

    /// Custom error.
    #[error("custom error: {0}")]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WardenError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> WardenError {
        WardenError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Wraps a cluster failure observed by the environment controller.
    pub fn environment(context: impl Into<String>, source: ClusterError) -> WardenError {
        WardenError::Environment {
            context: context.into(),
            source,
        }
    }

    /// Wraps a cluster failure observed by the installation process.
    pub fn install(context: impl Into<String>, source: ClusterError) -> WardenError {
        WardenError::Install {
            context: context.into(),
            source,
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
