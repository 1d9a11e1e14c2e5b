//! Thin capability surface over the orchestration API.
//!
//! The rest of the crate never talks to the cluster directly; it goes through
//! the [`ClusterApi`] trait so that lifecycle logic can be exercised against
//! an in-memory double. [`KubeCluster`] is the production implementation.

use std::pin::Pin;

use async_trait::async_trait;
use futures::io::AsyncBufRead;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod kube;

#[cfg(test)]
pub(crate) mod fake;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a cluster API call.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// A streaming read handle over a pod's log output.
pub type LogStream = Pin<Box<dyn AsyncBufRead + Send>>;

/// Classified failures of the orchestration API.
///
/// Callers treat `NotFound` on delete as success, and `AlreadyExists` on
/// create as success when their intent is idempotent provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    /// The object does not exist.
    #[error("object not found")]
    NotFound,

    /// An object with the same name already exists.
    #[error("object already exists")]
    AlreadyExists,

    /// The write conflicted with a concurrent update.
    #[error("conflicting update: {0}")]
    Conflict(String),

    /// A retryable failure: network, timeout or cluster throttling.
    #[error("transient cluster error: {0}")]
    Transient(String),

    /// A failure that will not resolve by retrying.
    #[error("cluster request failed: {0}")]
    Fatal(String),
}

/// Options for a pod log request.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    /// Keep the stream open and follow new output.
    pub follow: bool,

    /// Only return the last N lines of output.
    pub tail_lines: Option<i64>,
}

/// The coarse lifecycle phase of a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    /// Accepted but not all containers are running yet.
    Pending,

    /// All containers have started.
    Running,

    /// All containers terminated successfully.
    Succeeded,

    /// At least one container terminated in failure.
    Failed,

    /// The phase could not be determined.
    Unknown,
}

/// A point-in-time usage sample for a pod, summed over its containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStats {
    /// CPU usage in nanocores.
    pub cpu_nanocores: u64,

    /// Working-set memory in bytes.
    pub memory_bytes: u64,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The capabilities the agent requires from the orchestration API.
///
/// All operations are scoped to the namespace the implementation was
/// constructed with. Deletions are issued with a zero grace period and
/// foreground propagation.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Creates a pod.
    async fn pod_create(&self, pod: Pod) -> ClusterResult<Pod>;

    /// Fetches a pod by name.
    async fn pod_get(&self, name: &str) -> ClusterResult<Pod>;

    /// Deletes a pod by name.
    async fn pod_delete(&self, name: &str) -> ClusterResult<()>;

    /// Creates a service.
    async fn service_create(&self, service: Service) -> ClusterResult<Service>;

    /// Deletes a service by name.
    async fn service_delete(&self, name: &str) -> ClusterResult<()>;

    /// Creates a persistent volume claim.
    async fn pvc_create(&self, claim: PersistentVolumeClaim) -> ClusterResult<PersistentVolumeClaim>;

    /// Deletes a persistent volume claim by name.
    async fn pvc_delete(&self, name: &str) -> ClusterResult<()>;

    /// Creates a config map.
    async fn config_map_create(&self, map: ConfigMap) -> ClusterResult<ConfigMap>;

    /// Deletes a config map by name.
    async fn config_map_delete(&self, name: &str) -> ClusterResult<()>;

    /// Opens a log stream over a pod's output.
    async fn pod_logs(&self, name: &str, opts: LogOptions) -> ClusterResult<LogStream>;

    /// Attaches to a pod's container, writes the payload to its stdin and
    /// detaches. There is no acknowledgement that the process consumed it.
    async fn pod_write_stdin(&self, name: &str, container: &str, data: &[u8]) -> ClusterResult<()>;

    /// Samples resource usage for a pod from the cluster metrics API.
    async fn pod_metrics(&self, name: &str) -> ClusterResult<PodStats>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ClusterError {
    /// Whether this error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Whether this error means an object with the same name already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The name of the service exposing a server's ports.
pub fn service_name(uuid: &str) -> String {
    format!("svc-{}", uuid)
}

/// The name of a server's persistent volume claim.
pub fn volume_claim_name(uuid: &str) -> String {
    format!("{}-pvc", uuid)
}

/// The name of a server's installer pod.
pub fn installer_pod_name(uuid: &str) -> String {
    format!("{}-installer", uuid)
}

/// The name of the config map carrying a server's installation script.
pub fn config_map_name(uuid: &str) -> String {
    format!("{}-configmap", uuid)
}

/// Reads the coarse lifecycle phase out of a pod's status.
pub fn pod_phase(pod: &Pod) -> PodPhase {
    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Pending") => PodPhase::Pending,
        Some("Running") => PodPhase::Running,
        Some("Succeeded") => PodPhase::Succeeded,
        Some("Failed") => PodPhase::Failed,
        _ => PodPhase::Unknown,
    }
}

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use self::kube::*;

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
