use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Settings for the cluster all server workloads are scheduled on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ClusterConfig {
    /// The namespace every object created for a server lives in.
    #[serde(default)]
    #[builder(default, setter(into))]
    pub(crate) namespace: String,

    /// Pod network settings.
    #[serde(default)]
    #[builder(default)]
    pub(crate) network: NetworkConfig,

    /// The type of service exposing each server.
    #[serde(default)]
    #[builder(default)]
    pub(crate) service_type: ServiceType,

    /// The storage class used when provisioning a server's volume claim.
    #[serde(default)]
    #[builder(default, setter(into))]
    pub(crate) storage_class: String,
}

/// Pod network settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct NetworkConfig {
    /// Nameservers injected into every server pod.
    #[serde(default)]
    #[builder(default)]
    pub(crate) dns: Vec<String>,
}

/// The type of service exposing a server's ports.
///
/// Anything other than `loadbalancer` falls back to a node port service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// Expose ports through a load balancer.
    LoadBalancer,

    /// Expose ports on every node of the cluster.
    #[default]
    #[serde(other)]
    NodePort,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ServiceType {
    /// The Kubernetes service type string for this setting.
    pub fn as_kubernetes_type(&self) -> &'static str {
        match self {
            Self::LoadBalancer => "LoadBalancer",
            Self::NodePort => "NodePort",
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
