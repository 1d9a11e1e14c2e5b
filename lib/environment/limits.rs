use std::{fmt, str::FromStr};

use getset::Getters;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::WardenError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Resource quotas for one server, normalised into cluster-native quantities.
///
/// CPU and memory are applied equally as requests and limits so the pod lands
/// in the guaranteed QoS class; game workloads surface scheduler jitter
/// directly to players.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters,
)]
#[getset(get = "pub with_prefix")]
pub struct ResourceLimits {
    /// CPU limit as a percentage of a single core (200 = two cores).
    #[serde(default)]
    #[builder(default)]
    cpu_limit: i64,

    /// Memory limit in mebibytes.
    #[serde(default)]
    #[builder(default)]
    memory_limit: i64,

    /// Disk quota in mebibytes, applied as the volume claim's storage request.
    #[serde(default)]
    #[builder(default)]
    disk_space: i64,
}

/// The set of ports a server exposes, with one designated default port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Allocation {
    /// The primary port players connect to; exposed over both protocols.
    #[serde(default)]
    #[builder(default)]
    default_port: u16,

    /// Additional port bindings beyond the default port.
    #[serde(default)]
    #[builder(default)]
    bindings: Vec<PortBinding>,
}

/// One exposed port with its protocol, e.g. `25565/tcp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct PortBinding {
    /// The port number.
    port: u16,

    /// The transport protocol.
    proto: Protocol,
}

/// A transport protocol a port is exposed over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Transmission control protocol.
    #[default]
    Tcp,

    /// User datagram protocol.
    Udp,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ResourceLimits {
    /// Creates limits from a CPU percentage and mebibyte quotas.
    pub fn new(cpu_limit: i64, memory_limit: i64, disk_space: i64) -> Self {
        Self {
            cpu_limit,
            memory_limit,
            disk_space,
        }
    }

    /// The memory limit in bytes.
    pub fn bounded_memory_limit(&self) -> i64 {
        self.memory_limit * 1024 * 1024
    }

    /// The disk quota in bytes.
    pub fn disk_space_bytes(&self) -> i64 {
        self.disk_space * 1024 * 1024
    }

    /// The CPU quota as a cluster quantity: `cpu_limit / 100` cores, kept
    /// exact by expressing it in millicores.
    pub fn cpu_quantity(&self) -> Quantity {
        Quantity(format!("{}m", self.cpu_limit * 10))
    }

    /// The memory quota as a binary-suffixed cluster quantity.
    pub fn memory_quantity(&self) -> Quantity {
        binary_quantity(self.bounded_memory_limit())
    }

    /// The disk quota as a binary-suffixed cluster quantity.
    pub fn disk_quantity(&self) -> Quantity {
        binary_quantity(self.disk_space_bytes())
    }
}

impl PortBinding {
    /// Creates a new binding.
    pub fn new(port: u16, proto: Protocol) -> Self {
        Self { port, proto }
    }

    /// The stable name used for this binding's service port entry.
    pub fn service_port_name(&self) -> String {
        format!("{}{}", self.proto, self.port)
    }
}

impl Protocol {
    /// The lowercase protocol name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }

    /// The uppercase form used in Kubernetes port specs.
    pub fn as_kubernetes_protocol(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Renders a byte count as a cluster quantity, using the largest binary
/// suffix that divides it exactly (`1073741824` → `1Gi`).
pub fn binary_quantity(bytes: i64) -> Quantity {
    for (suffix, factor) in [("Gi", 1 << 30), ("Mi", 1 << 20), ("Ki", 1 << 10)] {
        if bytes != 0 && bytes % factor == 0 {
            return Quantity(format!("{}{}", bytes / factor, suffix));
        }
    }
    Quantity(bytes.to_string())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for PortBinding {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, proto) = s
            .split_once('/')
            .ok_or_else(|| WardenError::InvalidPortBinding(s.to_string()))?;

        let port = port
            .parse()
            .map_err(|_| WardenError::InvalidPortBinding(s.to_string()))?;
        let proto = match proto {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            _ => return Err(WardenError::InvalidPortBinding(s.to_string())),
        };

        Ok(Self { port, proto })
    }
}

impl fmt::Display for PortBinding {
    /// Formats the binding following the format "<port>/<proto>".
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.proto)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for PortBinding {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PortBinding {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
