use serde::{Deserialize, Serialize};

use super::ProcessState;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A point-in-time resource usage snapshot for one server, published on the
/// event bus as the `stats` payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Working-set memory of the workload in bytes.
    pub memory_bytes: u64,

    /// The memory quota the workload runs under, in bytes.
    pub memory_limit_bytes: u64,

    /// CPU usage as a percentage of a single core (200 = two full cores).
    pub cpu_absolute: f64,

    /// The lifecycle state the sample was taken in.
    pub state: ProcessState,
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
