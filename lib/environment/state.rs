use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The lifecycle state of a server process as this agent believes it to be.
///
/// The cluster is the operational truth; this view trails it and is corrected
/// by polling. A server reported `Running` here is running on the cluster,
/// but the reverse may lag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// No process is running.
    #[default]
    Offline,

    /// The process is being brought up.
    Starting,

    /// The process is running.
    Running,

    /// The process is being shut down. Entering this state suppresses crash
    /// detection for the stop that follows.
    Stopping,
}

/// Publishes one server's lifecycle state to any number of subscribers.
///
/// Cloning shares the underlying channel. Writes are observed in the order
/// they were made; setting the current state again notifies nobody.
#[derive(Debug, Clone)]
pub struct StatePublisher {
    tx: Arc<watch::Sender<ProcessState>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl StatePublisher {
    /// Creates a new publisher in the [`ProcessState::Offline`] state.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ProcessState::default());
        Self { tx: Arc::new(tx) }
    }

    /// The current state.
    pub fn state(&self) -> ProcessState {
        *self.tx.borrow()
    }

    /// Transitions to `next`, notifying subscribers on change. Idempotent.
    pub fn set_state(&self, next: ProcessState) {
        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Subscribes to state changes. The receiver also exposes the current
    /// value, so no transition can be missed between read and wait.
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.tx.subscribe()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for StatePublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Offline => "offline",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        write!(f, "{}", s)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
