//! Lossy in-process event fan-out.
//!
//! Every server carries one bus; lifecycle events and resource snapshots are
//! published on it and relayed to the panel websocket by the API layer.
//! Publication never blocks: subscribers that cannot keep up lose the oldest
//! buffered events first.

use getset::Getters;
use serde::Serialize;
use tokio::sync::broadcast;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Published once when an installation process actually starts running.
pub const INSTALL_STARTED_EVENT: &str = "install started";

/// Published when an installation process finishes, successfully or not.
pub const INSTALL_COMPLETED_EVENT: &str = "install completed";

/// Published for daemon-generated notices shown on the server console.
pub const DAEMON_MESSAGE_EVENT: &str = "daemon message";

/// Published for every line of console output from the server process.
pub const CONSOLE_OUTPUT_EVENT: &str = "console output";

/// Published with a JSON resource usage snapshot on every poll.
pub const STATS_EVENT: &str = "stats";

/// How many events are buffered per subscriber before the oldest are dropped.
const EVENT_BUS_CAPACITY: usize = 256;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A single event published on a server's bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Event {
    /// The stable topic name the panel listens on.
    topic: String,

    /// The event payload; empty for pure notifications.
    data: String,
}

/// A broadcast bus carrying a single server's events.
///
/// Cloning the bus is cheap and shares the underlying channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Event {
    /// Creates a new event for the given topic.
    pub fn new(topic: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            data: data.into(),
        }
    }
}

impl EventBus {
    /// Creates a new bus with the default per-subscriber buffer.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publishes an event to all current subscribers.
    ///
    /// Publishing never waits on a subscriber; with no subscribers the event
    /// is discarded.
    pub fn publish(&self, topic: &str, data: impl Into<String>) {
        let _ = self.tx.send(Event::new(topic, data.into()));
    }

    /// Subscribes to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
