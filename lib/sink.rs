//! Named destinations for a server's log streams.
//!
//! A sink decouples producers (the attach loop, the installer output stream)
//! from consumers (websocket sessions) the same way the event bus does:
//! pushes never block and slow consumers lose the oldest lines first.

use bytes::Bytes;
use tokio::sync::broadcast;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How many lines are buffered per sink subscriber before the oldest drop.
const SINK_CAPACITY: usize = 256;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The well-known sinks every server carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkName {
    /// Console output from the running server process.
    Console,

    /// Output from the installation process.
    Install,
}

/// A lossy fan-out channel for one log stream.
#[derive(Debug, Clone)]
pub struct Sink {
    tx: broadcast::Sender<Bytes>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Sink {
    /// Creates a new sink with the default per-subscriber buffer.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SINK_CAPACITY);
        Self { tx }
    }

    /// Pushes one line into the sink. Never blocks; with no subscribers the
    /// line is discarded.
    pub fn push(&self, line: Bytes) {
        let _ = self.tx.send(line);
    }

    /// Subscribes to all lines pushed after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.tx.subscribe()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for Sink {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
