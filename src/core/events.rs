// src/core/events.rs

//! Defines the event bus through which the command dispatcher publishes write
//! operations to the replication subsystem.

use bytes::Bytes;
use tokio::sync::broadcast::{self, Sender as BroadcastSender};
use tracing::debug;

/// The capacity of the broadcast channel for replication. Large enough to
/// absorb bursts of write commands without lagging.
const BROADCAST_BUS_CAPACITY: usize = 16384;

/// A single write operation as seen by the replication stream: the database it
/// applies to and the verbatim argument vector. `origin` carries the UUID of
/// the peer whose link delivered the command, when there is one, so the
/// encoder can avoid mirroring a command straight back at its source.
#[derive(Debug, Clone)]
pub struct WriteEvent {
    pub db: u64,
    pub argv: Vec<Bytes>,
    pub origin: Option<uuid::Uuid>,
}

/// The `EventBus` is the distribution hub for write operations. The dispatcher
/// publishes every executed write command here; the replication feeder task
/// drains it into the stream encoder.
#[derive(Debug)]
pub struct EventBus {
    replication_sender: BroadcastSender<WriteEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (replication_sender, _) = broadcast::channel(BROADCAST_BUS_CAPACITY);
        Self { replication_sender }
    }

    /// Publishes a write event. It's fine if there are no active subscribers.
    pub fn publish(&self, event: WriteEvent) {
        if self.replication_sender.send(event).is_err() {
            debug!("Published a write event with no active replication subscribers.");
        }
    }

    /// Provides a new receiver for the replication feeder to subscribe to.
    pub fn subscribe(&self) -> broadcast::Receiver<WriteEvent> {
        self.replication_sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
