//! Per-agent fan-out of lifecycle and timeline updates.
//!
//! Each managed agent owns one [`SubscriberBus`]. Publishing appends to an
//! append-only history (used for replay/hydration after a reconnect) and
//! broadcasts to every live subscriber. Subscribing returns the history
//! snapshot together with a live receiver; dropping the [`Subscription`]
//! unsubscribes.

use tokio::sync::broadcast;

use crate::events::AgentUpdate;

/// Default channel capacity. Slow subscribers past this lag and miss events;
/// they can re-sync from the history snapshot.
const DEFAULT_CAPACITY: usize = 1024;

/// A live subscription to one agent's update stream.
pub struct Subscription {
    /// Everything published before the subscription was taken.
    pub snapshot: Vec<AgentUpdate>,
    /// Receiver for everything published after.
    pub receiver: broadcast::Receiver<AgentUpdate>,
}

/// Fan-out channel plus replayable history for one agent.
pub struct SubscriberBus {
    sender: broadcast::Sender<AgentUpdate>,
    history: std::sync::Mutex<Vec<AgentUpdate>>,
}

impl SubscriberBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            history: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Append to history and fan out to live subscribers.
    ///
    /// Returns the number of subscribers that received the update.
    pub fn publish(&self, update: AgentUpdate) -> usize {
        self.history.lock().unwrap().push(update.clone());
        self.sender.send(update).unwrap_or(0)
    }

    /// Subscribe, receiving the full history so far plus all future updates.
    ///
    /// The snapshot and the receiver are taken under one lock so no update is
    /// ever missed or duplicated across the boundary.
    pub fn subscribe(&self) -> Subscription {
        let history = self.history.lock().unwrap();
        Subscription {
            snapshot: history.clone(),
            receiver: self.sender.subscribe(),
        }
    }

    /// The full update history so far.
    pub fn history(&self) -> Vec<AgentUpdate> {
        self.history.lock().unwrap().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for SubscriberBus {
    fn default() -> Self {
        Self::new()
    }
}
