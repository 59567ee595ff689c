use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub of entity change events, one channel per vertiport.
///
/// This is the in-process observation surface for embedders (e.g. a transport
/// layer pushing server-sent updates). Delivery of notifications to USSes is
/// the caller's job; the hub never blocks a write.
pub struct NotifyHub {
    channels: DashMap<Uuid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to change events for a vertiport. Creates the channel if needed.
    pub fn subscribe(&self, vertiport_id: Uuid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(vertiport_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send an event. No-op if nobody is listening.
    pub fn send(&self, vertiport_id: Uuid, event: &Event) {
        if let Some(sender) = self.channels.get(&vertiport_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when a vertiport is retired).
    pub fn remove(&self, vertiport_id: &Uuid) {
        self.channels.remove(vertiport_id);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}
