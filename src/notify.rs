use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for per-resource change notifications. Subscribers see
/// every committed event touching the resource, in commit order.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, resource_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&resource_id) {
            tracing::trace!(
                resource = %resource_id,
                payload = %NotifyPayload::from_event(resource_id, event).to_json(),
                "notify"
            );
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when a resource is deleted).
    pub fn remove(&self, resource_id: &Ulid) {
        self.channels.remove(resource_id);
    }
}

/// Wire payload for a notification: the event name plus the fields a
/// listener needs to refresh its view.
#[derive(Debug, Serialize)]
pub struct NotifyPayload<'a> {
    pub event: &'static str,
    pub resource_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<&'a str>,
}

impl<'a> NotifyPayload<'a> {
    pub fn from_event(resource_id: Ulid, event: &'a Event) -> Self {
        let (name, booking_id, slot) = match event {
            Event::ResourceCreated { .. } => ("resource_created", None, None),
            Event::ResourceUpdated { .. } => ("resource_updated", None, None),
            Event::ResourceDeleted { .. } => ("resource_deleted", None, None),
            Event::SlotsAdded { .. } => ("slots_added", None, None),
            Event::SlotRetired { slot, .. } => ("slot_retired", None, Some(slot.as_str())),
            Event::BookingReserved { id, slot, .. } => {
                ("booking_reserved", Some(id.to_string()), Some(slot.as_str()))
            }
            Event::BookingRebooked { id, new_slot, .. } => {
                ("booking_rebooked", Some(id.to_string()), Some(new_slot.as_str()))
            }
            Event::BookingReleased { id, .. } => ("booking_released", Some(id.to_string()), None),
        };
        Self {
            event: name,
            resource_id: resource_id.to_string(),
            booking_id,
            slot,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);

        let event = Event::SlotRetired {
            resource_id: rid,
            slot: "9am".into(),
        };
        hub.send(rid, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        // No subscriber — should not panic
        hub.send(rid, &Event::ResourceDeleted { id: rid });
    }

    #[test]
    fn payload_carries_booking_and_slot() {
        let rid = Ulid::new();
        let bid = Ulid::new();
        let event = Event::BookingReserved {
            id: bid,
            resource_id: rid,
            user_id: "alice".into(),
            slot: "9am".into(),
            created_at: 0,
        };
        let json = NotifyPayload::from_event(rid, &event).to_json();
        assert!(json.contains("booking_reserved"));
        assert!(json.contains(&bid.to_string()));
        assert!(json.contains("9am"));
    }
}
