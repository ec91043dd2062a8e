use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Opaque identifier for a reservable slot on a resource (e.g. "9am").
pub type SlotId = String;

/// Identity supplied by the connection's authentication handshake.
pub type UserId = String;

/// The only booking state modeled. A cancelled booking is destroyed,
/// not retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
        }
    }
}

/// An active booking. Exclusively owns its slot until released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: UserId,
    pub slot: SlotId,
    pub status: BookingStatus,
    pub created_at: Ms,
}

/// Per-resource state: descriptive metadata, the available-slot set, and
/// the active bookings holding the rest of the slots.
///
/// Invariant: a slot id is in `available` iff no booking in `bookings`
/// references it.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: String,
    pub description: String,
    pub category: String,
    pub available: HashSet<SlotId>,
    pub bookings: HashMap<Ulid, Booking>,
}

impl ResourceState {
    pub fn new(
        id: Ulid,
        name: String,
        description: String,
        category: String,
        slots: impl IntoIterator<Item = SlotId>,
    ) -> Self {
        Self {
            id,
            name,
            description,
            category,
            available: slots.into_iter().collect(),
            bookings: HashMap::new(),
        }
    }

    /// Remove `slot` from the available set if present. Returns whether it
    /// was removed — the conditional primitive every mutation is built on.
    pub fn take_slot(&mut self, slot: &str) -> bool {
        self.available.remove(slot)
    }

    /// Return a slot to the available set. Returns false if it was
    /// already offered (set semantics, duplicates collapse).
    pub fn restore_slot(&mut self, slot: SlotId) -> bool {
        self.available.insert(slot)
    }

    pub fn offers(&self, slot: &str) -> bool {
        self.available.contains(slot)
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.get(id)
    }

    /// The booking currently holding `slot`, if any.
    pub fn booking_for_slot(&self, slot: &str) -> Option<&Booking> {
        self.bookings.values().find(|b| b.slot == slot)
    }

    /// Total slots this resource knows about, free or held.
    pub fn slot_count(&self) -> usize {
        self.available.len() + self.bookings.len()
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: String,
        description: String,
        category: String,
        slots: Vec<SlotId>,
    },
    ResourceUpdated {
        id: Ulid,
        name: String,
        description: String,
        category: String,
    },
    ResourceDeleted {
        id: Ulid,
    },
    SlotsAdded {
        resource_id: Ulid,
        slots: Vec<SlotId>,
    },
    SlotRetired {
        resource_id: Ulid,
        slot: SlotId,
    },
    BookingReserved {
        id: Ulid,
        resource_id: Ulid,
        user_id: UserId,
        slot: SlotId,
        created_at: Ms,
    },
    BookingRebooked {
        id: Ulid,
        resource_id: Ulid,
        new_slot: SlotId,
    },
    BookingReleased {
        id: Ulid,
        resource_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: String,
    pub description: String,
    pub category: String,
    pub available: Vec<SlotId>,
}

/// A booking enriched with its resource's descriptive fields, as returned
/// by the per-user listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserBooking {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub resource_name: String,
    pub resource_description: String,
    pub resource_category: String,
    pub slot: SlotId,
    pub status: BookingStatus,
    pub created_at: Ms,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(slots: &[&str]) -> ResourceState {
        ResourceState::new(
            Ulid::new(),
            "Room A".into(),
            "Small meeting room".into(),
            "meeting".into(),
            slots.iter().map(|s| s.to_string()),
        )
    }

    #[test]
    fn take_slot_is_conditional() {
        let mut rs = room(&["9am", "10am"]);
        assert!(rs.take_slot("9am"));
        assert!(!rs.take_slot("9am")); // already gone
        assert!(!rs.offers("9am"));
        assert!(rs.offers("10am"));
    }

    #[test]
    fn restore_slot_round_trip() {
        let mut rs = room(&["9am"]);
        assert!(rs.take_slot("9am"));
        assert!(rs.restore_slot("9am".into()));
        assert!(rs.offers("9am"));
    }

    #[test]
    fn duplicate_slots_collapse() {
        let rs = room(&["9am", "9am", "10am"]);
        assert_eq!(rs.available.len(), 2);
    }

    #[test]
    fn booking_for_slot_finds_holder() {
        let mut rs = room(&["9am"]);
        let id = Ulid::new();
        rs.take_slot("9am");
        rs.bookings.insert(
            id,
            Booking {
                id,
                user_id: "alice".into(),
                slot: "9am".into(),
                status: BookingStatus::Confirmed,
                created_at: 0,
            },
        );
        assert_eq!(rs.booking_for_slot("9am").unwrap().id, id);
        assert!(rs.booking_for_slot("10am").is_none());
        assert_eq!(rs.slot_count(), 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingReserved {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            user_id: "alice".into(),
            slot: "9am".into(),
            created_at: 1_700_000_000_000,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
