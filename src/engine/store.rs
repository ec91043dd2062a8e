use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::model::*;

use super::SharedResourceState;

/// In-memory state: the resource map plus the two secondary indexes that
/// make booking lookups and per-user listings O(1).
pub struct StateStore {
    resources: DashMap<Ulid, SharedResourceState>,
    /// Booking id → owning resource id.
    booking_to_resource: DashMap<Ulid, Ulid>,
    /// User id → booking ids, unordered (listing sorts by created_at).
    user_bookings: DashMap<UserId, Vec<Ulid>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            booking_to_resource: DashMap::new(),
            user_bookings: DashMap::new(),
        }
    }

    // ── Resources ────────────────────────────────────────────

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn contains_resource(&self, id: &Ulid) -> bool {
        self.resources.contains_key(id)
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn insert_resource(&self, id: Ulid, state: SharedResourceState) {
        self.resources.insert(id, state);
    }

    pub fn remove_resource(&self, id: &Ulid) -> Option<(Ulid, SharedResourceState)> {
        self.resources.remove(id)
    }

    pub fn resource_ids(&self) -> Vec<Ulid> {
        self.resources.iter().map(|e| *e.key()).collect()
    }

    // ── Booking index ────────────────────────────────────────

    pub fn resource_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_resource.get(booking_id).map(|e| *e.value())
    }

    /// Atomically claim a booking id for `resource_id`. Returns false if
    /// the id is already in use anywhere in the store — the entry-based
    /// insert is the uniqueness authority across resources.
    pub fn claim_booking(&self, booking_id: Ulid, resource_id: Ulid) -> bool {
        match self.booking_to_resource.entry(booking_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(resource_id);
                true
            }
        }
    }

    /// Back out a claim whose reservation did not commit.
    pub fn unclaim_booking(&self, booking_id: &Ulid) {
        self.booking_to_resource.remove(booking_id);
    }

    fn map_booking(&self, booking_id: Ulid, resource_id: Ulid, user_id: &str) {
        self.booking_to_resource.insert(booking_id, resource_id);
        self.user_bookings
            .entry(user_id.to_string())
            .or_default()
            .push(booking_id);
    }

    fn unmap_booking(&self, booking_id: &Ulid, user_id: &str) {
        self.booking_to_resource.remove(booking_id);
        if let Some(mut ids) = self.user_bookings.get_mut(user_id) {
            ids.retain(|b| b != booking_id);
        }
    }

    pub fn bookings_for_user(&self, user_id: &str) -> Vec<Ulid> {
        self.user_bookings
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event to a resource's state and keep the indexes in step.
    /// No locking — the caller holds the resource write lock.
    pub fn apply_event(&self, rs: &mut ResourceState, event: &Event) {
        match event {
            Event::SlotsAdded { slots, .. } => {
                for slot in slots {
                    rs.restore_slot(slot.clone());
                }
            }
            Event::SlotRetired { slot, .. } => {
                rs.take_slot(slot);
            }
            Event::BookingReserved {
                id,
                resource_id,
                user_id,
                slot,
                created_at,
            } => {
                rs.take_slot(slot);
                rs.bookings.insert(
                    *id,
                    Booking {
                        id: *id,
                        user_id: user_id.clone(),
                        slot: slot.clone(),
                        status: BookingStatus::Confirmed,
                        created_at: *created_at,
                    },
                );
                self.map_booking(*id, *resource_id, user_id);
            }
            Event::BookingRebooked { id, new_slot, .. } => {
                // Restore before take: a same-slot rebook nets out to "held".
                if let Some(b) = rs.bookings.get_mut(id) {
                    let old = std::mem::replace(&mut b.slot, new_slot.clone());
                    rs.available.insert(old);
                    rs.available.remove(new_slot);
                }
            }
            Event::BookingReleased { id, .. } => {
                if let Some(b) = rs.bookings.remove(id) {
                    self.unmap_booking(id, &b.user_id);
                    rs.restore_slot(b.slot);
                }
            }
            Event::ResourceUpdated {
                name,
                description,
                category,
                ..
            } => {
                rs.name = name.clone();
                rs.description = description.clone();
                rs.category = category.clone();
            }
            // Handled at the resource-map level, not per-state
            Event::ResourceCreated { .. } | Event::ResourceDeleted { .. } => {}
        }
    }
}
