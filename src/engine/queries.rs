use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// All bookings owned by `user_id`, enriched with the resource's
    /// descriptive fields, most-recently-created first. A user with no
    /// bookings gets an empty vec, not an error; a booking whose resource
    /// has vanished is an Inconsistent error, not a skip.
    pub async fn list_user_bookings(
        &self,
        user_id: &str,
    ) -> Result<Vec<UserBooking>, EngineError> {
        let mut out = Vec::new();

        for booking_id in self.store.bookings_for_user(user_id) {
            let resource_id = match self.store.resource_for_booking(&booking_id) {
                Some(rid) => rid,
                // Index raced with a concurrent release — the booking is gone.
                None => continue,
            };
            let rs = self
                .store
                .get_resource(&resource_id)
                .ok_or(EngineError::Inconsistent {
                    booking_id,
                    resource_id,
                })?;
            let guard = rs.read().await;
            if let Some(b) = guard.booking(&booking_id) {
                out.push(UserBooking {
                    id: b.id,
                    resource_id,
                    resource_name: guard.name.clone(),
                    resource_description: guard.description.clone(),
                    resource_category: guard.category.clone(),
                    slot: b.slot.clone(),
                    status: b.status,
                    created_at: b.created_at,
                });
            }
        }

        // Most recent first; booking id (time-ordered ULID) breaks ties.
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(out)
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut out = Vec::new();
        for id in self.store.resource_ids() {
            let rs = match self.store.get_resource(&id) {
                Some(rs) => rs,
                None => continue,
            };
            let guard = rs.read().await;
            let mut available: Vec<SlotId> = guard.available.iter().cloned().collect();
            available.sort();
            out.push(ResourceInfo {
                id: guard.id,
                name: guard.name.clone(),
                description: guard.description.clone(),
                category: guard.category.clone(),
                available,
            });
        }
        out.sort_by_key(|r| r.id);
        out
    }

    /// The resource's current available set, sorted for stable output.
    pub async fn available_slots(&self, resource_id: Ulid) -> Result<Vec<SlotId>, EngineError> {
        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        let mut slots: Vec<SlotId> = guard.available.iter().cloned().collect();
        slots.sort();
        Ok(slots)
    }
}
