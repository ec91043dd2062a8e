use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, WalCommand, now_ms};

fn validate_slot(slot: &str) -> Result<(), EngineError> {
    if slot.is_empty() {
        return Err(EngineError::LimitExceeded("empty slot id"));
    }
    if slot.len() > MAX_SLOT_LEN {
        return Err(EngineError::LimitExceeded("slot id too long"));
    }
    Ok(())
}

fn validate_metadata(name: &str, description: &str, category: &str) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("resource name too long"));
    }
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(EngineError::LimitExceeded("resource description too long"));
    }
    if category.len() > MAX_CATEGORY_LEN {
        return Err(EngineError::LimitExceeded("resource category too long"));
    }
    Ok(())
}

impl Engine {
    // ── Catalog ──────────────────────────────────────────────

    pub async fn create_resource(
        &self,
        id: Ulid,
        name: String,
        description: String,
        category: String,
        slots: Vec<SlotId>,
    ) -> Result<(), EngineError> {
        let _gate = self.compact_gate.read().await;
        if self.store.resource_count() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        validate_metadata(&name, &description, &category)?;
        if slots.len() > MAX_SLOTS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many slots on resource"));
        }
        for slot in &slots {
            validate_slot(slot)?;
        }
        if self.store.contains_resource(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        // Set semantics: duplicate slot ids collapse before the event is
        // written, so replay sees the same set the caller got.
        let mut seen = HashSet::new();
        let slots: Vec<SlotId> = slots.into_iter().filter(|s| seen.insert(s.clone())).collect();

        let event = Event::ResourceCreated {
            id,
            name: name.clone(),
            description: description.clone(),
            category: category.clone(),
            slots: slots.clone(),
        };
        self.wal_append(&event).await?;
        let rs = ResourceState::new(id, name, description, category, slots);
        self.store.insert_resource(id, Arc::new(RwLock::new(rs)));
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn update_resource(
        &self,
        id: Ulid,
        name: String,
        description: String,
        category: String,
    ) -> Result<(), EngineError> {
        let _gate = self.compact_gate.read().await;
        validate_metadata(&name, &description, &category)?;
        let rs = self.store.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;

        let event = Event::ResourceUpdated {
            id,
            name,
            description,
            category,
        };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// Deleting a resource with active bookings is refused: a booking must
    /// never be left referencing a missing resource through this path.
    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.compact_gate.read().await;
        let rs = self.store.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.write().await;
        if !guard.bookings.is_empty() {
            return Err(EngineError::HasActiveBookings(id));
        }

        let event = Event::ResourceDeleted { id };
        self.wal_append(&event).await?;
        self.store.remove_resource(&id);
        drop(guard);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    /// Extend the available set. A slot currently held by an active booking
    /// is refused — accepting it would offer the same slot twice.
    pub async fn add_slots(
        &self,
        resource_id: Ulid,
        slots: Vec<SlotId>,
    ) -> Result<(), EngineError> {
        let _gate = self.compact_gate.read().await;
        for slot in &slots {
            validate_slot(slot)?;
        }
        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = rs.write().await;
        if guard.slot_count() + slots.len() > MAX_SLOTS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many slots on resource"));
        }
        for slot in &slots {
            if guard.booking_for_slot(slot).is_some() {
                return Err(EngineError::SlotUnavailable {
                    resource_id,
                    slot: slot.clone(),
                });
            }
        }

        let mut seen = HashSet::new();
        let slots: Vec<SlotId> = slots
            .into_iter()
            .filter(|s| !guard.offers(s) && seen.insert(s.clone()))
            .collect();
        if slots.is_empty() {
            return Ok(());
        }

        let event = Event::SlotsAdded { resource_id, slots };
        self.persist_and_apply(resource_id, &mut guard, &event).await
    }

    /// Remove an unbooked slot from the available set.
    pub async fn retire_slot(&self, resource_id: Ulid, slot: SlotId) -> Result<(), EngineError> {
        let _gate = self.compact_gate.read().await;
        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = rs.write().await;
        if !guard.offers(&slot) {
            return Err(EngineError::SlotUnavailable { resource_id, slot });
        }

        let event = Event::SlotRetired { resource_id, slot };
        self.persist_and_apply(resource_id, &mut guard, &event).await
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Create a confirmed booking for `slot` and remove it from the
    /// available set, as one unit under the resource write lock. After
    /// success the slot is not offered to any other caller until released.
    pub async fn reserve(
        &self,
        id: Ulid,
        user_id: &str,
        resource_id: Ulid,
        slot: SlotId,
    ) -> Result<Booking, EngineError> {
        let _gate = self.compact_gate.read().await;
        validate_slot(&slot)?;
        if user_id.is_empty() || user_id.len() > MAX_USER_LEN {
            return Err(EngineError::LimitExceeded("bad user id"));
        }
        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = rs.write().await;
        // The claim is the sole authority on booking-id uniqueness: two
        // reserves racing with the same id on different resources each hold
        // their own resource lock, so a plain lookup could pass twice.
        if !self.store.claim_booking(id, resource_id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_RESOURCE {
            self.store.unclaim_booking(&id);
            return Err(EngineError::LimitExceeded("too many bookings on resource"));
        }
        if !guard.offers(&slot) {
            self.store.unclaim_booking(&id);
            return Err(EngineError::SlotUnavailable { resource_id, slot });
        }

        let booking = Booking {
            id,
            user_id: user_id.to_string(),
            slot,
            status: BookingStatus::Confirmed,
            created_at: now_ms(),
        };
        let event = Event::BookingReserved {
            id,
            resource_id,
            user_id: booking.user_id.clone(),
            slot: booking.slot.clone(),
            created_at: booking.created_at,
        };
        if let Err(e) = self.persist_and_apply(resource_id, &mut guard, &event).await {
            self.store.unclaim_booking(&id);
            return Err(e);
        }
        Ok(booking)
    }

    /// Move a booking to `new_slot`: the old slot returns to the available
    /// set and the new slot leaves it, atomically under the resource write
    /// lock. Rebooking onto the booking's current slot is a successful
    /// no-op — the held slot is never transiently offered.
    pub async fn rebook(
        &self,
        user_id: &str,
        booking_id: Ulid,
        new_slot: SlotId,
    ) -> Result<Booking, EngineError> {
        let _gate = self.compact_gate.read().await;
        validate_slot(&new_slot)?;
        let (resource_id, mut guard) = self.resolve_booking_write(&booking_id, user_id).await?;

        // resolve_booking_write verified the booking exists and is owned
        let mut booking = match guard.booking(&booking_id) {
            Some(b) => b.clone(),
            None => return Err(EngineError::NotFound(booking_id)),
        };
        if new_slot == booking.slot {
            return Ok(booking);
        }
        if !guard.offers(&new_slot) {
            return Err(EngineError::SlotUnavailable {
                resource_id,
                slot: new_slot,
            });
        }

        let event = Event::BookingRebooked {
            id: booking_id,
            resource_id,
            new_slot: new_slot.clone(),
        };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        booking.slot = new_slot;
        Ok(booking)
    }

    /// Destroy a booking and return its slot to the available set. The slot
    /// is immediately offerable to reserve/rebook calls.
    pub async fn release(&self, user_id: &str, booking_id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.compact_gate.read().await;
        let (resource_id, mut guard) = self.resolve_booking_write(&booking_id, user_id).await?;
        let event = Event::BookingReleased {
            id: booking_id,
            resource_id,
        };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        Ok(resource_id)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state: one ResourceCreated carrying the full
    /// slot set per resource, then one BookingReserved per active booking.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();

        // Fence out appends for the snapshot + enqueue window. A mutation
        // acknowledged before the fence is in the snapshot; one started
        // after it appends behind the Compact command, onto the rewritten
        // file. Without the fence an append could slip into the old file
        // between the snapshot and the rewrite and be erased.
        let _fence = self.compact_gate.write().await;
        let mut events = Vec::new();

        for id in self.store.resource_ids() {
            let rs_arc = match self.store.get_resource(&id) {
                Some(rs) => rs,
                None => continue,
            };
            let guard = rs_arc.read().await;

            // Booked slots are emitted as created-then-reserved so replay
            // walks the same path live traffic did.
            let mut slots: Vec<SlotId> = guard.available.iter().cloned().collect();
            slots.extend(guard.bookings.values().map(|b| b.slot.clone()));
            slots.sort();

            events.push(Event::ResourceCreated {
                id: guard.id,
                name: guard.name.clone(),
                description: guard.description.clone(),
                category: guard.category.clone(),
                slots,
            });
            for booking in guard.bookings.values() {
                events.push(Event::BookingReserved {
                    id: booking.id,
                    resource_id: guard.id,
                    user_id: booking.user_id.clone(),
                    slot: booking.slot.clone(),
                    created_at: booking.created_at,
                });
            }
        }

        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        // Queue order is fixed once the command is in line; the rewrite
        // itself can proceed with appends flowing again.
        drop(_fence);
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
