use ulid::Ulid;

use crate::model::SlotId;

#[derive(Debug, PartialEq, Eq)]
pub enum EngineError {
    /// Resource or booking missing, or booking not owned by the caller.
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Requested slot is not currently in the resource's available set.
    SlotUnavailable { resource_id: Ulid, slot: SlotId },
    /// A booking references a resource that no longer exists. Surfaced,
    /// never swallowed.
    Inconsistent { booking_id: Ulid, resource_id: Ulid },
    /// Resource deletion refused while active bookings reference it.
    HasActiveBookings(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SlotUnavailable { resource_id, slot } => {
                write!(f, "slot '{slot}' on resource {resource_id} is not available")
            }
            EngineError::Inconsistent {
                booking_id,
                resource_id,
            } => write!(
                f,
                "booking {booking_id} references missing resource {resource_id}"
            ),
            EngineError::HasActiveBookings(id) => {
                write!(f, "cannot delete resource {id}: has active bookings")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
