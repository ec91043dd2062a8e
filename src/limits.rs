//! Hard caps on every unbounded input. Exceeding any of these is a
//! client error, not a capacity-planning knob.

/// Max resources a single tenant may create.
pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;

/// Max slots in one resource's available set (booked slots included).
pub const MAX_SLOTS_PER_RESOURCE: usize = 10_000;

/// Max active bookings on a single resource.
pub const MAX_BOOKINGS_PER_RESOURCE: usize = 10_000;

/// Max byte length of a slot identifier.
pub const MAX_SLOT_LEN: usize = 128;

/// Max byte length of a resource name.
pub const MAX_NAME_LEN: usize = 256;

/// Max byte length of a resource description.
pub const MAX_DESCRIPTION_LEN: usize = 4_096;

/// Max byte length of a resource category.
pub const MAX_CATEGORY_LEN: usize = 128;

/// Max byte length of a user identifier (connection user name).
pub const MAX_USER_LEN: usize = 256;

/// Max number of lazily created tenants (one WAL + engine each).
pub const MAX_TENANTS: usize = 1_024;

/// Max byte length of a tenant (database) name before sanitization.
pub const MAX_TENANT_NAME_LEN: usize = 256;
