//! Hard caps that keep a single site from growing without bound.

pub const MAX_RESOURCES_PER_TENANT: usize = 10_000;
pub const MAX_WINDOWS_PER_RESOURCE: usize = 64;
pub const MAX_BOOKINGS_PER_LEDGER: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REQUESTER_LEN: usize = 256;
pub const MAX_REQUESTER_CAP: u32 = 1_000;
pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 200;
pub const MAX_LINE_LEN: usize = 64 * 1024;
/// Larger length prefixes in the WAL are treated as corruption.
pub const MAX_WAL_ENTRY_LEN: usize = 16 * 1024 * 1024;

/// Shortest slot a working window may define.
pub const MIN_SLOT_MINUTES: u32 = 1;
/// Longest slot a working window may define (one day).
pub const MAX_SLOT_MINUTES: u32 = 24 * 60;

pub const DEFAULT_REQUESTER_CAP: u32 = 3;
