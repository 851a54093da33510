//! Hard limits that keep a single facility's memory and WAL bounded.

pub const MAX_FACILITIES: usize = 1024;
pub const MAX_FACILITY_NAME_LEN: usize = 256;

pub const MAX_COURTS_PER_FACILITY: usize = 10_000;
pub const MAX_RULES_PER_COURT: usize = 256;
pub const MAX_BLOCKED_RANGES_PER_COURT: usize = 10_000;
pub const MAX_RESERVATIONS_PER_COURT: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1024;

/// Per-hour price ceiling, in minor currency units.
pub const MAX_PRICE: i64 = 100_000_000;

/// Multi-day availability queries never reach further than this from today.
pub const MAX_RANGE_DAYS: i64 = 30;
pub const MAX_DURATIONS_PER_QUERY: usize = 16;
