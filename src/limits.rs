// Per-tenant hard limits. Exceeding any of them yields `EngineError::LimitExceeded`.

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_SHIFT_NAME_LEN: usize = 100;
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_NOTES_LEN: usize = 255;
pub const MAX_REASON_LEN: usize = 255;
pub const MAX_DESCRIPTION_LEN: usize = 1_000;

pub const MAX_TEMPLATES_PER_TENANT: usize = 10_000;
pub const MAX_USERS_PER_TENANT: usize = 100_000;
pub const MAX_RULES_PER_SHIFT: usize = 64;
pub const MAX_OCCURRENCES_PER_DAY: usize = 5_000;

/// Longest range accepted by range listings, in days.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 366;
