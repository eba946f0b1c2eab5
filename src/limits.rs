//! Hard input limits enforced before anything is staged or logged.

pub const MAX_EMAIL_LEN: usize = 255;
pub const MAX_NAME_LEN: usize = 100;

pub const MAX_USERS: usize = 1_000_000;
pub const MAX_TABLES: usize = 10_000;
pub const MAX_BOOKINGS_PER_TABLE: usize = 1_000_000;
