//! Hard limits enforced by the engine and the SQL surface.

/// Occurrences generated (and kept booked) per reserva fija.
pub const FIJA_OCCURRENCES: usize = 4;

/// Longest single reserva, in hours.
pub const MAX_SLOT_HOURS: u32 = 4;

pub const MAX_CANCHAS: usize = 256;
pub const MAX_LINKS: usize = 1_024;
pub const MAX_FIJAS: usize = 10_000;
pub const MAX_RESERVAS_PER_CANCHA: usize = 200_000;

pub const MAX_NAME_LEN: usize = 128;
pub const MAX_PHONE_LEN: usize = 32;

/// Prices are whole colones.
pub const MAX_PRICE: u32 = 10_000_000;

pub const MAX_BATCH_SIZE: usize = 1_000;

/// Reservas can't be booked further ahead than this many days.
pub const MAX_DAYS_AHEAD: i64 = 366;
