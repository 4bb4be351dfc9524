use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Local wall-clock milliseconds, the only instant type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn hours(&self) -> u32 {
        (self.duration_ms() / HOUR_MS) as u32
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// One of the two physical sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Local {
    Sabana,
    Guadalupe,
}

impl Local {
    pub fn as_str(&self) -> &'static str {
        match self {
            Local::Sabana => "sabana",
            Local::Guadalupe => "guadalupe",
        }
    }
}

impl fmt::Display for Local {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Local {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sabana" | "la sabana" => Ok(Local::Sabana),
            "guadalupe" => Ok(Local::Guadalupe),
            other => Err(format!("unknown local: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub phone: String,
}

/// A booked slot on one cancha.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reserva {
    pub id: Ulid,
    pub span: Span,
    pub contact: Contact,
    pub price: u32,
    /// Set when the reserva was generated from a fija template.
    pub fija_id: Option<Ulid>,
}

#[derive(Debug, Clone)]
pub struct CanchaState {
    pub id: Ulid,
    pub local: Local,
    pub name: String,
    /// Default hourly price.
    pub price: u32,
    /// Sorted by `span.start`.
    pub reservas: Vec<Reserva>,
}

impl CanchaState {
    pub fn new(id: Ulid, local: Local, name: String, price: u32) -> Self {
        Self {
            id,
            local,
            name,
            price,
            reservas: Vec::new(),
        }
    }

    /// Insert reserva maintaining sort order by span.start.
    pub fn insert_reserva(&mut self, reserva: Reserva) {
        let pos = self
            .reservas
            .binary_search_by_key(&reserva.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservas.insert(pos, reserva);
    }

    pub fn remove_reserva(&mut self, id: Ulid) -> Option<Reserva> {
        let pos = self.reservas.iter().position(|r| r.id == id)?;
        Some(self.reservas.remove(pos))
    }

    pub fn get_reserva(&self, id: Ulid) -> Option<&Reserva> {
        self.reservas.iter().find(|r| r.id == id)
    }

    /// Reservas whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reserva> {
        let right_bound = self.reservas.partition_point(|r| r.span.start < query.end);
        self.reservas[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    pub fn instances_of(&self, fija_id: Ulid) -> impl Iterator<Item = &Reserva> {
        self.reservas
            .iter()
            .filter(move |r| r.fija_id == Some(fija_id))
    }
}

/// Recurring weekly template. Instances are ordinary reservas carrying `fija_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fija {
    pub id: Ulid,
    pub cancha_id: Ulid,
    pub weekday: Weekday,
    pub hour: u32,
    pub hours: u32,
    pub contact: Contact,
    pub price: u32,
}

/// Hub shares availability with member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub id: Ulid,
    pub hub_id: Ulid,
    pub member_id: Ulid,
}

/// WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CanchaCreated {
        id: Ulid,
        local: Local,
        name: String,
        price: u32,
    },
    CanchaUpdated {
        id: Ulid,
        name: String,
        price: u32,
    },
    CanchaDeleted {
        id: Ulid,
    },
    CanchasLinked(Link),
    CanchasUnlinked {
        id: Ulid,
    },
    ReservaConfirmed {
        cancha_id: Ulid,
        reserva: Reserva,
    },
    ReservaUpdated {
        cancha_id: Ulid,
        reserva: Reserva,
    },
    ReservaCancelled {
        id: Ulid,
        cancha_id: Ulid,
    },
    FijaCreated(Fija),
    FijaUpdated(Fija),
    FijaDeleted {
        id: Ulid,
    },
}

// ── Requests ─────────────────────────────────────────────────────

/// A reserva to be booked. `price` falls back to the cancha's price.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReserva {
    pub id: Ulid,
    pub cancha_id: Ulid,
    pub date: NaiveDate,
    pub hour: u32,
    pub hours: u32,
    pub contact: Contact,
    pub price: Option<u32>,
}

/// Fields to change on a reserva; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservaPatch {
    pub date: Option<NaiveDate>,
    pub hour: Option<u32>,
    pub hours: Option<u32>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub price: Option<u32>,
}

impl ReservaPatch {
    pub fn moves_slot(&self) -> bool {
        self.date.is_some() || self.hour.is_some() || self.hours.is_some()
    }
}

/// A fija template to create. `price` falls back to the cancha's price.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFija {
    pub id: Ulid,
    pub cancha_id: Ulid,
    pub weekday: Weekday,
    pub hour: u32,
    pub hours: u32,
    pub contact: Contact,
    pub price: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FijaPatch {
    pub weekday: Option<Weekday>,
    pub hour: Option<u32>,
    pub hours: Option<u32>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub price: Option<u32>,
}

impl FijaPatch {
    pub fn apply(&self, fija: &Fija) -> Fija {
        Fija {
            id: fija.id,
            cancha_id: fija.cancha_id,
            weekday: self.weekday.unwrap_or(fija.weekday),
            hour: self.hour.unwrap_or(fija.hour),
            hours: self.hours.unwrap_or(fija.hours),
            contact: Contact {
                name: self.name.clone().unwrap_or_else(|| fija.contact.name.clone()),
                phone: self.phone.clone().unwrap_or_else(|| fija.contact.phone.clone()),
            },
            price: self.price.unwrap_or(fija.price),
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanchaInfo {
    pub id: Ulid,
    pub local: Local,
    pub name: String,
    pub price: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservaInfo {
    pub id: Ulid,
    pub cancha_id: Ulid,
    pub date: NaiveDate,
    pub hour: u32,
    pub hours: u32,
    pub contact: Contact,
    pub price: u32,
    pub fija_id: Option<Ulid>,
}

impl ReservaInfo {
    pub fn new(cancha_id: Ulid, r: &Reserva) -> Self {
        let (date, hour) = crate::calendar::date_hour(r.span.start);
        Self {
            id: r.id,
            cancha_id,
            date,
            hour,
            hours: r.span.hours(),
            contact: r.contact.clone(),
            price: r.price,
            fija_id: r.fija_id,
        }
    }
}

pub type FijaInfo = Fija;
pub type LinkInfo = Link;

/// One generated date of a fija and whether it can be booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub date: NaiveDate,
    /// First reserva standing in the way, if any.
    pub conflict: Option<Ulid>,
}

impl Occurrence {
    pub fn is_free(&self) -> bool {
        self.conflict.is_none()
    }
}

/// Result of creating or renewing a fija.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FijaOutcome {
    pub booked: Vec<NaiveDate>,
    pub conflicts: Vec<NaiveDate>,
}
