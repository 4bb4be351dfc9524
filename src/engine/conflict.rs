use std::collections::HashSet;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::{days_between, slot_span, Calendar};
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::{EngineError, LockedGroup};

/// Shape checks that don't depend on the clock.
pub(crate) fn validate_shape(cal: &Calendar, hour: u32, hours: u32) -> Result<(), EngineError> {
    if hours == 0 || hours > MAX_SLOT_HOURS {
        return Err(EngineError::LimitExceeded("reserva length out of range"));
    }
    if !cal.within_hours(hour, hours) {
        return Err(EngineError::OutsideHours { hour, hours });
    }
    Ok(())
}

/// Full check for a new booking: shape, not in the past, not too far ahead.
pub(crate) fn validate_slot(
    cal: &Calendar,
    date: NaiveDate,
    hour: u32,
    hours: u32,
) -> Result<Span, EngineError> {
    validate_shape(cal, hour, hours)?;
    let span = slot_span(date, hour, hours);
    if span.start < cal.now_ms() {
        return Err(EngineError::InPast { date, hour });
    }
    if days_between(cal.today(), date) > MAX_DAYS_AHEAD {
        return Err(EngineError::TooFarAhead(date));
    }
    Ok(span)
}

pub(crate) fn validate_contact(contact: &Contact) -> Result<(), EngineError> {
    if contact.name.trim().is_empty() {
        return Err(EngineError::Invalid("contact name is empty"));
    }
    if contact.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("contact name too long"));
    }
    if contact.phone.len() > MAX_PHONE_LEN {
        return Err(EngineError::LimitExceeded("phone too long"));
    }
    Ok(())
}

pub(crate) fn validate_price(price: u32) -> Result<(), EngineError> {
    if price > MAX_PRICE {
        return Err(EngineError::LimitExceeded("price too high"));
    }
    Ok(())
}

/// The cancha itself plus its neighbors, as found in the locked group.
pub(crate) fn scope<'a>(group: &'a LockedGroup, cancha_id: Ulid, neighbors: &[Ulid]) -> Vec<&'a CanchaState> {
    std::iter::once(&cancha_id)
        .chain(neighbors)
        .filter_map(|id| group.get(id))
        .collect()
}

/// First reserva in `canchas` overlapping `span`, ignoring ids in `ignore`.
pub(crate) fn first_conflict(canchas: &[&CanchaState], span: &Span, ignore: &HashSet<Ulid>) -> Option<Ulid> {
    canchas
        .iter()
        .flat_map(|cs| cs.overlapping(span))
        .find(|r| !ignore.contains(&r.id))
        .map(|r| r.id)
}

pub(crate) fn check_no_conflict(
    canchas: &[&CanchaState],
    span: &Span,
    ignore: &HashSet<Ulid>,
) -> Result<(), EngineError> {
    match first_conflict(canchas, span, ignore) {
        Some(id) => {
            metrics::counter!(observability::CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Conflict(id))
        }
        None => Ok(()),
    }
}

/// Split candidate dates into free and conflicting occurrences, in date order.
pub(crate) fn partition(
    canchas: &[&CanchaState],
    dates: &[NaiveDate],
    hour: u32,
    hours: u32,
    ignore: &HashSet<Ulid>,
) -> Vec<Occurrence> {
    dates
        .iter()
        .map(|&date| Occurrence {
            date,
            conflict: first_conflict(canchas, &slot_span(date, hour, hours), ignore),
        })
        .collect()
}
