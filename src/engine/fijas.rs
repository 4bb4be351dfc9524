//! Reservas fijas: weekly templates and the reservas generated from them.

use std::collections::HashSet;

use chrono::{NaiveDate, Weekday};
use tracing::{info, warn};
use ulid::Ulid;

use crate::calendar::{add_days, date_hour, slot_span};
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, partition, scope, validate_contact, validate_price, validate_shape};
use super::recurrence::{next_occurrences, reschedule};
use super::{Engine, EngineError, LockedGroup};

impl Engine {
    /// First date a slot at `hour` can still be booked: today, unless
    /// today's slot has already started.
    fn first_bookable(&self, from: NaiveDate, hour: u32, hours: u32) -> NaiveDate {
        let today = self.calendar.today();
        if from > today {
            return from;
        }
        if slot_span(today, hour, hours).start < self.calendar.now_ms() {
            add_days(today, 1)
        } else {
            today
        }
    }

    /// Lock a fija's cancha group and read the template under that lock.
    /// Fija writes all hold the cancha lock, so the copy returned is current
    /// until the group is dropped.
    async fn lock_fija(&self, id: Ulid) -> Result<(Fija, LockedGroup), EngineError> {
        let cancha_id = self
            .fijas
            .get(&id)
            .map(|f| f.cancha_id)
            .ok_or(EngineError::NotFound(id))?;
        let group = self.lock_group(&[cancha_id]).await?;
        let fija = self
            .fijas
            .get(&id)
            .map(|f| f.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        Ok((fija, group))
    }

    fn upcoming(&self, weekday: Weekday, hour: u32, hours: u32, from: Option<NaiveDate>) -> Vec<NaiveDate> {
        let from = from.unwrap_or_else(|| self.calendar.today());
        next_occurrences(weekday, self.first_bookable(from, hour, hours), FIJA_OCCURRENCES)
    }

    /// Which of the next occurrences could be booked, without writing anything.
    pub async fn preview_fija(
        &self,
        cancha_id: Ulid,
        weekday: Weekday,
        hour: u32,
        hours: u32,
        from: Option<NaiveDate>,
    ) -> Result<Vec<Occurrence>, EngineError> {
        validate_shape(&self.calendar, hour, hours)?;
        let _topology = self.topology.read().await;
        if self.get_cancha(&cancha_id).is_none() {
            return Err(EngineError::NotFound(cancha_id));
        }
        let dates = self.upcoming(weekday, hour, hours, from);
        let guards = self.read_group(&[cancha_id]).await;
        let canchas: Vec<&CanchaState> = guards.iter().map(|g| &**g).collect();
        Ok(partition(&canchas, &dates, hour, hours, &HashSet::new()))
    }

    /// Store the template and book every free occurrence. Conflicting dates
    /// are skipped and reported, not treated as an error.
    pub async fn create_fija(&self, req: NewFija) -> Result<FijaOutcome, EngineError> {
        validate_shape(&self.calendar, req.hour, req.hours)?;
        validate_contact(&req.contact)?;
        if let Some(price) = req.price {
            validate_price(price)?;
        }
        let _topology = self.topology.read().await;
        let neighbors = self.neighbors(req.cancha_id);
        let mut group = self.lock_group(&[req.cancha_id]).await?;
        if self.fijas.len() >= MAX_FIJAS {
            return Err(EngineError::LimitExceeded("too many reservas fijas"));
        }
        if self.fijas.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        let price = group
            .get(&req.cancha_id)
            .map(|cs| req.price.unwrap_or(cs.price))
            .ok_or(EngineError::NotFound(req.cancha_id))?;
        let fija = Fija {
            id: req.id,
            cancha_id: req.cancha_id,
            weekday: req.weekday,
            hour: req.hour,
            hours: req.hours,
            contact: req.contact,
            price,
        };

        let dates = self.upcoming(fija.weekday, fija.hour, fija.hours, None);
        let occurrences = {
            let canchas = scope(&group, fija.cancha_id, &neighbors);
            partition(&canchas, &dates, fija.hour, fija.hours, &HashSet::new())
        };

        self.persist_global(&Event::FijaCreated(fija.clone())).await?;
        let cs = group
            .get_mut(&fija.cancha_id)
            .ok_or(EngineError::NotFound(fija.cancha_id))?;
        let mut outcome = FijaOutcome::default();
        for occ in occurrences {
            if let Some(blocker) = occ.conflict {
                warn!(fija_id = %fija.id, date = %occ.date, %blocker, "fija occurrence skipped: conflict");
                outcome.conflicts.push(occ.date);
                continue;
            }
            self.book_instance(cs, &fija, occ.date).await?;
            outcome.booked.push(occ.date);
        }
        info!(
            id = %fija.id,
            cancha_id = %fija.cancha_id,
            booked = outcome.booked.len(),
            conflicts = outcome.conflicts.len(),
            "reserva fija created"
        );
        Ok(outcome)
    }

    /// Edit a template and rewrite every instance that hasn't started yet.
    ///
    /// Instances keep their week and move to the new weekday/hour; one that
    /// would land in the past moves a week forward. If any rewritten
    /// instance would conflict, nothing is changed.
    pub async fn update_fija(&self, id: Ulid, patch: FijaPatch) -> Result<Fija, EngineError> {
        let _topology = self.topology.read().await;
        let (fija, mut group) = self.lock_fija(id).await?;
        let new = patch.apply(&fija);
        validate_shape(&self.calendar, new.hour, new.hours)?;
        validate_contact(&new.contact)?;
        validate_price(new.price)?;

        let neighbors = self.neighbors(new.cancha_id);
        let now = self.calendar.now_ms();

        let (instances, ignore): (Vec<Reserva>, HashSet<Ulid>) = {
            let cs = group
                .get(&new.cancha_id)
                .ok_or(EngineError::NotFound(new.cancha_id))?;
            let ignore = cs.instances_of(id).map(|r| r.id).collect();
            let upcoming = cs
                .instances_of(id)
                .filter(|r| r.span.start >= now)
                .cloned()
                .collect();
            (upcoming, ignore)
        };

        let dates: Vec<NaiveDate> = instances.iter().map(|r| date_hour(r.span.start).0).collect();
        let earliest = self.first_bookable(self.calendar.today(), new.hour, new.hours);
        let moved = reschedule(&dates, new.weekday, earliest);

        let rewritten: Vec<Reserva> = instances
            .iter()
            .zip(&moved)
            .map(|(r, &date)| Reserva {
                id: r.id,
                span: slot_span(date, new.hour, new.hours),
                contact: new.contact.clone(),
                price: new.price,
                fija_id: Some(id),
            })
            .collect();
        {
            let canchas = scope(&group, new.cancha_id, &neighbors);
            for r in &rewritten {
                check_no_conflict(&canchas, &r.span, &ignore)?;
            }
        }

        self.persist_global(&Event::FijaUpdated(new.clone())).await?;
        let cs = group
            .get_mut(&new.cancha_id)
            .ok_or(EngineError::NotFound(new.cancha_id))?;
        let count = rewritten.len();
        for reserva in rewritten {
            let event = Event::ReservaUpdated { cancha_id: new.cancha_id, reserva };
            self.persist_and_apply(cs, &event).await?;
        }
        info!(%id, instances = count, "reserva fija updated");
        Ok(new)
    }

    /// Remove the template and every reserva generated from it. Returns how
    /// many reservas went with it.
    pub async fn delete_fija(&self, id: Ulid) -> Result<usize, EngineError> {
        let _topology = self.topology.read().await;
        let (fija, mut group) = self.lock_fija(id).await?;
        let cs = group
            .get_mut(&fija.cancha_id)
            .ok_or(EngineError::NotFound(fija.cancha_id))?;

        let instance_ids: Vec<Ulid> = cs.instances_of(id).map(|r| r.id).collect();
        for &reserva_id in &instance_ids {
            let event = Event::ReservaCancelled { id: reserva_id, cancha_id: fija.cancha_id };
            self.persist_and_apply(cs, &event).await?;
        }
        self.persist_global(&Event::FijaDeleted { id }).await?;
        drop(group);
        info!(%id, instances = instance_ids.len(), "reserva fija deleted");
        Ok(instance_ids.len())
    }

    /// Book whichever of the next occurrences aren't booked yet.
    pub async fn renew_fija(&self, id: Ulid) -> Result<FijaOutcome, EngineError> {
        let _topology = self.topology.read().await;
        let (fija, mut group) = self.lock_fija(id).await?;
        let neighbors = self.neighbors(fija.cancha_id);

        let dates = self.upcoming(fija.weekday, fija.hour, fija.hours, None);
        let occurrences = {
            let cs = group
                .get(&fija.cancha_id)
                .ok_or(EngineError::NotFound(fija.cancha_id))?;
            let booked: HashSet<NaiveDate> = cs
                .instances_of(id)
                .map(|r| date_hour(r.span.start).0)
                .collect();
            let missing: Vec<NaiveDate> = dates.into_iter().filter(|d| !booked.contains(d)).collect();
            let canchas = scope(&group, fija.cancha_id, &neighbors);
            partition(&canchas, &missing, fija.hour, fija.hours, &HashSet::new())
        };

        let cs = group
            .get_mut(&fija.cancha_id)
            .ok_or(EngineError::NotFound(fija.cancha_id))?;
        let mut outcome = FijaOutcome::default();
        for occ in occurrences {
            if occ.is_free() {
                self.book_instance(cs, &fija, occ.date).await?;
                outcome.booked.push(occ.date);
            } else {
                warn!(fija_id = %id, date = %occ.date, "fija renewal skipped: conflict");
                outcome.conflicts.push(occ.date);
            }
        }
        info!(%id, booked = outcome.booked.len(), "reserva fija renewed");
        Ok(outcome)
    }
}
