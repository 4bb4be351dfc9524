use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::day_span;
use crate::limits::MAX_SLOT_HOURS;
use crate::model::*;

use super::availability::{free_spans, free_start_hours};
use super::{Engine, EngineError};

impl Engine {
    pub async fn list_canchas(&self, local: Option<Local>) -> Vec<CanchaInfo> {
        let shared: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for cs in shared {
            let guard = cs.read().await;
            if local.is_some_and(|l| l != guard.local) {
                continue;
            }
            out.push(CanchaInfo {
                id: guard.id,
                local: guard.local,
                name: guard.name.clone(),
                price: guard.price,
            });
        }
        out.sort_by(|a, b| a.local.as_str().cmp(b.local.as_str()).then_with(|| a.name.cmp(&b.name)));
        out
    }

    pub fn list_links(&self) -> Vec<LinkInfo> {
        let mut links: Vec<LinkInfo> = self.links.iter().map(|l| *l.value()).collect();
        links.sort_by_key(|l| l.id);
        links
    }

    pub fn list_fijas(&self, cancha_id: Option<Ulid>) -> Vec<FijaInfo> {
        let mut fijas: Vec<FijaInfo> = self
            .fijas
            .iter()
            .filter(|f| cancha_id.is_none_or(|c| c == f.cancha_id))
            .map(|f| f.value().clone())
            .collect();
        fijas.sort_by_key(|f| (f.cancha_id, f.weekday.num_days_from_monday(), f.hour));
        fijas
    }

    pub fn get_fija(&self, id: Ulid) -> Option<FijaInfo> {
        self.fijas.get(&id).map(|f| f.value().clone())
    }

    /// Reservas on one cancha for one day, by start hour.
    pub async fn reservas_for_cancha(&self, cancha_id: Ulid, date: NaiveDate) -> Vec<ReservaInfo> {
        let Some(cs) = self.get_cancha(&cancha_id) else {
            return Vec::new();
        };
        let guard = cs.read().await;
        guard
            .overlapping(&day_span(date))
            .map(|r| ReservaInfo::new(cancha_id, r))
            .collect()
    }

    /// Every reserva at a local for one day, ordered by hour then cancha.
    pub async fn reservas_for_local(&self, local: Local, date: NaiveDate) -> Vec<ReservaInfo> {
        let mut out = Vec::new();
        for cancha in self.list_canchas(Some(local)).await {
            out.extend(self.reservas_for_cancha(cancha.id, date).await);
        }
        out.sort_by_key(|r| (r.hour, r.cancha_id));
        out
    }

    /// Every instance of a fija, past and upcoming, by date.
    pub async fn reservas_for_fija(&self, fija_id: Ulid) -> Vec<ReservaInfo> {
        let Some(fija) = self.get_fija(fija_id) else {
            return Vec::new();
        };
        let Some(cs) = self.get_cancha(&fija.cancha_id) else {
            return Vec::new();
        };
        let guard = cs.read().await;
        guard
            .instances_of(fija_id)
            .map(|r| ReservaInfo::new(fija.cancha_id, r))
            .collect()
    }

    /// Start hours on `date` where a `hours`-long reserva could be booked on
    /// the cancha, taking linked canchas into account.
    pub async fn availability(
        &self,
        cancha_id: Ulid,
        date: NaiveDate,
        hours: u32,
    ) -> Result<Vec<u32>, EngineError> {
        if hours == 0 || hours > MAX_SLOT_HOURS {
            return Err(EngineError::LimitExceeded("reserva length out of range"));
        }
        if self.get_cancha(&cancha_id).is_none() {
            return Err(EngineError::NotFound(cancha_id));
        }
        let guards = self.read_group(&[cancha_id]).await;
        let canchas: Vec<&CanchaState> = guards.iter().map(|g| &**g).collect();
        let free = free_spans(&canchas, &day_span(date));
        Ok(free_start_hours(
            &self.calendar,
            &free,
            date,
            hours,
            self.calendar.now_ms(),
        ))
    }
}
