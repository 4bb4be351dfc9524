use std::collections::HashSet;

use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::calendar::{date_hour, slot_span};
use crate::limits::*;
use crate::model::*;

use super::conflict::{
    check_no_conflict, scope, validate_contact, validate_price, validate_shape, validate_slot,
};
use super::{Engine, EngineError, WalCommand};

fn validate_cancha_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Invalid("cancha name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("cancha name too long"));
    }
    Ok(())
}

impl Engine {
    // ── Canchas ──────────────────────────────────────────────

    pub async fn create_cancha(
        &self,
        id: Ulid,
        local: Local,
        name: String,
        price: u32,
    ) -> Result<(), EngineError> {
        let _topology = self.topology.write().await;
        if self.state.len() >= MAX_CANCHAS {
            return Err(EngineError::LimitExceeded("too many canchas"));
        }
        validate_cancha_name(&name)?;
        validate_price(price)?;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::CanchaCreated { id, local, name, price };
        self.persist_global(&event).await?;
        info!(%id, %local, "cancha created");
        Ok(())
    }

    pub async fn update_cancha(
        &self,
        id: Ulid,
        name: Option<String>,
        price: Option<u32>,
    ) -> Result<(), EngineError> {
        let _topology = self.topology.read().await;
        let cs = self.get_cancha(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = cs.write().await;
        let name = name.unwrap_or_else(|| guard.name.clone());
        let price = price.unwrap_or(guard.price);
        validate_cancha_name(&name)?;
        validate_price(price)?;

        let event = Event::CanchaUpdated { id, name, price };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Only canchas with no reservas, fijas or links can go.
    pub async fn delete_cancha(&self, id: Ulid) -> Result<(), EngineError> {
        let _topology = self.topology.write().await;
        let cs = self.get_cancha(&id).ok_or(EngineError::NotFound(id))?;
        if self.links.iter().any(|l| l.hub_id == id || l.member_id == id) {
            return Err(EngineError::InUse(id, "linked to other canchas"));
        }
        if self.fijas.iter().any(|f| f.cancha_id == id) {
            return Err(EngineError::InUse(id, "has reservas fijas"));
        }
        let guard = cs.write().await;
        if !guard.reservas.is_empty() {
            return Err(EngineError::InUse(id, "has reservas"));
        }

        self.persist_global(&Event::CanchaDeleted { id }).await?;
        drop(guard);
        info!(%id, "cancha deleted");
        Ok(())
    }

    // ── Links ────────────────────────────────────────────────

    /// Make `member_id` share availability with `hub_id`. Existing reservas
    /// that would collide across the two block the link.
    pub async fn link_canchas(&self, id: Ulid, hub_id: Ulid, member_id: Ulid) -> Result<(), EngineError> {
        if hub_id == member_id {
            return Err(EngineError::InvalidLink("a cancha can't be linked to itself"));
        }
        let _topology = self.topology.write().await;
        if self.links.len() >= MAX_LINKS {
            return Err(EngineError::LimitExceeded("too many links"));
        }
        if self.links.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.neighbors(hub_id).contains(&member_id) {
            return Err(EngineError::InvalidLink("canchas already linked"));
        }

        let group = self.lock_group(&[hub_id, member_id]).await?;
        let hub = group.get(&hub_id).ok_or(EngineError::NotFound(hub_id))?;
        let member = group.get(&member_id).ok_or(EngineError::NotFound(member_id))?;
        if hub.local != member.local {
            return Err(EngineError::InvalidLink("linked canchas must share a local"));
        }
        let none = HashSet::new();
        for r in &hub.reservas {
            check_no_conflict(&[member], &r.span, &none)?;
        }

        self.persist_global(&Event::CanchasLinked(Link { id, hub_id, member_id }))
            .await?;
        drop(group);
        info!(%id, %hub_id, %member_id, "canchas linked");
        Ok(())
    }

    pub async fn unlink_canchas(&self, id: Ulid) -> Result<Link, EngineError> {
        let _topology = self.topology.write().await;
        let link = self
            .links
            .get(&id)
            .map(|l| *l.value())
            .ok_or(EngineError::NotFound(id))?;
        let group = self.lock_group(&[link.hub_id, link.member_id]).await?;
        self.persist_global(&Event::CanchasUnlinked { id }).await?;
        drop(group);
        info!(%id, "canchas unlinked");
        Ok(link)
    }

    // ── Reservas ─────────────────────────────────────────────

    pub async fn confirm_reserva(&self, req: NewReserva) -> Result<(), EngineError> {
        validate_contact(&req.contact)?;
        if let Some(price) = req.price {
            validate_price(price)?;
        }
        let span = validate_slot(&self.calendar, req.date, req.hour, req.hours)?;
        let _topology = self.topology.read().await;
        let neighbors = self.neighbors(req.cancha_id);
        let mut group = self.lock_group(&[req.cancha_id]).await?;
        if self.reserva_to_cancha.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        {
            let canchas = scope(&group, req.cancha_id, &neighbors);
            check_no_conflict(&canchas, &span, &HashSet::new())?;
        }
        let cs = group
            .get_mut(&req.cancha_id)
            .ok_or(EngineError::NotFound(req.cancha_id))?;
        if cs.reservas.len() >= MAX_RESERVAS_PER_CANCHA {
            return Err(EngineError::LimitExceeded("too many reservas on cancha"));
        }

        let reserva = Reserva {
            id: req.id,
            span,
            price: req.price.unwrap_or(cs.price),
            contact: req.contact,
            fija_id: None,
        };
        let event = Event::ReservaConfirmed { cancha_id: req.cancha_id, reserva };
        self.persist_and_apply(cs, &event).await?;
        info!(id = %req.id, cancha_id = %req.cancha_id, date = %req.date, hour = req.hour, "reserva confirmed");
        Ok(())
    }

    /// Book several reservas at once. All-or-nothing: if any one conflicts
    /// (with stored reservas or with another in the batch) none are written.
    pub async fn batch_confirm_reservas(&self, reqs: Vec<NewReserva>) -> Result<(), EngineError> {
        if reqs.is_empty() {
            return Ok(());
        }
        if reqs.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }

        let mut ids = HashSet::new();
        let mut spans = Vec::with_capacity(reqs.len());
        for req in &reqs {
            validate_contact(&req.contact)?;
            if let Some(price) = req.price {
                validate_price(price)?;
            }
            if !ids.insert(req.id) || self.reserva_to_cancha.contains_key(&req.id) {
                return Err(EngineError::AlreadyExists(req.id));
            }
            spans.push(validate_slot(&self.calendar, req.date, req.hour, req.hours)?);
        }

        let _topology = self.topology.read().await;
        let cancha_ids: Vec<Ulid> = reqs.iter().map(|r| r.cancha_id).collect();
        let mut group = self.lock_group(&cancha_ids).await?;

        // Phase 1: validate against stored state and within the batch.
        let none = HashSet::new();
        let neighbors: Vec<Vec<Ulid>> = reqs.iter().map(|r| self.neighbors(r.cancha_id)).collect();
        for (i, req) in reqs.iter().enumerate() {
            let canchas = scope(&group, req.cancha_id, &neighbors[i]);
            check_no_conflict(&canchas, &spans[i], &none)?;
            for j in (i + 1)..reqs.len() {
                let shares = reqs[j].cancha_id == req.cancha_id
                    || neighbors[i].contains(&reqs[j].cancha_id);
                if shares && spans[i].overlaps(&spans[j]) {
                    return Err(EngineError::Conflict(req.id));
                }
            }
        }

        // Phase 2: commit.
        for (req, span) in reqs.into_iter().zip(spans) {
            let cs = group
                .get_mut(&req.cancha_id)
                .ok_or(EngineError::NotFound(req.cancha_id))?;
            let reserva = Reserva {
                id: req.id,
                span,
                price: req.price.unwrap_or(cs.price),
                contact: req.contact,
                fija_id: None,
            };
            let event = Event::ReservaConfirmed { cancha_id: req.cancha_id, reserva };
            self.persist_and_apply(cs, &event).await?;
        }
        info!(count = ids.len(), "reserva batch confirmed");
        Ok(())
    }

    /// Change contact, price or slot of a reserva. Moving it re-runs the
    /// booking checks, ignoring the reserva itself.
    pub async fn update_reserva(&self, id: Ulid, patch: ReservaPatch) -> Result<ReservaInfo, EngineError> {
        let _topology = self.topology.read().await;
        let cancha_id = self
            .get_cancha_for_reserva(&id)
            .ok_or(EngineError::NotFound(id))?;
        let neighbors = self.neighbors(cancha_id);
        let mut group = self.lock_group(&[cancha_id]).await?;

        let current = group
            .get(&cancha_id)
            .and_then(|cs| cs.get_reserva(id))
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        let span = if patch.moves_slot() {
            let (date, hour) = date_hour(current.span.start);
            let date = patch.date.unwrap_or(date);
            let hour = patch.hour.unwrap_or(hour);
            let hours = patch.hours.unwrap_or(current.span.hours());
            let span = validate_slot(&self.calendar, date, hour, hours)?;
            let canchas = scope(&group, cancha_id, &neighbors);
            check_no_conflict(&canchas, &span, &HashSet::from([id]))?;
            span
        } else {
            current.span
        };

        let updated = Reserva {
            id,
            span,
            contact: Contact {
                name: patch.name.unwrap_or(current.contact.name),
                phone: patch.phone.unwrap_or(current.contact.phone),
            },
            price: patch.price.unwrap_or(current.price),
            fija_id: current.fija_id,
        };
        validate_contact(&updated.contact)?;
        validate_price(updated.price)?;

        let info = ReservaInfo::new(cancha_id, &updated);
        let cs = group.get_mut(&cancha_id).ok_or(EngineError::NotFound(cancha_id))?;
        let event = Event::ReservaUpdated { cancha_id, reserva: updated };
        self.persist_and_apply(cs, &event).await?;
        info!(%id, %cancha_id, "reserva updated");
        Ok(info)
    }

    /// Returns the cancha the reserva was on.
    pub async fn cancel_reserva(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _topology = self.topology.read().await;
        let cancha_id = self
            .get_cancha_for_reserva(&id)
            .ok_or(EngineError::NotFound(id))?;
        let cs = self.get_cancha(&cancha_id).ok_or(EngineError::NotFound(cancha_id))?;
        let mut guard = cs.write().await;
        if guard.get_reserva(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::ReservaCancelled { id, cancha_id };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(%id, %cancha_id, "reserva cancelled");
        Ok(cancha_id)
    }

    /// Book one `hours`-long slot; used by fija generation which has already
    /// checked conflicts under the group lock.
    pub(super) async fn book_instance(
        &self,
        cs: &mut CanchaState,
        fija: &Fija,
        date: chrono::NaiveDate,
    ) -> Result<(), EngineError> {
        validate_shape(&self.calendar, fija.hour, fija.hours)?;
        let reserva = Reserva {
            id: Ulid::new(),
            span: slot_span(date, fija.hour, fija.hours),
            contact: fija.contact.clone(),
            price: fija.price,
            fija_id: Some(fija.id),
        };
        let event = Event::ReservaConfirmed { cancha_id: fija.cancha_id, reserva };
        self.persist_and_apply(cs, &event).await
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        let mut reserva_events = Vec::new();

        // Held until the swap so no write lands between the snapshot and
        // the new file.
        let _topology = self.topology.write().await;
        let ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        let guards = self.read_group(&ids).await;
        for guard in &guards {
            events.push(Event::CanchaCreated {
                id: guard.id,
                local: guard.local,
                name: guard.name.clone(),
                price: guard.price,
            });
            for reserva in &guard.reservas {
                reserva_events.push(Event::ReservaConfirmed {
                    cancha_id: guard.id,
                    reserva: reserva.clone(),
                });
            }
        }
        events.extend(self.links.iter().map(|l| Event::CanchasLinked(*l.value())));
        events.extend(self.fijas.iter().map(|f| Event::FijaCreated(f.value().clone())));
        events.extend(reserva_events);

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Compact once `threshold` appends have piled up. Returns whether it ran.
    pub async fn compact_if_needed(&self, threshold: u64) -> Result<bool, EngineError> {
        if threshold == 0 || self.wal_appends_since_compact().await < threshold {
            return Ok(false);
        }
        self.compact_wal().await?;
        info!("WAL compacted");
        Ok(true)
    }
}
