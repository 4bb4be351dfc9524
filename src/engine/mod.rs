mod availability;
mod conflict;
mod error;
mod fijas;
mod mutations;
mod queries;
pub mod recurrence;
#[cfg(test)]
mod tests;

pub use availability::{free_spans, merge_overlapping, subtract_intervals};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;
use ulid::Ulid;

use crate::calendar::Calendar;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

pub type SharedCanchaState = Arc<RwLock<CanchaState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// committed together with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so stray bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Booking state for every cancha, rebuilt from the WAL on startup.
pub struct Engine {
    pub(super) state: DashMap<Ulid, SharedCanchaState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) calendar: Calendar,
    /// Reverse lookup: reserva id → cancha id.
    pub(super) reserva_to_cancha: DashMap<Ulid, Ulid>,
    pub(super) links: DashMap<Ulid, Link>,
    pub(super) fijas: DashMap<Ulid, Fija>,
    /// Taken before any cancha lock. Link changes, cancha creation and
    /// deletion, and compaction hold it exclusively; every other write holds
    /// it shared, so a booking's neighbor set can't change under it.
    pub(super) topology: RwLock<()>,
}

/// Apply a per-cancha event (caller holds the write lock).
fn apply_to_cancha(cs: &mut CanchaState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservaConfirmed { cancha_id, reserva } => {
            cs.insert_reserva(reserva.clone());
            index.insert(reserva.id, *cancha_id);
        }
        Event::ReservaUpdated { reserva, .. } => {
            cs.remove_reserva(reserva.id);
            cs.insert_reserva(reserva.clone());
        }
        Event::ReservaCancelled { id, .. } => {
            cs.remove_reserva(*id);
            index.remove(id);
        }
        Event::CanchaUpdated { name, price, .. } => {
            cs.name = name.clone();
            cs.price = *price;
        }
        // Engine-level events are applied by `apply_global`.
        Event::CanchaCreated { .. }
        | Event::CanchaDeleted { .. }
        | Event::CanchasLinked(_)
        | Event::CanchasUnlinked { .. }
        | Event::FijaCreated(_)
        | Event::FijaUpdated(_)
        | Event::FijaDeleted { .. } => {}
    }
}

/// The cancha an event touches, for per-cancha events.
fn event_cancha_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservaConfirmed { cancha_id, .. }
        | Event::ReservaUpdated { cancha_id, .. }
        | Event::ReservaCancelled { cancha_id, .. } => Some(*cancha_id),
        Event::CanchaUpdated { id, .. } => Some(*id),
        _ => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, calendar: Calendar) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            calendar,
            reserva_to_cancha: DashMap::new(),
            links: DashMap::new(),
            fijas: DashMap::new(),
            topology: RwLock::new(()),
        };

        // Sole owner of every Arc during replay, so try_write never contends.
        // Blocking locks are off limits: this can run inside the runtime.
        for event in &events {
            match event_cancha_id(event) {
                Some(cancha_id) => {
                    if let Some(cs) = engine.get_cancha(&cancha_id) {
                        let mut guard = cs.try_write().map_err(io::Error::other)?;
                        apply_to_cancha(&mut guard, event, &engine.reserva_to_cancha);
                    }
                }
                None => engine.apply_global(event),
            }
        }
        debug!(
            events = events.len(),
            canchas = engine.state.len(),
            fijas = engine.fijas.len(),
            "replayed WAL"
        );

        Ok(engine)
    }

    pub fn calendar(&self) -> &Calendar {
        &self.calendar
    }

    /// Apply an event that changes engine-wide maps rather than one cancha.
    pub(super) fn apply_global(&self, event: &Event) {
        match event {
            Event::CanchaCreated { id, local, name, price } => {
                let cs = CanchaState::new(*id, *local, name.clone(), *price);
                self.state.insert(*id, Arc::new(RwLock::new(cs)));
            }
            Event::CanchaDeleted { id } => {
                self.state.remove(id);
            }
            Event::CanchasLinked(link) => {
                self.links.insert(link.id, *link);
            }
            Event::CanchasUnlinked { id } => {
                self.links.remove(id);
            }
            Event::FijaCreated(fija) | Event::FijaUpdated(fija) => {
                self.fijas.insert(fija.id, fija.clone());
            }
            Event::FijaDeleted { id } => {
                self.fijas.remove(id);
            }
            _ => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply to the locked cancha.
    pub(super) async fn persist_and_apply(
        &self,
        cs: &mut CanchaState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_cancha(cs, event, &self.reserva_to_cancha);
        Ok(())
    }

    /// WAL-append then apply an engine-level event.
    pub(super) async fn persist_global(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_global(event);
        Ok(())
    }

    pub fn get_cancha(&self, id: &Ulid) -> Option<SharedCanchaState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_cancha_for_reserva(&self, reserva_id: &Ulid) -> Option<Ulid> {
        self.reserva_to_cancha.get(reserva_id).map(|e| *e.value())
    }

    /// Canchas sharing availability with `cancha_id`: a hub's members, or a
    /// member's hubs.
    pub fn neighbors(&self, cancha_id: Ulid) -> Vec<Ulid> {
        let mut out: Vec<Ulid> = self
            .links
            .iter()
            .filter_map(|l| {
                if l.hub_id == cancha_id {
                    Some(l.member_id)
                } else if l.member_id == cancha_id {
                    Some(l.hub_id)
                } else {
                    None
                }
            })
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// The given canchas plus their neighbors, sorted and deduplicated.
    fn group_ids(&self, cancha_ids: &[Ulid]) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = cancha_ids.to_vec();
        for id in cancha_ids {
            ids.extend(self.neighbors(*id));
        }
        ids.sort();
        ids.dedup();
        ids
    }

    /// Write-lock the canchas and their neighbors in sorted order, so two
    /// writers touching overlapping groups can't deadlock.
    pub(super) async fn lock_group(&self, cancha_ids: &[Ulid]) -> Result<LockedGroup, EngineError> {
        let mut guards = Vec::new();
        for id in self.group_ids(cancha_ids) {
            let cs = self.get_cancha(&id).ok_or(EngineError::NotFound(id))?;
            guards.push(cs.write_owned().await);
        }
        Ok(LockedGroup { guards })
    }

    /// Read-lock counterpart of [`Engine::lock_group`]. Missing canchas are skipped.
    pub(super) async fn read_group(&self, cancha_ids: &[Ulid]) -> Vec<OwnedRwLockReadGuard<CanchaState>> {
        let mut guards = Vec::new();
        for id in self.group_ids(cancha_ids) {
            if let Some(cs) = self.get_cancha(&id) {
                guards.push(cs.read_owned().await);
            }
        }
        guards
    }
}

/// Write guards over a set of canchas, sorted by id.
pub(super) struct LockedGroup {
    guards: Vec<OwnedRwLockWriteGuard<CanchaState>>,
}

impl LockedGroup {
    pub(super) fn get(&self, id: &Ulid) -> Option<&CanchaState> {
        self.guards.iter().find(|g| g.id == *id).map(|g| &**g)
    }

    pub(super) fn get_mut(&mut self, id: &Ulid) -> Option<&mut CanchaState> {
        self.guards.iter_mut().find(|g| g.id == *id).map(|g| &mut **g)
    }
}
