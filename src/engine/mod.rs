mod error;
mod mutations;
mod queries;
mod reservations;
#[cfg(test)]
mod tests;

pub use error::EngineError;
pub use queries::ReservationFilter;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock, RwLockReadGuard};
use tracing::warn;
use ulid::Ulid;

use crate::checkout::CheckoutProvider;
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::policy::PolicyConfig;
use crate::wal::Wal;

pub type SharedReservation = Arc<RwLock<Reservation>>;

/// Shared hold on the commit gate. Every append-then-apply runs under one, so
/// compaction (which takes the gate exclusively) snapshots only state whose
/// events are all on disk and applied.
pub(super) type CommitPermit<'a> = RwLockReadGuard<'a, ()>;

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

type Pending = Vec<(Event, oneshot::Sender<io::Result<()>>)>;

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then pays for a single fsync and answers every sender in the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Compaction must see every append queued before it.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        flush_and_respond(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: Pending) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &Pending) -> io::Result<()> {
    let appended = batch.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

/// Apply a reservation-level event to a locked reservation.
fn apply_to_reservation(r: &mut Reservation, event: &Event) {
    match event {
        Event::ReservationUpdated(updated) => *r = updated.clone(),
        Event::ConfirmationSent { at, .. } => r.confirmation_sent_at = Some(*at),
        _ => {}
    }
}

pub struct Engine {
    pub(super) reservations: DashMap<Ulid, SharedReservation>,
    pub(super) closures: DashMap<NaiveDate, Closure>,
    /// Keyed by normalized email.
    pub(super) clients: DashMap<String, Client>,
    /// Keyed by endpoint URL.
    pub(super) subscriptions: DashMap<String, PushSubscription>,
    pub(super) email_log: DashMap<Ulid, EmailRecord>,
    pub(super) checkouts: DashMap<Ulid, Checkout>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Taken before any reservation write lock, never the other way round.
    pub(super) commit_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
    pub(super) policy: PolicyConfig,
    pub(super) dispatcher: Dispatcher,
    pub(super) checkout: Arc<dyn CheckoutProvider>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        policy: PolicyConfig,
        dispatcher: Dispatcher,
        checkout: Arc<dyn CheckoutProvider>,
    ) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        let discarded = Wal::truncate_tail(&wal_path, replay.valid_len)?;
        if discarded > 0 {
            warn!("discarded {discarded} bytes of torn WAL tail in {}", wal_path.display());
        }
        let events = replay.events;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            reservations: DashMap::new(),
            closures: DashMap::new(),
            clients: DashMap::new(),
            subscriptions: DashMap::new(),
            email_log: DashMap::new(),
            checkouts: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            notify,
            policy,
            dispatcher,
            checkout,
        };
        for event in &events {
            engine.apply(event);
        }
        tracing::debug!("replayed {} events from {}", events.len(), wal_path.display());
        Ok(engine)
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Apply an event to the in-memory tables. Reservation-level events take
    /// the reservation lock with `try_write`, which only contends outside replay,
    /// where the locked path is used instead.
    fn apply(&self, event: &Event) {
        match event {
            Event::ReservationCreated(r) => {
                self.reservations.insert(r.id, Arc::new(RwLock::new(r.clone())));
            }
            Event::ReservationUpdated(Reservation { id, .. }) | Event::ConfirmationSent { id, .. } => {
                if let Some(entry) = self.reservations.get(id)
                    && let Ok(mut guard) = entry.try_write()
                {
                    apply_to_reservation(&mut guard, event);
                }
            }
            Event::ReservationDeleted { id } => {
                self.reservations.remove(id);
            }
            Event::ClosureSet(c) => {
                self.closures.insert(c.date, c.clone());
            }
            Event::ClosureRemoved { date } => {
                self.closures.remove(date);
            }
            Event::ClientSeen { sighting, at } => {
                self.clients
                    .entry(sighting.email.clone())
                    .and_modify(|c| c.absorb(sighting, *at))
                    .or_insert_with(|| sighting.clone().into_client(*at));
            }
            Event::ClientSaved(c) => {
                self.clients.insert(c.email.clone(), c.clone());
            }
            Event::ClientRemoved { email } => {
                self.clients.remove(email);
            }
            Event::SubscriptionAdded(s) => {
                self.subscriptions.insert(s.endpoint.clone(), s.clone());
            }
            Event::SubscriptionRemoved { endpoint } => {
                self.subscriptions.remove(endpoint);
            }
            Event::EmailLogged(record) => {
                self.email_log.insert(record.id, record.clone());
            }
            Event::CheckoutCreated(c) => {
                self.checkouts.insert(c.id, c.clone());
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    pub(super) async fn commit_permit(&self) -> CommitPermit<'_> {
        self.commit_gate.read().await
    }

    /// WAL-append, apply, notify.
    pub(super) async fn persist_and_apply(&self, event: Event) -> Result<(), EngineError> {
        let _permit = self.commit_permit().await;
        self.wal_append(&event).await?;
        self.apply(&event);
        self.notify.send(&event);
        Ok(())
    }

    /// Same as `persist_and_apply` for an event on a reservation the caller has
    /// locked. The permit must have been taken before the reservation lock.
    pub(super) async fn persist_and_apply_locked(
        &self,
        _permit: &CommitPermit<'_>,
        r: &mut Reservation,
        event: Event,
    ) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        apply_to_reservation(r, &event);
        self.notify.send(&event);
        Ok(())
    }

    pub(super) fn get_reservation(&self, id: &Ulid) -> Result<SharedReservation, EngineError> {
        self.reservations
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::not_found("reservation", id))
    }

    /// Persist the bookkeeping of a dispatch. The reservation itself is already
    /// stored, so failures here are logged rather than returned.
    pub(super) async fn record_dispatch(&self, reservation_id: Ulid, report: DispatchReport) {
        let sent_at = report.confirmation_sent();
        for record in report.emails {
            if let Err(e) = self.persist_and_apply(Event::EmailLogged(record)).await {
                warn!("could not log email for {reservation_id}: {e}");
            }
        }
        if let Some(at) = sent_at
            && let Ok(shared) = self.get_reservation(&reservation_id)
        {
            let permit = self.commit_permit().await;
            let mut guard = shared.write().await;
            let event = Event::ConfirmationSent { id: reservation_id, at };
            if let Err(e) = self.persist_and_apply_locked(&permit, &mut guard, event).await {
                warn!("could not stamp confirmation for {reservation_id}: {e}");
            }
        }
        for endpoint in report.stale_subscriptions {
            if !self.subscriptions.contains_key(&endpoint) {
                continue;
            }
            if let Err(e) = self.persist_and_apply(Event::SubscriptionRemoved { endpoint }).await {
                warn!("could not drop stale push subscription: {e}");
            }
        }
    }
}
