mod bookings;
mod error;
mod overlap;
mod payments;
mod queries;
mod registrations;
mod wallet;

pub use error::EngineError;
pub(crate) use overlap::now_ms;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error};
use ulid::Ulid;

use crate::gateway::CardGateway;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedCourt = Arc<RwLock<CourtState>>;
pub type SharedEvent = Arc<RwLock<EventState>>;
pub type SharedWallet = Arc<RwLock<WalletState>>;
pub type SharedPayment = Arc<RwLock<Payment>>;

/// Admission knobs configured by the operator. Durations are engine-wide, not
/// per court.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub min_booking_ms: Ms,
    pub max_booking_ms: Ms,
    pub hold_window_ms: Ms,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            min_booking_ms: 30 * 60_000,
            max_booking_ms: 4 * 3_600_000,
            hold_window_ms: 15 * 60_000,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { records, response } => {
                let mut batch = vec![(records, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { records, response }) => {
                            batch.push((records, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type AppendBatch = Vec<(Vec<Record>, oneshot::Sender<io::Result<()>>)>;

fn flush_and_respond(wal: &mut Wal, batch: &mut AppendBatch) {
    let record_count: usize = batch.iter().map(|(records, _)| records.len()).sum();
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(record_count as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut AppendBatch) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    'outer: for (records, _) in batch.iter() {
        for record in records {
            if let Err(e) = wal.append_buffered(record) {
                append_err = Some(e);
                break 'outer;
            }
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut AppendBatch, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One tenant's booking and settlement state. Each court, event, wallet, and
/// payment sits behind its own RwLock; admission takes the write lock of the
/// entity it gates on, so check-then-write is atomic per key.
///
/// Operations that touch several maps lock in a fixed order, event before
/// payment before wallet, which keeps the settlement paths deadlock-free.
pub struct Engine {
    pub courts: DashMap<Ulid, SharedCourt>,
    pub events: DashMap<Ulid, SharedEvent>,
    pub wallets: DashMap<Ulid, SharedWallet>,
    pub payments: DashMap<Ulid, SharedPayment>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: reservation/blackout id → court id, registration id → event id.
    pub(super) owner_of: DashMap<Ulid, Ulid>,
    /// External reference → payment id. Enforces uniqueness and routes callbacks.
    pub(super) payment_by_ref: DashMap<String, Ulid>,
    /// Registration id → most recent payment id.
    pub(super) payment_of: DashMap<Ulid, Ulid>,
    pub(super) policy: Policy,
    pub(super) gateway: Arc<dyn CardGateway>,
}

/// Apply a court-scoped record to a CourtState (no locking; caller holds the lock).
fn apply_to_court(court: &mut CourtState, record: &Record, owners: &DashMap<Ulid, Ulid>) {
    match record {
        Record::CourtUpdated { label, location, .. } => {
            court.label = label.clone();
            court.location = location.clone();
        }
        Record::BlackoutAdded { court_id, blackout } => {
            owners.insert(blackout.id, *court_id);
            court.insert_blackout(blackout.clone());
        }
        Record::BlackoutRemoved { id, .. } => {
            court.remove_blackout(id);
            owners.remove(id);
        }
        Record::ReservationCreated { court_id, reservation } => {
            owners.insert(reservation.id, *court_id);
            // Upsert: a compacted WAL re-emits rows that already exist.
            match court.reservation_mut(&reservation.id) {
                Some(existing) => *existing = reservation.clone(),
                None => court.insert_reservation(reservation.clone()),
            }
        }
        Record::ReservationCancelled { id, .. } => {
            // The owner entry stays so a repeated cancel can still resolve the row.
            if let Some(row) = court.reservation_mut(id) {
                row.status = ReservationStatus::Cancelled;
            }
        }
        // Create/delete happen at the map level; records for other maps never route here.
        _ => {}
    }
}

/// Apply an event-scoped record to an EventState (no locking; caller holds the lock).
fn apply_to_event(event: &mut EventState, record: &Record, owners: &DashMap<Ulid, Ulid>) {
    match record {
        Record::EventUpdated { capacity, price_minor, currency, span, status, .. } => {
            event.capacity = *capacity;
            event.price_minor = *price_minor;
            event.currency = currency.clone();
            event.span = *span;
            event.status = *status;
        }
        Record::RegistrationCreated { event_id, registration } => {
            owners.insert(registration.id, *event_id);
            match event.registration_mut(&registration.id) {
                Some(existing) => *existing = registration.clone(),
                None => event.registrations.push(registration.clone()),
            }
        }
        Record::RegistrationCancelled { id, reason, at, .. } => {
            if let Some(row) = event.registration_mut(id) {
                row.status = RegistrationStatus::Cancelled;
                row.cancel_reason = Some(*reason);
                row.updated_at = *at;
            }
        }
        _ => {}
    }
}

/// Flip one registration to CONFIRMED. Shared by live settlement and replay.
fn confirm_registration(event: &mut EventState, reg_id: &Ulid, at: Ms) {
    if let Some(row) = event.registration_mut(reg_id) {
        row.status = RegistrationStatus::Confirmed;
        row.updated_at = at;
    }
}

fn apply_to_payment(payment: &mut Payment, record: &Record) {
    if let Record::PaymentSettled { outcome, at, .. } = record {
        payment.status = outcome.as_status();
        payment.settled_at = Some(*at);
    }
}

fn apply_wallet_entry(wallet: &mut WalletState, entry: &WalletEntry) {
    wallet.entries.push(entry.clone());
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        policy: Policy,
        gateway: Arc<dyn CardGateway>,
    ) -> std::io::Result<Self> {
        let records = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            courts: DashMap::new(),
            events: DashMap::new(),
            wallets: DashMap::new(),
            payments: DashMap::new(),
            wal_tx,
            notify,
            owner_of: DashMap::new(),
            payment_by_ref: DashMap::new(),
            payment_of: DashMap::new(),
            policy,
            gateway,
        };

        // Replay. We are the sole owner of every Arc here, so try_read/try_write
        // always succeed instantly. Never use blocking_read/blocking_write in
        // this loop because it may run inside an async context (lazy tenant
        // creation).
        for record in &records {
            engine.replay_apply(record);
        }
        engine.audit_replay();

        Ok(engine)
    }

    fn replay_apply(&self, record: &Record) {
        match record {
            Record::CourtCreated { id, category, label, location } => {
                let court = CourtState::new(*id, *category, label.clone(), location.clone());
                self.courts.insert(*id, Arc::new(RwLock::new(court)));
            }
            Record::CourtDeleted { id } => {
                if let Some(entry) = self.courts.get(id) {
                    let court = entry.try_read().expect("replay: uncontended read");
                    for r in &court.reservations {
                        self.owner_of.remove(&r.id);
                    }
                    for b in &court.blackouts {
                        self.owner_of.remove(&b.id);
                    }
                }
                self.courts.remove(id);
            }
            Record::CourtUpdated { id, .. }
            | Record::BlackoutAdded { court_id: id, .. }
            | Record::BlackoutRemoved { court_id: id, .. }
            | Record::ReservationCreated { court_id: id, .. }
            | Record::ReservationCancelled { court_id: id, .. } => {
                if let Some(entry) = self.courts.get(id) {
                    let arc = entry.value().clone();
                    let mut guard = arc.try_write().expect("replay: uncontended write");
                    apply_to_court(&mut guard, record, &self.owner_of);
                }
            }
            Record::EventCreated { id, capacity, price_minor, currency, span, status } => {
                let event = EventState::new(
                    *id,
                    *capacity,
                    *price_minor,
                    currency.clone(),
                    *span,
                    *status,
                );
                self.events.insert(*id, Arc::new(RwLock::new(event)));
            }
            Record::EventDeleted { id } => {
                if let Some(entry) = self.events.get(id) {
                    let event = entry.try_read().expect("replay: uncontended read");
                    for r in &event.registrations {
                        self.owner_of.remove(&r.id);
                    }
                }
                self.events.remove(id);
            }
            Record::EventUpdated { id, .. } | Record::RegistrationCreated { event_id: id, .. } => {
                if let Some(entry) = self.events.get(id) {
                    let arc = entry.value().clone();
                    let mut guard = arc.try_write().expect("replay: uncontended write");
                    apply_to_event(&mut guard, record, &self.owner_of);
                }
            }
            Record::RegistrationCancelled { event_id, refund, .. } => {
                if let Some(entry) = self.events.get(event_id) {
                    let arc = entry.value().clone();
                    let mut guard = arc.try_write().expect("replay: uncontended write");
                    apply_to_event(&mut guard, record, &self.owner_of);
                }
                if let Some(entry) = refund {
                    let wallet = self.wallet(&entry.user_id);
                    let mut guard = wallet.try_write().expect("replay: uncontended write");
                    apply_wallet_entry(&mut guard, entry);
                }
            }
            Record::PaymentCreated { payment } => {
                self.insert_payment_row(payment);
            }
            Record::PaymentSettled {
                id,
                event_id,
                registration_id,
                debit,
                registration_confirmed,
                compensation,
                at,
                ..
            } => {
                if let Some(entry) = self.payments.get(id) {
                    let arc = entry.value().clone();
                    let mut guard = arc.try_write().expect("replay: uncontended write");
                    apply_to_payment(&mut guard, record);
                }
                if *registration_confirmed
                    && let (Some(event_id), Some(reg_id)) = (event_id, registration_id)
                    && let Some(entry) = self.events.get(event_id)
                {
                    let arc = entry.value().clone();
                    let mut guard = arc.try_write().expect("replay: uncontended write");
                    confirm_registration(&mut guard, reg_id, *at);
                }
                for entry in [debit, compensation].into_iter().flatten() {
                    let wallet = self.wallet(&entry.user_id);
                    let mut guard = wallet.try_write().expect("replay: uncontended write");
                    apply_wallet_entry(&mut guard, entry);
                }
            }
            Record::LedgerAppended { entry } => {
                let wallet = self.wallet(&entry.user_id);
                let mut guard = wallet.try_write().expect("replay: uncontended write");
                apply_wallet_entry(&mut guard, entry);
            }
        }
    }

    /// Post-replay consistency sweep. Breaches are loud but non-fatal: the log
    /// is the authority and an operator has to decide what a divergent row
    /// means.
    fn audit_replay(&self) {
        let mut breaches = 0usize;

        for entry in self.events.iter() {
            let event = entry.value().try_read().expect("audit: uncontended read");
            if event.price_minor == 0 {
                continue;
            }
            for reg in &event.registrations {
                if reg.status != RegistrationStatus::Confirmed {
                    continue;
                }
                let paid = self
                    .payment_of
                    .get(&reg.id)
                    .and_then(|pid| self.payments.get(&pid))
                    .map(|p| {
                        p.value()
                            .try_read()
                            .expect("audit: uncontended read")
                            .status
                            == PaymentStatus::Succeeded
                    })
                    .unwrap_or(false);
                if !paid {
                    breaches += 1;
                    error!(
                        "consistency breach: confirmed registration {} on paid event {} has no succeeded payment",
                        reg.id, event.id
                    );
                }
            }
        }

        for entry in self.payments.iter() {
            let payment = entry.value().try_read().expect("audit: uncontended read");
            if payment.status.is_terminal() && payment.settled_at.is_none() {
                breaches += 1;
                error!("consistency breach: terminal payment {} has no settled_at", payment.id);
            }
        }

        for entry in self.wallets.iter() {
            let wallet = entry.value().try_read().expect("audit: uncontended read");
            for (currency, balance) in wallet.balances() {
                if balance < 0 {
                    breaches += 1;
                    error!(
                        "consistency breach: wallet {} holds {balance} {currency}",
                        wallet.user_id
                    );
                }
            }
        }

        if breaches > 0 {
            error!("replay audit found {breaches} consistency breach(es)");
        } else {
            debug!("replay audit clean");
        }
    }

    /// Write one record to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, record: &Record) -> Result<(), EngineError> {
        self.wal_append_all(std::slice::from_ref(record)).await
    }

    /// Write several records as one append command: one flush, one ack. The
    /// writer never reorders within a command, so the sequence lands intact
    /// unless the file tears at a crash.
    pub(super) async fn wal_append_all(&self, records: &[Record]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                records: records.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn court(&self, id: &Ulid) -> Option<SharedCourt> {
        self.courts.get(id).map(|e| e.value().clone())
    }

    pub fn event(&self, id: &Ulid) -> Option<SharedEvent> {
        self.events.get(id).map(|e| e.value().clone())
    }

    /// Wallets materialize on first touch; an empty wallet reads as zero
    /// balance everywhere.
    pub fn wallet(&self, user_id: &Ulid) -> SharedWallet {
        self.wallets
            .entry(*user_id)
            .or_insert_with(|| Arc::new(RwLock::new(WalletState::new(*user_id))))
            .value()
            .clone()
    }

    pub fn payment(&self, id: &Ulid) -> Option<SharedPayment> {
        self.payments.get(id).map(|e| e.value().clone())
    }

    pub fn owner_of_row(&self, row_id: &Ulid) -> Option<Ulid> {
        self.owner_of.get(row_id).map(|e| *e.value())
    }

    pub(super) fn insert_payment_row(&self, payment: &Payment) {
        self.payments
            .insert(payment.id, Arc::new(RwLock::new(payment.clone())));
        if let Some(reference) = &payment.external_ref {
            self.payment_by_ref.insert(reference.clone(), payment.id);
        }
        if let Some(reg_id) = payment.registration_id {
            self.payment_of.insert(reg_id, payment.id);
        }
    }

    /// WAL-append + apply + notify in one call for single-court mutations.
    pub(super) async fn persist_and_apply_court(
        &self,
        court: &mut CourtState,
        record: &Record,
    ) -> Result<(), EngineError> {
        self.wal_append(record).await?;
        apply_to_court(court, record, &self.owner_of);
        self.notify.publish(record);
        Ok(())
    }

    /// WAL-append + apply + notify in one call for single-event mutations.
    pub(super) async fn persist_and_apply_event(
        &self,
        event: &mut EventState,
        record: &Record,
    ) -> Result<(), EngineError> {
        self.wal_append(record).await?;
        apply_to_event(event, record, &self.owner_of);
        self.notify.publish(record);
        Ok(())
    }

    /// Lookup row → court, get court, acquire write lock.
    pub(super) async fn resolve_court_row_write(
        &self,
        row_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<CourtState>), EngineError> {
        let court_id = self
            .owner_of_row(row_id)
            .ok_or(EngineError::NotFound(*row_id))?;
        let court = self
            .court(&court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        let guard = court.write_owned().await;
        Ok((court_id, guard))
    }

    /// Lookup registration → event, get event, acquire write lock.
    pub(super) async fn resolve_registration_write(
        &self,
        reg_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<EventState>), EngineError> {
        let event_id = self
            .owner_of_row(reg_id)
            .ok_or(EngineError::NotFound(*reg_id))?;
        let event = self
            .event(&event_id)
            .ok_or(EngineError::NotFound(event_id))?;
        let guard = event.write_owned().await;
        Ok((event_id, guard))
    }

    /// Scan for PENDING registrations whose hold deadline has passed.
    /// Skips events that are write-locked right now; the next sweep catches them.
    pub fn collect_lapsed_holds(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut lapsed = Vec::new();
        for entry in self.events.iter() {
            let Ok(event) = entry.value().try_read() else {
                continue;
            };
            for reg in &event.registrations {
                if reg.hold_lapsed(now) {
                    lapsed.push((reg.id, event.id));
                }
            }
        }
        lapsed
    }

    /// Rebuild the WAL as a minimal record set reproducing current state.
    ///
    /// Each map is snapshotted independently, so a settlement racing the dump
    /// can leave a cross-map skew in the compacted file; the replay audit
    /// reports it on the next boot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut records = Vec::new();

        let courts: Vec<SharedCourt> = self.courts.iter().map(|e| e.value().clone()).collect();
        for arc in courts {
            let court = arc.read().await;
            records.push(Record::CourtCreated {
                id: court.id,
                category: court.category,
                label: court.label.clone(),
                location: court.location.clone(),
            });
            for blackout in &court.blackouts {
                records.push(Record::BlackoutAdded {
                    court_id: court.id,
                    blackout: blackout.clone(),
                });
            }
            for reservation in &court.reservations {
                records.push(Record::ReservationCreated {
                    court_id: court.id,
                    reservation: reservation.clone(),
                });
            }
        }

        let events: Vec<SharedEvent> = self.events.iter().map(|e| e.value().clone()).collect();
        for arc in events {
            let event = arc.read().await;
            records.push(Record::EventCreated {
                id: event.id,
                capacity: event.capacity,
                price_minor: event.price_minor,
                currency: event.currency.clone(),
                span: event.span,
                status: event.status,
            });
            for registration in &event.registrations {
                records.push(Record::RegistrationCreated {
                    event_id: event.id,
                    registration: registration.clone(),
                });
            }
        }

        let payments: Vec<SharedPayment> = self.payments.iter().map(|e| e.value().clone()).collect();
        for arc in payments {
            let payment = arc.read().await;
            records.push(Record::PaymentCreated { payment: payment.clone() });
        }

        let wallets: Vec<SharedWallet> = self.wallets.iter().map(|e| e.value().clone()).collect();
        for arc in wallets {
            let wallet = arc.read().await;
            for entry in &wallet.entries {
                records.push(Record::LedgerAppended { entry: entry.clone() });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
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
}
