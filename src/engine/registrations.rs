use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::overlap::{now_ms, validate_span};
use super::{apply_to_event, apply_wallet_entry, Engine, EngineError};

fn validate_event_money(price_minor: i64, currency: &str) -> Result<(), EngineError> {
    if price_minor < 0 {
        return Err(EngineError::InvalidAmount("price must not be negative"));
    }
    if price_minor > MAX_AMOUNT_MINOR {
        return Err(EngineError::InvalidAmount("price too large"));
    }
    if currency.is_empty() || currency.len() > MAX_CURRENCY_LEN {
        return Err(EngineError::InvalidAmount("bad currency code"));
    }
    Ok(())
}

impl Engine {
    /// Mirror a catalog event into the engine. The catalog owns the fields;
    /// we own the rows admitted against them.
    pub async fn create_event(
        &self,
        id: Ulid,
        capacity: Option<u32>,
        price_minor: i64,
        currency: String,
        start: Ms,
        end: Ms,
        status: EventStatus,
    ) -> Result<(), EngineError> {
        if self.events.len() >= MAX_EVENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many events"));
        }
        let span = validate_span(start, end)?;
        validate_event_money(price_minor, &currency)?;
        if self.events.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let record = Record::EventCreated {
            id,
            capacity,
            price_minor,
            currency: currency.clone(),
            span,
            status,
        };
        self.wal_append(&record).await?;
        let event = EventState::new(id, capacity, price_minor, currency, span, status);
        self.events.insert(id, std::sync::Arc::new(tokio::sync::RwLock::new(event)));
        self.notify.publish(&record);
        Ok(())
    }

    /// Full replace of the mirror fields. Takes effect for subsequent
    /// admissions only; existing rows are never retroactively touched.
    pub async fn update_event(
        &self,
        id: Ulid,
        capacity: Option<u32>,
        price_minor: i64,
        currency: String,
        start: Ms,
        end: Ms,
        status: EventStatus,
    ) -> Result<(), EngineError> {
        let span = validate_span(start, end)?;
        validate_event_money(price_minor, &currency)?;
        let event = self.event(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = event.write().await;

        let record = Record::EventUpdated { id, capacity, price_minor, currency, span, status };
        self.persist_and_apply_event(&mut guard, &record).await
    }

    /// Refuses while any registration still consumes a seat.
    pub async fn delete_event(&self, id: Ulid) -> Result<(), EngineError> {
        let event = self.event(&id).ok_or(EngineError::NotFound(id))?;
        let guard = event.write().await;

        let now = now_ms();
        if let Some(r) = guard.registrations.iter().find(|r| r.holds_seat(now)) {
            return Err(EngineError::AlreadyRegistered { user_id: r.user_id, event_id: id });
        }

        let record = Record::EventDeleted { id };
        self.wal_append(&record).await?;
        for r in &guard.registrations {
            self.owner_of.remove(&r.id);
        }
        drop(guard);
        self.events.remove(&id);
        self.notify.publish(&record);
        self.notify.remove(&crate::notify::event_channel(&id));
        Ok(())
    }

    /// Admit one user to an event. Capacity is re-derived from the rows under
    /// the event's write lock in the same critical section as the insert, so
    /// the count can never oversell. Free events confirm immediately; paid
    /// events start a hold and wait for settlement.
    pub async fn register(
        &self,
        id: Ulid,
        event_id: Ulid,
        user_id: Ulid,
    ) -> Result<RegistrationInfo, EngineError> {
        let event = self.event(&event_id).ok_or(EngineError::NotFound(event_id))?;
        let mut guard = event.write().await;
        if guard.status == EventStatus::Closed {
            return Err(EngineError::EventClosed(event_id));
        }
        if guard.registrations.len() >= MAX_REGISTRATIONS_PER_EVENT {
            return Err(EngineError::LimitExceeded("too many registrations on event"));
        }
        if self.owner_of.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let now = now_ms();
        if guard
            .registrations
            .iter()
            .any(|r| r.user_id == user_id && r.holds_seat(now))
        {
            return Err(EngineError::AlreadyRegistered { user_id, event_id });
        }
        if let Some(cap) = guard.capacity
            && guard.seats_taken(now) >= cap as usize {
                metrics::counter!(crate::observability::ADMISSIONS_REJECTED, "kind" => "capacity")
                    .increment(1);
                return Err(EngineError::CapacityExceeded(cap));
            }

        let registration = if guard.price_minor == 0 {
            Registration {
                id,
                user_id,
                status: RegistrationStatus::Confirmed,
                hold_expires_at: None,
                cancel_reason: None,
                created_at: now,
                updated_at: now,
            }
        } else {
            Registration {
                id,
                user_id,
                status: RegistrationStatus::Pending,
                hold_expires_at: Some(now + self.policy.hold_window_ms),
                cancel_reason: None,
                created_at: now,
                updated_at: now,
            }
        };

        let record = Record::RegistrationCreated { event_id, registration: registration.clone() };
        self.persist_and_apply_event(&mut guard, &record).await?;
        Ok(self.registration_info(event_id, &registration).await)
    }

    /// Cancel a registration. When a SUCCEEDED payment backs the seat, the
    /// refund credit rides in the same record as the cancellation, so the two
    /// can never diverge across a crash. Repeat cancels return the row
    /// unchanged.
    pub async fn cancel_registration(&self, id: Ulid) -> Result<RegistrationInfo, EngineError> {
        let (event_id, mut guard) = self.resolve_registration_write(&id).await?;
        let existing = guard
            .registration(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if existing.status == RegistrationStatus::Cancelled {
            return Ok(self.registration_info(event_id, &existing).await);
        }

        let now = now_ms();
        // Refund only what was actually captured: the payment row's amount,
        // not the event's current price.
        let refund = match self.linked_payment(&id).await {
            Some(p) if p.status == PaymentStatus::Succeeded => Some(WalletEntry {
                id: Ulid::new(),
                user_id: existing.user_id,
                kind: LedgerKind::CreditRefund,
                amount_minor: p.amount_minor,
                currency: p.currency.clone(),
                reference: p.id.to_string(),
                created_at: now,
            }),
            _ => None,
        };

        let record = Record::RegistrationCancelled {
            event_id,
            id,
            user_id: existing.user_id,
            reason: CancelReason::Requested,
            refund: refund.clone(),
            at: now,
        };
        self.wal_append(&record).await?;
        apply_to_event(&mut guard, &record, &self.owner_of);
        if let Some(entry) = refund {
            let wallet = self.wallet(&entry.user_id);
            let mut wallet_guard = wallet.write().await;
            apply_wallet_entry(&mut wallet_guard, &entry);
        }
        self.notify.publish(&record);

        let row = guard.registration(&id).cloned().unwrap_or(existing);
        Ok(self.registration_info(event_id, &row).await)
    }

    /// Flip one lapsed hold to CANCELLED. Returns false when the row was
    /// confirmed, cancelled, or refreshed between the sweep's scan and this
    /// call; the re-check runs under the event's write lock.
    pub async fn expire_registration(&self, id: Ulid) -> Result<bool, EngineError> {
        let (event_id, mut guard) = match self.resolve_registration_write(&id).await {
            Ok(resolved) => resolved,
            Err(EngineError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let now = now_ms();
        let Some(existing) = guard.registration(&id) else {
            return Ok(false);
        };
        if !existing.hold_lapsed(now) {
            return Ok(false);
        }

        let record = Record::RegistrationCancelled {
            event_id,
            id,
            user_id: existing.user_id,
            reason: CancelReason::HoldExpired,
            refund: None,
            at: now,
        };
        self.persist_and_apply_event(&mut guard, &record).await?;
        Ok(true)
    }

    /// Most recent payment row linked to a registration, as a snapshot.
    pub(super) async fn linked_payment(&self, reg_id: &Ulid) -> Option<Payment> {
        let payment_id = *self.payment_of.get(reg_id)?.value();
        let arc = self.payment(&payment_id)?;
        let guard = arc.read().await;
        Some(guard.clone())
    }
}
