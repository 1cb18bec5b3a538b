use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::overlap::now_ms;
use super::{apply_wallet_entry, confirm_registration, Engine, EngineError, SharedPayment};

fn validate_payment_amount(amount_minor: i64, currency: &str) -> Result<(), EngineError> {
    if amount_minor <= 0 {
        return Err(EngineError::InvalidAmount("amount must be positive"));
    }
    if amount_minor > MAX_AMOUNT_MINOR {
        return Err(EngineError::InvalidAmount("amount too large"));
    }
    if currency.is_empty() || currency.len() > MAX_CURRENCY_LEN {
        return Err(EngineError::InvalidAmount("bad currency code"));
    }
    Ok(())
}

fn refund_entry(payment: &Payment, now: Ms) -> WalletEntry {
    WalletEntry {
        id: Ulid::new(),
        user_id: payment.user_id,
        kind: LedgerKind::CreditRefund,
        amount_minor: payment.amount_minor,
        currency: payment.currency.clone(),
        reference: payment.id.to_string(),
        created_at: now,
    }
}

impl Engine {
    /// Open a payment for a held registration. WALLET settles inside this
    /// call; CARD returns a PENDING row that resolves via `confirm_external`.
    pub async fn initiate_event_payment(
        &self,
        id: Ulid,
        registration_id: Ulid,
        method: PaymentMethod,
        amount_minor: i64,
        currency: String,
    ) -> Result<Payment, EngineError> {
        if self.payments.len() >= MAX_PAYMENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many payments"));
        }
        validate_payment_amount(amount_minor, &currency)?;
        if self.payments.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        match method {
            PaymentMethod::Wallet => {
                self.settle_event_wallet(id, registration_id, amount_minor, currency)
                    .await
            }
            PaymentMethod::Card => {
                self.open_event_card_intent(id, registration_id, amount_minor, currency)
                    .await
            }
        }
    }

    /// Price and hold checks for an event payment. Runs under the event's
    /// write lock and must be re-run after any lock release.
    async fn check_event_payment(
        &self,
        event: &EventState,
        registration_id: &Ulid,
        amount_minor: i64,
        currency: &str,
        now: Ms,
    ) -> Result<Ulid, EngineError> {
        if event.price_minor == 0 {
            return Err(EngineError::InvalidAmount("event is free"));
        }
        if amount_minor != event.price_minor || currency != event.currency {
            return Err(EngineError::InvalidAmount("amount does not match event price"));
        }
        let reg = event
            .registration(registration_id)
            .ok_or(EngineError::NotFound(*registration_id))?;
        if reg.status != RegistrationStatus::Pending || reg.hold_lapsed(now) {
            metrics::counter!(crate::observability::ADMISSIONS_REJECTED, "kind" => "hold_expired")
                .increment(1);
            return Err(EngineError::HoldExpired(*registration_id));
        }
        if let Some(p) = self.linked_payment(registration_id).await
            && p.status == PaymentStatus::Pending {
                return Err(EngineError::PaymentInFlight(*registration_id));
            }
        Ok(reg.user_id)
    }

    async fn settle_event_wallet(
        &self,
        id: Ulid,
        registration_id: Ulid,
        amount_minor: i64,
        currency: String,
    ) -> Result<Payment, EngineError> {
        let (event_id, mut event_guard) = self.resolve_registration_write(&registration_id).await?;
        let now = now_ms();
        let user_id = self
            .check_event_payment(&event_guard, &registration_id, amount_minor, &currency, now)
            .await?;

        let mut payment = Payment {
            id,
            user_id,
            purpose: PaymentPurpose::EventPayment,
            event_id: Some(event_id),
            registration_id: Some(registration_id),
            reference: None,
            method: PaymentMethod::Wallet,
            amount_minor,
            currency: currency.clone(),
            status: PaymentStatus::Pending,
            external_ref: None,
            created_at: now,
            settled_at: None,
        };
        let created = Record::PaymentCreated { payment: payment.clone() };

        let wallet = self.wallet(&user_id);
        let mut wallet_guard = wallet.write().await;
        let balance = wallet_guard.balance(&currency);
        if balance < amount_minor {
            // The attempt is still recorded: the payment lands FAILED and the
            // registration stays PENDING for a retry within the hold window.
            let settled = Record::PaymentSettled {
                id,
                user_id,
                event_id: Some(event_id),
                registration_id: Some(registration_id),
                outcome: PaymentOutcome::Failed,
                debit: None,
                registration_confirmed: false,
                compensation: None,
                at: now,
            };
            self.wal_append_all(&[created.clone(), settled.clone()]).await?;
            payment.status = PaymentStatus::Failed;
            payment.settled_at = Some(now);
            self.insert_payment_row(&payment);
            self.notify.publish(&created);
            self.notify.publish(&settled);
            metrics::counter!(crate::observability::SETTLEMENTS_TOTAL, "outcome" => "failed")
                .increment(1);
            metrics::counter!(crate::observability::ADMISSIONS_REJECTED, "kind" => "funds")
                .increment(1);
            return Err(EngineError::InsufficientFunds { requested: amount_minor, balance });
        }

        let debit = WalletEntry {
            id: Ulid::new(),
            user_id,
            kind: LedgerKind::DebitEventPayment,
            amount_minor,
            currency: currency.clone(),
            reference: id.to_string(),
            created_at: now,
        };
        let settled = Record::PaymentSettled {
            id,
            user_id,
            event_id: Some(event_id),
            registration_id: Some(registration_id),
            outcome: PaymentOutcome::Succeeded,
            debit: Some(debit.clone()),
            registration_confirmed: true,
            compensation: None,
            at: now,
        };
        self.wal_append_all(&[created.clone(), settled.clone()]).await?;
        payment.status = PaymentStatus::Succeeded;
        payment.settled_at = Some(now);
        self.insert_payment_row(&payment);
        confirm_registration(&mut event_guard, &registration_id, now);
        apply_wallet_entry(&mut wallet_guard, &debit);
        self.notify.publish(&created);
        self.notify.publish(&settled);
        metrics::counter!(crate::observability::SETTLEMENTS_TOTAL, "outcome" => "succeeded")
            .increment(1);
        info!("wallet payment {id} settled registration {registration_id}");
        Ok(payment)
    }

    async fn open_event_card_intent(
        &self,
        id: Ulid,
        registration_id: Ulid,
        amount_minor: i64,
        currency: String,
    ) -> Result<Payment, EngineError> {
        // Validate before paying for the gateway round trip. The lock is gone
        // by the time the gateway is called.
        {
            let (_, event_guard) = self.resolve_registration_write(&registration_id).await?;
            let now = now_ms();
            self.check_event_payment(&event_guard, &registration_id, amount_minor, &currency, now)
                .await?;
        }

        let external_ref = self
            .gateway
            .create_intent(amount_minor, &currency)
            .await
            .map_err(|e| EngineError::Gateway(e.to_string()))?;

        // Re-validate under the write lock: the hold may have lapsed or a
        // rival intent landed while the gateway call was in flight.
        let (event_id, event_guard) = self.resolve_registration_write(&registration_id).await?;
        let now = now_ms();
        let user_id = match self
            .check_event_payment(&event_guard, &registration_id, amount_minor, &currency, now)
            .await
        {
            Ok(user_id) => user_id,
            Err(e) => {
                debug!("gateway intent {external_ref} abandoned: {e}");
                return Err(e);
            }
        };
        if let Some(existing) = self.payment_by_ref.get(&external_ref) {
            return Err(EngineError::AlreadyExists(*existing.value()));
        }

        let payment = Payment {
            id,
            user_id,
            purpose: PaymentPurpose::EventPayment,
            event_id: Some(event_id),
            registration_id: Some(registration_id),
            reference: None,
            method: PaymentMethod::Card,
            amount_minor,
            currency,
            status: PaymentStatus::Pending,
            external_ref: Some(external_ref.clone()),
            created_at: now,
            settled_at: None,
        };
        let record = Record::PaymentCreated { payment: payment.clone() };
        self.wal_append(&record).await?;
        self.insert_payment_row(&payment);
        drop(event_guard);
        self.notify.publish(&record);
        info!("card payment {id} awaiting confirmation under reference {external_ref}");
        Ok(payment)
    }

    /// Collect a marketplace fee from a vendor's account. Same settlement
    /// machinery as event payments, no registration attached.
    pub async fn initiate_vendor_fee(
        &self,
        id: Ulid,
        user_id: Ulid,
        method: PaymentMethod,
        amount_minor: i64,
        currency: String,
        reference: Option<String>,
    ) -> Result<Payment, EngineError> {
        if self.payments.len() >= MAX_PAYMENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many payments"));
        }
        validate_payment_amount(amount_minor, &currency)?;
        if let Some(ref r) = reference
            && r.len() > MAX_REFERENCE_LEN {
                return Err(EngineError::LimitExceeded("reference too long"));
            }
        if self.payments.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let now = now_ms();
        let mut payment = Payment {
            id,
            user_id,
            purpose: PaymentPurpose::VendorFee,
            event_id: None,
            registration_id: None,
            reference,
            method,
            amount_minor,
            currency: currency.clone(),
            status: PaymentStatus::Pending,
            external_ref: None,
            created_at: now,
            settled_at: None,
        };

        match method {
            PaymentMethod::Wallet => {
                let created = Record::PaymentCreated { payment: payment.clone() };
                let wallet = self.wallet(&user_id);
                let mut wallet_guard = wallet.write().await;
                let balance = wallet_guard.balance(&currency);
                if balance < amount_minor {
                    let settled = Record::PaymentSettled {
                        id,
                        user_id,
                        event_id: None,
                        registration_id: None,
                        outcome: PaymentOutcome::Failed,
                        debit: None,
                        registration_confirmed: false,
                        compensation: None,
                        at: now,
                    };
                    self.wal_append_all(&[created.clone(), settled.clone()]).await?;
                    payment.status = PaymentStatus::Failed;
                    payment.settled_at = Some(now);
                    self.insert_payment_row(&payment);
                    self.notify.publish(&created);
                    self.notify.publish(&settled);
                    metrics::counter!(crate::observability::SETTLEMENTS_TOTAL, "outcome" => "failed")
                        .increment(1);
                    return Err(EngineError::InsufficientFunds { requested: amount_minor, balance });
                }

                let debit = WalletEntry {
                    id: Ulid::new(),
                    user_id,
                    kind: LedgerKind::DebitVendorFee,
                    amount_minor,
                    currency: currency.clone(),
                    reference: id.to_string(),
                    created_at: now,
                };
                let settled = Record::PaymentSettled {
                    id,
                    user_id,
                    event_id: None,
                    registration_id: None,
                    outcome: PaymentOutcome::Succeeded,
                    debit: Some(debit.clone()),
                    registration_confirmed: false,
                    compensation: None,
                    at: now,
                };
                self.wal_append_all(&[created.clone(), settled.clone()]).await?;
                payment.status = PaymentStatus::Succeeded;
                payment.settled_at = Some(now);
                self.insert_payment_row(&payment);
                apply_wallet_entry(&mut wallet_guard, &debit);
                self.notify.publish(&created);
                self.notify.publish(&settled);
                metrics::counter!(crate::observability::SETTLEMENTS_TOTAL, "outcome" => "succeeded")
                    .increment(1);
                Ok(payment)
            }
            PaymentMethod::Card => {
                let external_ref = self
                    .gateway
                    .create_intent(amount_minor, &currency)
                    .await
                    .map_err(|e| EngineError::Gateway(e.to_string()))?;
                if let Some(existing) = self.payment_by_ref.get(&external_ref) {
                    return Err(EngineError::AlreadyExists(*existing.value()));
                }

                payment.external_ref = Some(external_ref.clone());
                let record = Record::PaymentCreated { payment: payment.clone() };
                self.wal_append(&record).await?;
                self.insert_payment_row(&payment);
                self.notify.publish(&record);
                info!("card fee {id} awaiting confirmation under reference {external_ref}");
                Ok(payment)
            }
        }
    }

    /// Reconcile an external gateway callback. Safe under redelivery: a
    /// terminal payment is returned unchanged no matter how often the same
    /// reference is confirmed, and with whichever outcome.
    pub async fn confirm_external(
        &self,
        external_ref: &str,
        outcome: PaymentOutcome,
    ) -> Result<Payment, EngineError> {
        let payment_id = *self
            .payment_by_ref
            .get(external_ref)
            .ok_or_else(|| EngineError::UnknownReference(external_ref.to_string()))?
            .value();
        let arc = self
            .payment(&payment_id)
            .ok_or(EngineError::NotFound(payment_id))?;

        let (event_id, registration_id) = {
            let guard = arc.read().await;
            if guard.status.is_terminal() {
                return Ok(guard.clone());
            }
            (guard.event_id, guard.registration_id)
        };

        match event_id.zip(registration_id) {
            Some((event_id, reg_id)) => {
                self.confirm_event_payment(arc, event_id, reg_id, outcome).await
            }
            None => self.confirm_detached_payment(arc, outcome).await,
        }
    }

    async fn confirm_event_payment(
        &self,
        payment_arc: SharedPayment,
        event_id: Ulid,
        reg_id: Ulid,
        outcome: PaymentOutcome,
    ) -> Result<Payment, EngineError> {
        // Event lock first, payment second; same order as every settlement path.
        let Some(event) = self.event(&event_id) else {
            // The event vanished while the card was in flight. Settle the
            // payment on its own; a successful capture is credited straight back.
            return self.confirm_detached_payment(payment_arc, outcome).await;
        };
        let mut event_guard = event.write().await;
        let mut payment_guard = payment_arc.write().await;
        if payment_guard.status.is_terminal() {
            return Ok(payment_guard.clone());
        }

        let now = now_ms();
        let live = outcome == PaymentOutcome::Succeeded
            && event_guard
                .registration(&reg_id)
                .map(|r| r.status == RegistrationStatus::Pending && !r.hold_lapsed(now))
                .unwrap_or(false);
        let compensation = if outcome == PaymentOutcome::Succeeded && !live {
            Some(refund_entry(&payment_guard, now))
        } else {
            None
        };

        let record = Record::PaymentSettled {
            id: payment_guard.id,
            user_id: payment_guard.user_id,
            event_id: Some(event_id),
            registration_id: Some(reg_id),
            outcome,
            debit: None,
            registration_confirmed: live,
            compensation: compensation.clone(),
            at: now,
        };
        self.wal_append(&record).await?;
        payment_guard.status = outcome.as_status();
        payment_guard.settled_at = Some(now);
        if live {
            confirm_registration(&mut event_guard, &reg_id, now);
        } else if let Some(entry) = &compensation {
            let wallet = self.wallet(&entry.user_id);
            let mut wallet_guard = wallet.write().await;
            apply_wallet_entry(&mut wallet_guard, entry);
            info!(
                "late confirmation of payment {}: seat {reg_id} was gone, credited {} {} back",
                payment_guard.id, entry.amount_minor, entry.currency
            );
        }
        self.notify.publish(&record);
        metrics::counter!(
            crate::observability::SETTLEMENTS_TOTAL,
            "outcome" => match outcome {
                PaymentOutcome::Succeeded => "succeeded",
                PaymentOutcome::Failed => "failed",
            }
        )
        .increment(1);
        Ok(payment_guard.clone())
    }

    async fn confirm_detached_payment(
        &self,
        payment_arc: SharedPayment,
        outcome: PaymentOutcome,
    ) -> Result<Payment, EngineError> {
        let mut payment_guard = payment_arc.write().await;
        if payment_guard.status.is_terminal() {
            return Ok(payment_guard.clone());
        }

        let now = now_ms();
        // An event payment whose event is gone can never seat its user.
        let compensation = if outcome == PaymentOutcome::Succeeded
            && payment_guard.purpose == PaymentPurpose::EventPayment
        {
            Some(refund_entry(&payment_guard, now))
        } else {
            None
        };

        let record = Record::PaymentSettled {
            id: payment_guard.id,
            user_id: payment_guard.user_id,
            event_id: payment_guard.event_id,
            registration_id: payment_guard.registration_id,
            outcome,
            debit: None,
            registration_confirmed: false,
            compensation: compensation.clone(),
            at: now,
        };
        self.wal_append(&record).await?;
        payment_guard.status = outcome.as_status();
        payment_guard.settled_at = Some(now);
        if let Some(entry) = &compensation {
            let wallet = self.wallet(&entry.user_id);
            let mut wallet_guard = wallet.write().await;
            apply_wallet_entry(&mut wallet_guard, entry);
            info!(
                "confirmation of payment {} found no event, credited {} {} back",
                payment_guard.id, entry.amount_minor, entry.currency
            );
        }
        self.notify.publish(&record);
        metrics::counter!(
            crate::observability::SETTLEMENTS_TOTAL,
            "outcome" => match outcome {
                PaymentOutcome::Succeeded => "succeeded",
                PaymentOutcome::Failed => "failed",
            }
        )
        .increment(1);
        Ok(payment_guard.clone())
    }
}
