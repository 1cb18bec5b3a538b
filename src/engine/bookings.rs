use tracing::warn;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::overlap::{
    blackout_conflict, booked_conflict, conflicting_bookings, duplicate_booking, now_ms,
    validate_booking_duration, validate_span,
};
use super::{Engine, EngineError};

fn reservation_info(court_id: Ulid, r: &Reservation) -> ReservationInfo {
    ReservationInfo {
        id: r.id,
        court_id,
        user_id: r.user_id,
        booked_by: r.booked_by.clone(),
        span: r.span,
        status: r.status,
        created_at: r.created_at,
    }
}

impl Engine {
    pub async fn create_court(
        &self,
        id: Ulid,
        category: CourtCategory,
        label: String,
        location: Option<String>,
    ) -> Result<(), EngineError> {
        if self.courts.len() >= MAX_COURTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many courts"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(EngineError::LimitExceeded("label too long"));
        }
        if let Some(ref l) = location
            && l.len() > MAX_LABEL_LEN {
                return Err(EngineError::LimitExceeded("location too long"));
            }
        if self.courts.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let record = Record::CourtCreated { id, category, label: label.clone(), location: location.clone() };
        self.wal_append(&record).await?;
        let court = CourtState::new(id, category, label, location);
        self.courts.insert(id, std::sync::Arc::new(tokio::sync::RwLock::new(court)));
        self.notify.publish(&record);
        Ok(())
    }

    pub async fn update_court(
        &self,
        id: Ulid,
        label: String,
        location: Option<String>,
    ) -> Result<(), EngineError> {
        if label.len() > MAX_LABEL_LEN {
            return Err(EngineError::LimitExceeded("label too long"));
        }
        if let Some(ref l) = location
            && l.len() > MAX_LABEL_LEN {
                return Err(EngineError::LimitExceeded("location too long"));
            }
        let court = self.court(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = court.write().await;

        let record = Record::CourtUpdated { id, label, location };
        self.persist_and_apply_court(&mut guard, &record).await
    }

    /// Refuses while any BOOKED reservation still lies in the future.
    /// Past rows and cancelled rows go down with the court.
    pub async fn delete_court(&self, id: Ulid) -> Result<(), EngineError> {
        let court = self.court(&id).ok_or(EngineError::NotFound(id))?;
        let guard = court.write().await;

        let now = now_ms();
        if let Some(r) = guard
            .reservations
            .iter()
            .find(|r| r.status == ReservationStatus::Booked && r.span.end > now)
        {
            return Err(EngineError::AlreadyBooked(r.id));
        }

        let record = Record::CourtDeleted { id };
        self.wal_append(&record).await?;
        for r in &guard.reservations {
            self.owner_of.remove(&r.id);
        }
        for b in &guard.blackouts {
            self.owner_of.remove(&b.id);
        }
        // Unlink before releasing the guard; a racing book() holding the Arc
        // must not commit into a court the map no longer knows.
        self.courts.remove(&id);
        drop(guard);
        self.notify.publish(&record);
        self.notify.remove(&crate::notify::court_channel(&id));
        Ok(())
    }

    /// Blackouts may land on top of existing bookings; those are logged for
    /// manual resolution, never auto-cancelled.
    pub async fn add_blackout(
        &self,
        id: Ulid,
        court_id: Ulid,
        start: Ms,
        end: Ms,
        reason: String,
    ) -> Result<(), EngineError> {
        let span = validate_span(start, end)?;
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let court = self.court(&court_id).ok_or(EngineError::NotFound(court_id))?;
        let mut guard = court.write().await;
        if guard.blackouts.len() >= MAX_ROWS_PER_COURT {
            return Err(EngineError::LimitExceeded("too many blackouts on court"));
        }
        if self.owner_of.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let overlapped: Vec<Ulid> = conflicting_bookings(&guard, &span, None).map(|r| r.id).collect();
        if !overlapped.is_empty() {
            warn!(
                "blackout {id} on court {court_id} overlaps booked reservation(s) {overlapped:?}, left for manual resolution"
            );
        }

        let record = Record::BlackoutAdded {
            court_id,
            blackout: Blackout { id, span, reason },
        };
        self.persist_and_apply_court(&mut guard, &record).await
    }

    pub async fn remove_blackout(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (court_id, mut guard) = self.resolve_court_row_write(&id).await?;
        if guard.blackouts.iter().all(|b| b.id != id) {
            return Err(EngineError::NotFound(id));
        }
        let record = Record::BlackoutRemoved { court_id, id };
        self.persist_and_apply_court(&mut guard, &record).await?;
        Ok(court_id)
    }

    /// Book one slot. The check-then-insert runs entirely under the court's
    /// write lock, so two racing requests for the same window serialize and
    /// the loser sees the winner's row.
    pub async fn book(
        &self,
        id: Ulid,
        court_id: Ulid,
        user_id: Ulid,
        booked_by: String,
        start: Ms,
        end: Ms,
    ) -> Result<ReservationInfo, EngineError> {
        let span = validate_span(start, end)?;
        validate_booking_duration(&span, &self.policy)?;
        if booked_by.len() > MAX_LABEL_LEN {
            return Err(EngineError::LimitExceeded("booked_by too long"));
        }
        let court = self.court(&court_id).ok_or(EngineError::NotFound(court_id))?;
        let mut guard = court.write().await;
        // The court may have been deleted while we waited for the lock.
        if !self.courts.contains_key(&court_id) {
            return Err(EngineError::NotFound(court_id));
        }
        if guard.reservations.len() >= MAX_ROWS_PER_COURT {
            return Err(EngineError::LimitExceeded("too many reservations on court"));
        }
        if self.owner_of.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        if let Some(r) = duplicate_booking(&guard, &span, &user_id) {
            return Err(EngineError::AlreadyBooked(r.id));
        }
        if let Some(b) = blackout_conflict(&guard, &span) {
            metrics::counter!(crate::observability::ADMISSIONS_REJECTED, "kind" => "slot_conflict")
                .increment(1);
            return Err(EngineError::SlotUnavailable(b.id));
        }
        if let Some(r) = booked_conflict(&guard, &span, None) {
            metrics::counter!(crate::observability::ADMISSIONS_REJECTED, "kind" => "slot_conflict")
                .increment(1);
            return Err(EngineError::SlotUnavailable(r.id));
        }

        let reservation = Reservation {
            id,
            user_id,
            booked_by,
            span,
            status: ReservationStatus::Booked,
            created_at: now_ms(),
        };
        let record = Record::ReservationCreated { court_id, reservation: reservation.clone() };
        self.persist_and_apply_court(&mut guard, &record).await?;
        Ok(reservation_info(court_id, &reservation))
    }

    /// Cancel a reservation. Repeat cancels return the row unchanged.
    pub async fn cancel_slot(&self, id: Ulid) -> Result<ReservationInfo, EngineError> {
        let (court_id, mut guard) = self.resolve_court_row_write(&id).await?;
        let existing = guard
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if existing.status == ReservationStatus::Cancelled {
            return Ok(reservation_info(court_id, &existing));
        }

        let record = Record::ReservationCancelled { court_id, id, user_id: existing.user_id };
        self.persist_and_apply_court(&mut guard, &record).await?;
        let row = guard.reservation(&id).cloned().unwrap_or(existing);
        Ok(reservation_info(court_id, &row))
    }
}
