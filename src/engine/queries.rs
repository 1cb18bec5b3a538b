use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::overlap::validate_span;
use super::{Engine, EngineError, SharedCourt, SharedEvent, SharedPayment};

impl Engine {
    /// Day view for one court: booked slots and blackout windows overlapping
    /// the query window, ordered by start.
    pub async fn schedule(
        &self,
        court_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<ScheduleItem>, EngineError> {
        let window = validate_span(from, to)?;
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let court = self.court(&court_id).ok_or(EngineError::NotFound(court_id))?;
        let guard = court.read().await;

        let mut items: Vec<ScheduleItem> = super::overlap::conflicting_bookings(&guard, &window, None)
            .map(|r| ScheduleItem {
                court_id,
                kind: ScheduleKind::Booked {
                    reservation_id: r.id,
                    user_id: r.user_id,
                    booked_by: r.booked_by.clone(),
                },
                span: r.span,
            })
            .collect();
        items.extend(guard.overlapping_blackouts(&window).map(|b| ScheduleItem {
            court_id,
            kind: ScheduleKind::Blackout { blackout_id: b.id, reason: b.reason.clone() },
            span: b.span,
        }));
        items.sort_by_key(|item| (item.span.start, item.kind.item_id()));
        Ok(items)
    }

    pub async fn list_courts(&self) -> Vec<CourtInfo> {
        let arcs: Vec<SharedCourt> = self.courts.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for arc in arcs {
            let guard = arc.read().await;
            out.push(CourtInfo {
                id: guard.id,
                category: guard.category,
                label: guard.label.clone(),
                location: guard.location.clone(),
            });
        }
        out.sort_by_key(|c| c.id);
        out
    }

    pub async fn list_reservations(
        &self,
        court_id: Ulid,
    ) -> Result<Vec<ReservationInfo>, EngineError> {
        let court = self.court(&court_id).ok_or(EngineError::NotFound(court_id))?;
        let guard = court.read().await;
        Ok(guard
            .reservations
            .iter()
            .map(|r| ReservationInfo {
                id: r.id,
                court_id,
                user_id: r.user_id,
                booked_by: r.booked_by.clone(),
                span: r.span,
                status: r.status,
                created_at: r.created_at,
            })
            .collect())
    }

    pub async fn list_events(&self) -> Vec<EventInfo> {
        let arcs: Vec<SharedEvent> = self.events.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for arc in arcs {
            let guard = arc.read().await;
            out.push(EventInfo {
                id: guard.id,
                capacity: guard.capacity,
                price_minor: guard.price_minor,
                currency: guard.currency.clone(),
                span: guard.span,
                status: guard.status,
            });
        }
        out.sort_by_key(|e| e.id);
        out
    }

    pub async fn list_registrations(
        &self,
        event_id: Ulid,
    ) -> Result<Vec<RegistrationInfo>, EngineError> {
        let event = self.event(&event_id).ok_or(EngineError::NotFound(event_id))?;
        let guard = event.read().await;
        let mut out = Vec::with_capacity(guard.registrations.len());
        for r in &guard.registrations {
            out.push(self.registration_info(event_id, r).await);
        }
        Ok(out)
    }

    pub async fn list_payments(&self, user_id: Option<Ulid>) -> Vec<Payment> {
        let arcs: Vec<SharedPayment> = self.payments.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for arc in arcs {
            let guard = arc.read().await;
            if user_id.is_none_or(|u| guard.user_id == u) {
                out.push(guard.clone());
            }
        }
        out.sort_by_key(|p| (p.created_at, p.id));
        out
    }

    /// Registration row with its payment status projected from the most
    /// recent linked payment. There is no stored status field to drift.
    pub(super) async fn registration_info(
        &self,
        event_id: Ulid,
        r: &Registration,
    ) -> RegistrationInfo {
        let payment_status = self.linked_payment(&r.id).await.map(|p| p.status);
        RegistrationInfo {
            id: r.id,
            event_id,
            user_id: r.user_id,
            status: r.status,
            payment_status,
            hold_expires_at: r.hold_expires_at,
            cancel_reason: r.cancel_reason,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}
