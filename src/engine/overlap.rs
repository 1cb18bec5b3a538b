//! The one conflict predicate. Admission checks and the day view both go
//! through these functions so a slot shown as free is bookable and vice versa.

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{EngineError, Policy};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Check raw bounds and build the span. Rejects before `Span::new` so a
/// backwards range surfaces as a caller error, not a debug assertion.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::SlotInvalid("start must be before end"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

/// Booking durations additionally sit inside the administrator-configured
/// window; blackouts and events are exempt.
pub(crate) fn validate_booking_duration(span: &Span, policy: &Policy) -> Result<(), EngineError> {
    if span.duration_ms() < policy.min_booking_ms {
        return Err(EngineError::SlotInvalid("duration below minimum"));
    }
    if span.duration_ms() > policy.max_booking_ms {
        return Err(EngineError::SlotInvalid("duration above maximum"));
    }
    Ok(())
}

/// BOOKED reservations overlapping `span`, skipping `exclude` when given.
/// Cancelled rows never conflict. Admission, counting, and the day view all
/// filter through this one predicate.
pub(crate) fn conflicting_bookings<'a>(
    court: &'a CourtState,
    span: &Span,
    exclude: Option<Ulid>,
) -> impl Iterator<Item = &'a Reservation> {
    court
        .overlapping_reservations(span)
        .filter(move |r| r.status == ReservationStatus::Booked && Some(r.id) != exclude)
}

/// First conflicting BOOKED reservation. `exclude` lets a move pre-check
/// skip the row being moved.
pub(crate) fn booked_conflict<'a>(
    court: &'a CourtState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<&'a Reservation> {
    conflicting_bookings(court, span, exclude).next()
}

/// Number of conflicting BOOKED reservations, under the same exclusion rule.
pub(crate) fn count_conflicts(court: &CourtState, span: &Span, exclude: Option<Ulid>) -> usize {
    conflicting_bookings(court, span, exclude).count()
}

/// First blackout overlapping `span`.
pub(crate) fn blackout_conflict<'a>(court: &'a CourtState, span: &Span) -> Option<&'a Blackout> {
    court.overlapping_blackouts(span).next()
}

/// A BOOKED row by the same user over the exact same span: the signature of a
/// duplicate submit rather than a genuine collision.
pub(crate) fn duplicate_booking<'a>(
    court: &'a CourtState,
    span: &Span,
    user_id: &Ulid,
) -> Option<&'a Reservation> {
    conflicting_bookings(court, span, None).find(|r| r.user_id == *user_id && r.span == *span)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_court() -> CourtState {
        CourtState::new(Ulid::new(), CourtCategory::Tennis, "Centre".into(), None)
    }

    fn insert_row(court: &mut CourtState, span: Span, status: ReservationStatus) -> Ulid {
        let id = Ulid::new();
        court.insert_reservation(Reservation {
            id,
            user_id: Ulid::new(),
            booked_by: "desk".into(),
            span,
            status,
            created_at: 0,
        });
        id
    }

    #[test]
    fn count_ignores_cancelled_rows() {
        let mut court = empty_court();
        insert_row(&mut court, Span::new(1_000, 2_000), ReservationStatus::Booked);
        insert_row(&mut court, Span::new(1_500, 2_500), ReservationStatus::Cancelled);
        insert_row(&mut court, Span::new(3_000, 4_000), ReservationStatus::Booked);

        assert_eq!(count_conflicts(&court, &Span::new(1_200, 3_500), None), 2);
        // [2000, 3000) touches both booked rows without overlapping either
        assert_eq!(count_conflicts(&court, &Span::new(2_000, 3_000), None), 0);
    }

    #[test]
    fn excluded_row_does_not_conflict() {
        let mut court = empty_court();
        let id = insert_row(&mut court, Span::new(1_000, 2_000), ReservationStatus::Booked);
        let window = Span::new(1_500, 2_500);

        assert_eq!(count_conflicts(&court, &window, None), 1);
        assert_eq!(count_conflicts(&court, &window, Some(id)), 0);
        assert!(booked_conflict(&court, &window, Some(id)).is_none());
        assert!(booked_conflict(&court, &window, Some(Ulid::new())).is_some());
    }
}

