//! Core data model: courts, events, wallets, payments, and the records that
//! mutate them.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Milliseconds since the Unix epoch.
pub type Ms = i64;

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "span must have positive duration");
        Span { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Two half-open intervals overlap iff each starts before the other ends.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CourtCategory {
    Tennis,
    Basketball,
    Football,
    Volleyball,
    Squash,
    Padel,
}

impl CourtCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            CourtCategory::Tennis => "tennis",
            CourtCategory::Basketball => "basketball",
            CourtCategory::Football => "football",
            CourtCategory::Volleyball => "volleyball",
            CourtCategory::Squash => "squash",
            CourtCategory::Padel => "padel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tennis" => Some(CourtCategory::Tennis),
            "basketball" => Some(CourtCategory::Basketball),
            "football" => Some(CourtCategory::Football),
            "volleyball" => Some(CourtCategory::Volleyball),
            "squash" => Some(CourtCategory::Squash),
            "padel" => Some(CourtCategory::Padel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Booked,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Booked => "booked",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

/// A slot reservation on a court. Cancelled rows are kept for audit; only
/// BOOKED rows participate in conflict checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub user_id: Ulid,
    pub booked_by: String,
    pub span: Span,
    pub status: ReservationStatus,
    pub created_at: Ms,
}

/// An administrative closure window. Blackouts block new bookings but never
/// touch reservations that already exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blackout {
    pub id: Ulid,
    pub span: Span,
    pub reason: String,
}

/// Full in-memory state of one court: reservations and blackouts, each kept
/// sorted by span start so window scans can binary search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourtState {
    pub id: Ulid,
    pub category: CourtCategory,
    pub label: String,
    pub location: Option<String>,
    pub reservations: Vec<Reservation>,
    pub blackouts: Vec<Blackout>,
}

impl CourtState {
    pub fn new(id: Ulid, category: CourtCategory, label: String, location: Option<String>) -> Self {
        CourtState {
            id,
            category,
            label,
            location,
            reservations: Vec::new(),
            blackouts: Vec::new(),
        }
    }

    /// Insert preserving span-start order.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let idx = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(idx, reservation);
    }

    pub fn insert_blackout(&mut self, blackout: Blackout) {
        let idx = self
            .blackouts
            .binary_search_by_key(&blackout.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.blackouts.insert(idx, blackout);
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    pub fn remove_blackout(&mut self, id: &Ulid) -> Option<Blackout> {
        let idx = self.blackouts.iter().position(|b| b.id == *id)?;
        Some(self.blackouts.remove(idx))
    }

    /// All reservations whose span overlaps `query`, regardless of status.
    ///
    /// Rows are sorted by start, so everything at or past `query.end` is
    /// skipped via binary search; the remainder is filtered on the end bound.
    pub fn overlapping_reservations<'a>(
        &'a self,
        query: &Span,
    ) -> impl Iterator<Item = &'a Reservation> {
        let end_idx = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        let query_start = query.start;
        self.reservations[..end_idx]
            .iter()
            .filter(move |r| r.span.end > query_start)
    }

    pub fn overlapping_blackouts<'a>(&'a self, query: &Span) -> impl Iterator<Item = &'a Blackout> {
        let end_idx = self.blackouts.partition_point(|b| b.span.start < query.end);
        let query_start = query.start;
        self.blackouts[..end_idx]
            .iter()
            .filter(move |b| b.span.end > query_start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Open,
    Closed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Open => "open",
            EventStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(EventStatus::Open),
            "closed" => Some(EventStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStatus::Pending => "pending",
            RegistrationStatus::Confirmed => "confirmed",
            RegistrationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    Requested,
    HoldExpired,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::Requested => "requested",
            CancelReason::HoldExpired => "hold_expired",
        }
    }
}

/// A seat claim against an event. PENDING rows hold a seat only until
/// `hold_expires_at`; past that instant they are dead weight everywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub id: Ulid,
    pub user_id: Ulid,
    pub status: RegistrationStatus,
    pub hold_expires_at: Option<Ms>,
    pub cancel_reason: Option<CancelReason>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Registration {
    /// Whether this row consumes a seat at instant `now`.
    pub fn holds_seat(&self, now: Ms) -> bool {
        match self.status {
            RegistrationStatus::Confirmed => true,
            RegistrationStatus::Pending => !self.hold_lapsed(now),
            RegistrationStatus::Cancelled => false,
        }
    }

    /// A PENDING row whose hold deadline has passed.
    pub fn hold_lapsed(&self, now: Ms) -> bool {
        self.status == RegistrationStatus::Pending
            && self.hold_expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Catalog mirror of one event plus the registrations admitted against it.
/// The catalog collaborator owns the event fields; this engine owns the rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventState {
    pub id: Ulid,
    pub capacity: Option<u32>,
    pub price_minor: i64,
    pub currency: String,
    pub span: Span,
    pub status: EventStatus,
    pub registrations: Vec<Registration>,
}

impl EventState {
    pub fn new(
        id: Ulid,
        capacity: Option<u32>,
        price_minor: i64,
        currency: String,
        span: Span,
        status: EventStatus,
    ) -> Self {
        EventState {
            id,
            capacity,
            price_minor,
            currency,
            span,
            status,
            registrations: Vec::new(),
        }
    }

    pub fn registration(&self, id: &Ulid) -> Option<&Registration> {
        self.registrations.iter().find(|r| r.id == *id)
    }

    pub fn registration_mut(&mut self, id: &Ulid) -> Option<&mut Registration> {
        self.registrations.iter_mut().find(|r| r.id == *id)
    }

    /// Seats consumed at instant `now`: CONFIRMED rows plus live PENDING holds.
    pub fn seats_taken(&self, now: Ms) -> usize {
        self.registrations.iter().filter(|r| r.holds_seat(now)).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    Wallet,
    Card,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Wallet => "wallet",
            PaymentMethod::Card => "card",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "wallet" => Some(PaymentMethod::Wallet),
            "card" => Some(PaymentMethod::Card),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentPurpose {
    EventPayment,
    VendorFee,
}

impl PaymentPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentPurpose::EventPayment => "event_payment",
            PaymentPurpose::VendorFee => "vendor_fee",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "event_payment" => Some(PaymentPurpose::EventPayment),
            "vendor_fee" => Some(PaymentPurpose::VendorFee),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

/// Terminal verdict reported by a settlement path or a gateway callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentOutcome {
    Succeeded,
    Failed,
}

impl PaymentOutcome {
    pub fn as_status(&self) -> PaymentStatus {
        match self {
            PaymentOutcome::Succeeded => PaymentStatus::Succeeded,
            PaymentOutcome::Failed => PaymentStatus::Failed,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "succeeded" => Some(PaymentOutcome::Succeeded),
            "failed" => Some(PaymentOutcome::Failed),
            _ => None,
        }
    }
}

/// One payment attempt. Moves out of PENDING exactly once and never mutates
/// after reaching a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Ulid,
    pub user_id: Ulid,
    pub purpose: PaymentPurpose,
    pub event_id: Option<Ulid>,
    pub registration_id: Option<Ulid>,
    pub reference: Option<String>,
    pub method: PaymentMethod,
    pub amount_minor: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub external_ref: Option<String>,
    pub created_at: Ms,
    pub settled_at: Option<Ms>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerKind {
    CreditRefund,
    CreditAdjustment,
    DebitEventPayment,
    DebitVendorFee,
}

impl LedgerKind {
    pub fn is_credit(&self) -> bool {
        matches!(self, LedgerKind::CreditRefund | LedgerKind::CreditAdjustment)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::CreditRefund => "credit_refund",
            LedgerKind::CreditAdjustment => "credit_adjustment",
            LedgerKind::DebitEventPayment => "debit_event_payment",
            LedgerKind::DebitVendorFee => "debit_vendor_fee",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credit_refund" => Some(LedgerKind::CreditRefund),
            "credit_adjustment" => Some(LedgerKind::CreditAdjustment),
            "debit_event_payment" => Some(LedgerKind::DebitEventPayment),
            "debit_vendor_fee" => Some(LedgerKind::DebitVendorFee),
            _ => None,
        }
    }
}

/// One immutable wallet ledger line. `amount_minor` is stored positive; the
/// kind decides the sign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletEntry {
    pub id: Ulid,
    pub user_id: Ulid,
    pub kind: LedgerKind,
    pub amount_minor: i64,
    pub currency: String,
    pub reference: String,
    pub created_at: Ms,
}

impl WalletEntry {
    pub fn signed_amount(&self) -> i64 {
        if self.kind.is_credit() {
            self.amount_minor
        } else {
            -self.amount_minor
        }
    }
}

/// Append-only ledger for one user, one entry vector across all currencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletState {
    pub user_id: Ulid,
    pub entries: Vec<WalletEntry>,
}

impl WalletState {
    pub fn new(user_id: Ulid) -> Self {
        WalletState { user_id, entries: Vec::new() }
    }

    pub fn balance(&self, currency: &str) -> i64 {
        self.entries
            .iter()
            .filter(|e| e.currency == currency)
            .map(WalletEntry::signed_amount)
            .sum()
    }

    /// Balance per currency, in order of first appearance in the ledger.
    pub fn balances(&self) -> Vec<(String, i64)> {
        let mut totals: Vec<(String, i64)> = Vec::new();
        for entry in &self.entries {
            match totals.iter_mut().find(|(c, _)| *c == entry.currency) {
                Some((_, total)) => *total += entry.signed_amount(),
                None => totals.push((entry.currency.clone(), entry.signed_amount())),
            }
        }
        totals
    }
}

/// Durable record appended to the WAL. Replaying the full sequence rebuilds
/// engine state exactly. Records that couple several effects (a cancellation
/// with its refund, a settlement with its debit) carry all of them in one
/// record so a replay can never observe half of the pair.
///
/// Row-creating records embed the full row, which also lets compaction emit
/// current state directly. Transition records stay flat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    CourtCreated {
        id: Ulid,
        category: CourtCategory,
        label: String,
        location: Option<String>,
    },
    CourtUpdated {
        id: Ulid,
        label: String,
        location: Option<String>,
    },
    CourtDeleted {
        id: Ulid,
    },
    BlackoutAdded {
        court_id: Ulid,
        blackout: Blackout,
    },
    BlackoutRemoved {
        court_id: Ulid,
        id: Ulid,
    },
    ReservationCreated {
        court_id: Ulid,
        reservation: Reservation,
    },
    ReservationCancelled {
        court_id: Ulid,
        id: Ulid,
        user_id: Ulid,
    },
    EventCreated {
        id: Ulid,
        capacity: Option<u32>,
        price_minor: i64,
        currency: String,
        span: Span,
        status: EventStatus,
    },
    EventUpdated {
        id: Ulid,
        capacity: Option<u32>,
        price_minor: i64,
        currency: String,
        span: Span,
        status: EventStatus,
    },
    EventDeleted {
        id: Ulid,
    },
    RegistrationCreated {
        event_id: Ulid,
        registration: Registration,
    },
    RegistrationCancelled {
        event_id: Ulid,
        id: Ulid,
        user_id: Ulid,
        reason: CancelReason,
        refund: Option<WalletEntry>,
        at: Ms,
    },
    PaymentCreated {
        payment: Payment,
    },
    PaymentSettled {
        id: Ulid,
        user_id: Ulid,
        event_id: Option<Ulid>,
        registration_id: Option<Ulid>,
        outcome: PaymentOutcome,
        debit: Option<WalletEntry>,
        registration_confirmed: bool,
        compensation: Option<WalletEntry>,
        at: Ms,
    },
    LedgerAppended {
        entry: WalletEntry,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CourtInfo {
    pub id: Ulid,
    pub category: CourtCategory,
    pub label: String,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReservationInfo {
    pub id: Ulid,
    pub court_id: Ulid,
    pub user_id: Ulid,
    pub booked_by: String,
    pub span: Span,
    pub status: ReservationStatus,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlackoutInfo {
    pub id: Ulid,
    pub court_id: Ulid,
    pub span: Span,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventInfo {
    pub id: Ulid,
    pub capacity: Option<u32>,
    pub price_minor: i64,
    pub currency: String,
    pub span: Span,
    pub status: EventStatus,
}

/// Registration row as reported to callers. `payment_status` is projected
/// from the most recent linked payment, `None` when no payment exists.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationInfo {
    pub id: Ulid,
    pub event_id: Ulid,
    pub user_id: Ulid,
    pub status: RegistrationStatus,
    pub payment_status: Option<PaymentStatus>,
    pub hold_expires_at: Option<Ms>,
    pub cancel_reason: Option<CancelReason>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// One occupied stretch in a court's day view.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleItem {
    pub court_id: Ulid,
    pub kind: ScheduleKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleKind {
    Booked {
        reservation_id: Ulid,
        user_id: Ulid,
        booked_by: String,
    },
    Blackout {
        blackout_id: Ulid,
        reason: String,
    },
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Booked { .. } => "booked",
            ScheduleKind::Blackout { .. } => "blackout",
        }
    }

    pub fn item_id(&self) -> Ulid {
        match self {
            ScheduleKind::Booked { reservation_id, .. } => *reservation_id,
            ScheduleKind::Blackout { blackout_id, .. } => *blackout_id,
        }
    }

    /// Free-text column for the day view: who booked, or why closed.
    pub fn detail(&self) -> &str {
        match self {
            ScheduleKind::Booked { booked_by, .. } => booked_by,
            ScheduleKind::Blackout { reason, .. } => reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceInfo {
    pub user_id: Ulid,
    pub currency: String,
    pub balance: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    fn reservation(start: Ms, end: Ms) -> Reservation {
        Reservation {
            id: Ulid::new(),
            user_id: Ulid::new(),
            booked_by: "desk".into(),
            span: Span::new(start, end),
            status: ReservationStatus::Booked,
            created_at: 0,
        }
    }

    fn entry(kind: LedgerKind, amount: i64, currency: &str) -> WalletEntry {
        WalletEntry {
            id: Ulid::new(),
            user_id: Ulid::new(),
            kind,
            amount_minor: amount,
            currency: currency.into(),
            reference: "t".into(),
            created_at: 0,
        }
    }

    #[test]
    fn spans_overlap_when_each_starts_before_the_other_ends() {
        let a = Span::new(0, 10);
        let b = Span::new(5, 15);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }

    #[test]
    fn touching_spans_do_not_overlap() {
        let morning = Span::new(10 * H, 11 * H);
        let midday = Span::new(11 * H, 12 * H);
        assert!(!morning.overlaps(&midday));
        assert!(!midday.overlaps(&morning));
    }

    #[test]
    fn contained_span_overlaps() {
        let outer = Span::new(0, 100);
        let inner = Span::new(40, 60);
        assert!(outer.overlaps(&inner));
        assert!(inner.overlaps(&outer));
    }

    #[test]
    fn insert_reservation_keeps_start_order() {
        let mut court = CourtState::new(Ulid::new(), CourtCategory::Tennis, "c1".into(), None);
        court.insert_reservation(reservation(5 * H, 6 * H));
        court.insert_reservation(reservation(H, 2 * H));
        court.insert_reservation(reservation(3 * H, 4 * H));
        let starts: Vec<Ms> = court.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![H, 3 * H, 5 * H]);
    }

    #[test]
    fn overlapping_reservations_scans_only_the_window() {
        let mut court = CourtState::new(Ulid::new(), CourtCategory::Padel, "c1".into(), None);
        for i in 0..10 {
            court.insert_reservation(reservation(i * 2 * H, (i * 2 + 1) * H));
        }
        let hits: Vec<Ms> = court
            .overlapping_reservations(&Span::new(4 * H, 9 * H))
            .map(|r| r.span.start)
            .collect();
        assert_eq!(hits, vec![4 * H, 6 * H, 8 * H]);
    }

    #[test]
    fn overlapping_blackouts_honors_half_open_bounds() {
        let mut court = CourtState::new(Ulid::new(), CourtCategory::Squash, "c1".into(), None);
        court.insert_blackout(Blackout {
            id: Ulid::new(),
            span: Span::new(2 * H, 4 * H),
            reason: "resurfacing".into(),
        });
        assert_eq!(court.overlapping_blackouts(&Span::new(0, 2 * H)).count(), 0);
        assert_eq!(court.overlapping_blackouts(&Span::new(4 * H, 5 * H)).count(), 0);
        assert_eq!(court.overlapping_blackouts(&Span::new(3 * H, 5 * H)).count(), 1);
    }

    #[test]
    fn confirmed_registration_holds_seat_forever() {
        let reg = Registration {
            id: Ulid::new(),
            user_id: Ulid::new(),
            status: RegistrationStatus::Confirmed,
            hold_expires_at: Some(100),
            cancel_reason: None,
            created_at: 0,
            updated_at: 0,
        };
        assert!(reg.holds_seat(1_000_000));
        assert!(!reg.hold_lapsed(1_000_000));
    }

    #[test]
    fn pending_registration_releases_seat_at_deadline() {
        let reg = Registration {
            id: Ulid::new(),
            user_id: Ulid::new(),
            status: RegistrationStatus::Pending,
            hold_expires_at: Some(100),
            cancel_reason: None,
            created_at: 0,
            updated_at: 0,
        };
        assert!(reg.holds_seat(99));
        assert!(!reg.holds_seat(100));
        assert!(reg.hold_lapsed(100));
    }

    #[test]
    fn cancelled_registration_never_holds_seat() {
        let reg = Registration {
            id: Ulid::new(),
            user_id: Ulid::new(),
            status: RegistrationStatus::Cancelled,
            hold_expires_at: None,
            cancel_reason: Some(CancelReason::Requested),
            created_at: 0,
            updated_at: 0,
        };
        assert!(!reg.holds_seat(0));
    }

    #[test]
    fn seats_taken_counts_confirmed_and_live_holds() {
        let mut event = EventState::new(
            Ulid::new(),
            Some(10),
            1000,
            "EUR".into(),
            Span::new(0, H),
            EventStatus::Open,
        );
        event.registrations.push(Registration {
            id: Ulid::new(),
            user_id: Ulid::new(),
            status: RegistrationStatus::Confirmed,
            hold_expires_at: None,
            cancel_reason: None,
            created_at: 0,
            updated_at: 0,
        });
        event.registrations.push(Registration {
            id: Ulid::new(),
            user_id: Ulid::new(),
            status: RegistrationStatus::Pending,
            hold_expires_at: Some(50),
            cancel_reason: None,
            created_at: 0,
            updated_at: 0,
        });
        assert_eq!(event.seats_taken(0), 2);
        assert_eq!(event.seats_taken(50), 1);
    }

    #[test]
    fn balance_nets_credits_against_debits() {
        let mut wallet = WalletState::new(Ulid::new());
        wallet.entries.push(entry(LedgerKind::CreditAdjustment, 5000, "EUR"));
        wallet.entries.push(entry(LedgerKind::DebitEventPayment, 1500, "EUR"));
        wallet.entries.push(entry(LedgerKind::CreditRefund, 1500, "EUR"));
        assert_eq!(wallet.balance("EUR"), 5000);
        assert_eq!(wallet.balance("USD"), 0);
    }

    #[test]
    fn balances_are_tracked_per_currency() {
        let mut wallet = WalletState::new(Ulid::new());
        wallet.entries.push(entry(LedgerKind::CreditAdjustment, 100, "EUR"));
        wallet.entries.push(entry(LedgerKind::CreditAdjustment, 200, "USD"));
        wallet.entries.push(entry(LedgerKind::DebitVendorFee, 40, "EUR"));
        assert_eq!(wallet.balances(), vec![("EUR".into(), 60), ("USD".into(), 200)]);
    }

    #[test]
    fn signed_amount_follows_kind() {
        assert_eq!(entry(LedgerKind::CreditRefund, 100, "EUR").signed_amount(), 100);
        assert_eq!(entry(LedgerKind::DebitVendorFee, 100, "EUR").signed_amount(), -100);
    }

    #[test]
    fn category_parse_matches_as_str() {
        for cat in [
            CourtCategory::Tennis,
            CourtCategory::Basketball,
            CourtCategory::Football,
            CourtCategory::Volleyball,
            CourtCategory::Squash,
            CourtCategory::Padel,
        ] {
            assert_eq!(CourtCategory::parse(cat.as_str()), Some(cat));
        }
        assert_eq!(CourtCategory::parse("chess"), None);
    }

    #[test]
    fn ledger_kind_parse_matches_as_str() {
        for kind in [
            LedgerKind::CreditRefund,
            LedgerKind::CreditAdjustment,
            LedgerKind::DebitEventPayment,
            LedgerKind::DebitVendorFee,
        ] {
            assert_eq!(LedgerKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(LedgerKind::parse("credit"), None);
    }

    #[test]
    fn record_serializes_round_trip() {
        let record = Record::RegistrationCancelled {
            event_id: Ulid::new(),
            id: Ulid::new(),
            user_id: Ulid::new(),
            reason: CancelReason::HoldExpired,
            refund: Some(entry(LedgerKind::CreditRefund, 900, "EUR")),
            at: 42,
        };
        let bytes = bincode::serialize(&record).unwrap();
        let back: Record = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, record);
    }
}
