//! Hard caps that keep a single tenant from exhausting memory or wedging the
//! WAL. Every mutation checks the relevant cap before touching state and
//! rejects with `LimitExceeded`.

use crate::model::Ms;

/// Earliest timestamp any span may reference.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;

/// Latest timestamp any span may reference (2100-01-01T00:00:00Z).
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Longest single span: one year. Catches swapped units (seconds vs millis).
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

/// Widest window a schedule query may scan: one quarter.
pub const MAX_QUERY_WINDOW_MS: Ms = 92 * 24 * 3_600_000;

pub const MAX_COURTS_PER_TENANT: usize = 10_000;

/// Reservations and blackouts each, per court.
pub const MAX_ROWS_PER_COURT: usize = 100_000;

pub const MAX_EVENTS_PER_TENANT: usize = 100_000;

pub const MAX_REGISTRATIONS_PER_EVENT: usize = 50_000;

pub const MAX_PAYMENTS_PER_TENANT: usize = 1_000_000;

pub const MAX_ENTRIES_PER_WALLET: usize = 1_000_000;

/// Court labels and the free-text `booked_by` column.
pub const MAX_LABEL_LEN: usize = 256;

/// Blackout reasons.
pub const MAX_REASON_LEN: usize = 512;

/// Payment references, ledger references, and gateway intent ids.
pub const MAX_REFERENCE_LEN: usize = 512;

/// ISO 4217 is 3 chars; leave headroom for private codes.
pub const MAX_CURRENCY_LEN: usize = 8;

/// Largest amount a single payment or ledger entry may move, in minor units.
pub const MAX_AMOUNT_MINOR: i64 = 1_000_000_000_000;

pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_TENANTS: usize = 64;
