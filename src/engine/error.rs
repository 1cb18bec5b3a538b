use ulid::Ulid;

/// Closed set of admission and settlement failures. Wire handlers map these
/// onto SQLSTATEs; the Display text is the client-visible message and its
/// leading words are stable.
#[derive(Debug)]
pub enum EngineError {
    /// Malformed or out-of-policy time range.
    SlotInvalid(&'static str),
    /// The requested window collides with a booked reservation or a blackout.
    SlotUnavailable(Ulid),
    /// Same user already holds an identical booked span (duplicate retry).
    AlreadyBooked(Ulid),
    CapacityExceeded(u32),
    AlreadyRegistered { user_id: Ulid, event_id: Ulid },
    /// The targeted registration hold is no longer live.
    HoldExpired(Ulid),
    InsufficientFunds { requested: i64, balance: i64 },
    Gateway(String),
    /// A PENDING payment already exists for this registration.
    PaymentInFlight(Ulid),
    InvalidAmount(&'static str),
    EventClosed(Ulid),
    NotFound(Ulid),
    UnknownReference(String),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::SlotInvalid(msg) => write!(f, "slot invalid: {msg}"),
            EngineError::SlotUnavailable(id) => {
                write!(f, "slot unavailable: conflicts with {id}")
            }
            EngineError::AlreadyBooked(id) => {
                write!(f, "already booked: existing reservation {id}")
            }
            EngineError::CapacityExceeded(cap) => {
                write!(f, "capacity exceeded: all {cap} seats taken")
            }
            EngineError::AlreadyRegistered { user_id, event_id } => {
                write!(f, "already registered: user {user_id} on event {event_id}")
            }
            EngineError::HoldExpired(id) => {
                write!(f, "hold expired: registration {id} is no longer pending")
            }
            EngineError::InsufficientFunds { requested, balance } => {
                write!(f, "insufficient funds: requested {requested}, balance {balance}")
            }
            EngineError::Gateway(msg) => write!(f, "payment gateway error: {msg}"),
            EngineError::PaymentInFlight(id) => {
                write!(f, "payment in flight for registration {id}")
            }
            EngineError::InvalidAmount(msg) => write!(f, "invalid amount: {msg}"),
            EngineError::EventClosed(id) => write!(f, "event closed: {id}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::UnknownReference(r) => write!(f, "unknown external reference: {r}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
