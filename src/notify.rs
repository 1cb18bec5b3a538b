use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Record;

const CHANNEL_CAPACITY: usize = 256;

/// One delivered notification: the channel it matched plus the record as a
/// JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub channel: String,
    pub payload: String,
}

pub fn court_channel(id: &Ulid) -> String {
    format!("court_{id}")
}

pub fn event_channel(id: &Ulid) -> String {
    format!("event_{id}")
}

pub fn user_channel(id: &Ulid) -> String {
    format!("user_{id}")
}

/// Broadcast hub for LISTEN/NOTIFY. Channels are named by subject: one per
/// court, per event, and per user. Slow subscribers lose old notices rather
/// than stalling publishers.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Notice>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a channel by name. Creates the channel if needed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Fan a record out to every channel its subjects name. No-op per channel
    /// if nobody is listening; publishing never fails.
    pub fn publish(&self, record: &Record) {
        let payload = match serde_json::to_string(record) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("notification payload dropped: {e}");
                return;
            }
        };
        for channel in channels_for(record) {
            if let Some(sender) = self.channels.get(&channel) {
                let _ = sender.send(Notice { channel: channel.clone(), payload: payload.clone() });
            }
        }
    }

    /// Remove a channel (e.g. when its subject is deleted).
    pub fn remove(&self, channel: &str) {
        self.channels.remove(channel);
    }
}

/// Channel names a record is published to. Row-level records reach both the
/// containing subject and the affected user.
fn channels_for(record: &Record) -> Vec<String> {
    match record {
        Record::CourtCreated { id, .. }
        | Record::CourtUpdated { id, .. }
        | Record::CourtDeleted { id } => vec![court_channel(id)],
        Record::BlackoutAdded { court_id, .. } | Record::BlackoutRemoved { court_id, .. } => {
            vec![court_channel(court_id)]
        }
        Record::ReservationCreated { court_id, reservation } => {
            vec![court_channel(court_id), user_channel(&reservation.user_id)]
        }
        Record::ReservationCancelled { court_id, user_id, .. } => {
            vec![court_channel(court_id), user_channel(user_id)]
        }
        Record::EventCreated { id, .. }
        | Record::EventUpdated { id, .. }
        | Record::EventDeleted { id } => vec![event_channel(id)],
        Record::RegistrationCreated { event_id, registration } => {
            vec![event_channel(event_id), user_channel(&registration.user_id)]
        }
        Record::RegistrationCancelled { event_id, user_id, .. } => {
            vec![event_channel(event_id), user_channel(user_id)]
        }
        Record::PaymentCreated { payment } => {
            let mut out = vec![user_channel(&payment.user_id)];
            if let Some(event_id) = &payment.event_id {
                out.push(event_channel(event_id));
            }
            out
        }
        Record::PaymentSettled { user_id, event_id, .. } => {
            let mut out = vec![user_channel(user_id)];
            if let Some(event_id) = event_id {
                out.push(event_channel(event_id));
            }
            out
        }
        Record::LedgerAppended { entry } => vec![user_channel(&entry.user_id)],
    }
}
