use dashmap::DashMap;
use serde_json::json;
use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// LISTEN channel an event is published on, if any.
pub fn channel_for(event: &Event) -> Option<&'static str> {
    match event {
        Event::ReservationCreated(_)
        | Event::ReservationUpdated(_)
        | Event::ReservationDeleted { .. } => Some("reservations"),
        Event::ClosureSet(_) | Event::ClosureRemoved { .. } => Some("closures"),
        Event::ClientSeen { .. } | Event::ClientSaved(_) | Event::ClientRemoved { .. } => {
            Some("clients")
        }
        Event::ConfirmationSent { .. }
        | Event::SubscriptionAdded(_)
        | Event::SubscriptionRemoved { .. }
        | Event::EmailLogged(_)
        | Event::CheckoutCreated(_) => None,
    }
}

/// JSON body of a NOTIFY message.
pub fn payload(event: &Event) -> String {
    let value = match event {
        Event::ReservationCreated(r) | Event::ReservationUpdated(r) => json!({
            "event": event.kind(),
            "id": r.id.to_string(),
            "status": r.status.as_str(),
            "date": r.date.to_string(),
            "time": r.time.format("%H:%M").to_string(),
            "party_size": r.party_size,
            "name": r.name,
        }),
        Event::ReservationDeleted { id } => json!({ "event": event.kind(), "id": id.to_string() }),
        Event::ClosureSet(c) => json!({
            "event": event.kind(),
            "date": c.date.to_string(),
            "kind": c.kind.as_str(),
        }),
        Event::ClosureRemoved { date } => json!({ "event": event.kind(), "date": date.to_string() }),
        Event::ClientSeen { sighting, .. } => json!({ "event": event.kind(), "email": sighting.email }),
        Event::ClientSaved(c) => json!({ "event": event.kind(), "email": c.email }),
        Event::ClientRemoved { email } => json!({ "event": event.kind(), "email": email }),
        other => json!({ "event": other.kind() }),
    };
    value.to_string()
}

/// Broadcast hub for LISTEN/NOTIFY, one sender per channel name.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a channel, creating it on first use.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Event> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish on the event's channel. No-op if nobody is listening.
    pub fn send(&self, event: &Event) {
        let Some(channel) = channel_for(event) else {
            return;
        };
        if let Some(sender) = self.channels.get(channel) {
            let _ = sender.send(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use ulid::Ulid;

    use super::*;
    use crate::model::*;

    fn closure_set() -> Event {
        Event::ClosureSet(Closure {
            date: NaiveDate::from_ymd_opt(2026, 12, 25).unwrap(),
            kind: ClosureKind::Closed,
            note: None,
        })
    }

    #[tokio::test]
    async fn subscriber_receives_events_of_its_channel() {
        let hub = NotifyHub::new();
        let mut closures = hub.subscribe("closures");
        let mut reservations = hub.subscribe("reservations");

        hub.send(&closure_set());
        assert_eq!(closures.recv().await.unwrap(), closure_set());
        assert!(reservations.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&Event::ReservationDeleted { id: Ulid::new() });
    }

    #[test]
    fn bookkeeping_events_are_not_published() {
        assert_eq!(channel_for(&Event::ConfirmationSent { id: Ulid::new(), at: 0 }), None);
        assert_eq!(channel_for(&closure_set()), Some("closures"));
    }

    #[test]
    fn payload_is_json_with_event_kind() {
        let parsed: serde_json::Value = serde_json::from_str(&payload(&closure_set())).unwrap();
        assert_eq!(parsed["event"], "closure_set");
        assert_eq!(parsed["date"], "2026-12-25");
        assert_eq!(parsed["kind"], "closed");
    }
}
