use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for every audit timestamp.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Lifecycle of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Pending,
    Confirmed,
    Declined,
    Cancelled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Confirmed => "confirmed",
            Status::Declined => "declined",
            Status::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(Status::Pending),
            "confirmed" => Ok(Status::Confirmed),
            "declined" => Ok(Status::Declined),
            "cancelled" | "canceled" => Ok(Status::Cancelled),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Why a submission was routed to manual review instead of auto-confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewReason {
    RequestOnlyDate,
    RequestOnlySlot,
    LargeParty,
}

impl ReviewReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewReason::RequestOnlyDate => "request_only_date",
            ReviewReason::RequestOnlySlot => "request_only_slot",
            ReviewReason::LargeParty => "large_party",
        }
    }
}

/// Who entered the reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// Guest-facing booking form, subject to the acceptance policy.
    Web,
    /// Entered by staff from the dashboard (phone, walk-in).
    Staff,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Web => "web",
            Origin::Staff => "staff",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub party_size: u32,
    pub notes: Option<String>,
    pub status: Status,
    pub review: Option<ReviewReason>,
    pub origin: Origin,
    pub confirmation_sent_at: Option<Ms>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// Guest input for a new reservation, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Submission {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub date: String,
    pub time: String,
    pub party_size: i64,
    pub notes: Option<String>,
}

/// Admin edit of an existing reservation. `None` leaves a field untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReservationPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<Option<String>>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub party_size: Option<i64>,
    pub notes: Option<Option<String>>,
    pub status: Option<Status>,
}

impl ReservationPatch {
    pub fn touches_fields(&self) -> bool {
        self.name.is_some()
            || self.email.is_some()
            || self.phone.is_some()
            || self.date.is_some()
            || self.time.is_some()
            || self.party_size.is_some()
            || self.notes.is_some()
    }
}

/// Per-date override of the weekly schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClosureKind {
    /// No bookings at all.
    Closed,
    /// Only the lunch service takes bookings.
    LunchOnly,
    /// Every booking needs manual approval.
    RequestOnly,
    /// Opens a date that falls on a weekly closing day.
    Open,
}

impl ClosureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClosureKind::Closed => "closed",
            ClosureKind::LunchOnly => "lunch_only",
            ClosureKind::RequestOnly => "request_only",
            ClosureKind::Open => "open",
        }
    }
}

impl FromStr for ClosureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "closed" | "blocked" => Ok(ClosureKind::Closed),
            "lunch_only" | "lunch" => Ok(ClosureKind::LunchOnly),
            "request_only" | "request" => Ok(ClosureKind::RequestOnly),
            "open" => Ok(ClosureKind::Open),
            other => Err(format!("unknown closure kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Closure {
    pub date: NaiveDate,
    pub kind: ClosureKind,
    pub note: Option<String>,
}

/// Where a client record first came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientSource {
    Booking,
    Csv,
    EmailHistory,
    Manual,
}

impl ClientSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientSource::Booking => "booking",
            ClientSource::Csv => "csv",
            ClientSource::EmailHistory => "email_history",
            ClientSource::Manual => "manual",
        }
    }
}

/// Deduplicated contact, keyed by normalized email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub email: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub source: ClientSource,
    pub bookings: u32,
    pub last_visit: Option<NaiveDate>,
    pub first_seen: Ms,
    pub updated_at: Ms,
}

impl Client {
    /// Fold a sighting into the record. Existing name/phone win over new ones;
    /// the visit date only moves forward.
    pub fn absorb(&mut self, seen: &ClientSighting, at: Ms) {
        if self.name.is_none() {
            self.name = seen.name.clone();
        }
        if self.phone.is_none() {
            self.phone = seen.phone.clone();
        }
        if let Some(visit) = seen.visit {
            self.bookings += 1;
            self.last_visit = Some(self.last_visit.map_or(visit, |d| d.max(visit)));
        }
        self.updated_at = at;
    }
}

/// One observation of a contact, from any source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSighting {
    pub email: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub source: ClientSource,
    /// Set when the sighting is a booking for that date.
    pub visit: Option<NaiveDate>,
}

impl ClientSighting {
    pub fn into_client(self, at: Ms) -> Client {
        Client {
            bookings: u32::from(self.visit.is_some()),
            last_visit: self.visit,
            email: self.email,
            name: self.name,
            phone: self.phone,
            source: self.source,
            first_seen: at,
            updated_at: at,
        }
    }
}

/// Browser push subscription of an admin device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub created_at: Ms,
}

/// Transactional email templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Template {
    Confirmation,
    RequestReceived,
    Declined,
    Cancelled,
    StaffNewBooking,
    StaffApprovalNeeded,
}

impl Template {
    pub fn as_str(&self) -> &'static str {
        match self {
            Template::Confirmation => "confirmation",
            Template::RequestReceived => "request_received",
            Template::Declined => "declined",
            Template::Cancelled => "cancelled",
            Template::StaffNewBooking => "staff_new_booking",
            Template::StaffApprovalNeeded => "staff_approval_needed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmailOutcome {
    Sent { provider_id: String },
    Failed { error: String },
}

impl EmailOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, EmailOutcome::Sent { .. })
    }
}

/// Bookkeeping of one email attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRecord {
    pub id: Ulid,
    pub reservation_id: Option<Ulid>,
    pub template: Template,
    pub recipient: String,
    pub outcome: EmailOutcome,
    pub at: Ms,
}

/// Hosted payment checkout session (gift vouchers, event tickets).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkout {
    pub id: Ulid,
    pub email: String,
    pub description: String,
    pub amount_cents: i64,
    pub quantity: u32,
    pub currency: String,
    pub session_id: String,
    pub url: String,
    pub created_at: Ms,
}

/// Flat event enum; this is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated(Reservation),
    /// Full post-image of the reservation after an edit or status change.
    ReservationUpdated(Reservation),
    ReservationDeleted {
        id: Ulid,
    },
    ConfirmationSent {
        id: Ulid,
        at: Ms,
    },
    ClosureSet(Closure),
    ClosureRemoved {
        date: NaiveDate,
    },
    ClientSeen {
        sighting: ClientSighting,
        at: Ms,
    },
    /// Full client record, written by manual edits and compaction.
    ClientSaved(Client),
    ClientRemoved {
        email: String,
    },
    SubscriptionAdded(PushSubscription),
    SubscriptionRemoved {
        endpoint: String,
    },
    EmailLogged(EmailRecord),
    CheckoutCreated(Checkout),
}

impl Event {
    /// Short label used in NOTIFY payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ReservationCreated(_) => "reservation_created",
            Event::ReservationUpdated(_) => "reservation_updated",
            Event::ReservationDeleted { .. } => "reservation_deleted",
            Event::ConfirmationSent { .. } => "confirmation_sent",
            Event::ClosureSet(_) => "closure_set",
            Event::ClosureRemoved { .. } => "closure_removed",
            Event::ClientSeen { .. } => "client_seen",
            Event::ClientSaved(_) => "client_saved",
            Event::ClientRemoved { .. } => "client_removed",
            Event::SubscriptionAdded(_) => "subscription_added",
            Event::SubscriptionRemoved { .. } => "subscription_removed",
            Event::EmailLogged(_) => "email_logged",
            Event::CheckoutCreated(_) => "checkout_created",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sighting(name: Option<&str>, visit: Option<NaiveDate>) -> ClientSighting {
        ClientSighting {
            email: "ada@example.com".into(),
            name: name.map(Into::into),
            phone: None,
            source: ClientSource::Booking,
            visit,
        }
    }

    #[test]
    fn status_parses_both_spellings() {
        assert_eq!("Cancelled".parse::<Status>().unwrap(), Status::Cancelled);
        assert_eq!("canceled".parse::<Status>().unwrap(), Status::Cancelled);
        assert!("maybe".parse::<Status>().is_err());
    }

    #[test]
    fn closure_kind_aliases() {
        assert_eq!("blocked".parse::<ClosureKind>().unwrap(), ClosureKind::Closed);
        assert_eq!("LUNCH_ONLY".parse::<ClosureKind>().unwrap(), ClosureKind::LunchOnly);
        assert_eq!("request".parse::<ClosureKind>().unwrap(), ClosureKind::RequestOnly);
    }

    #[test]
    fn absorb_keeps_existing_name_and_counts_visits() {
        let d1 = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let d0 = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let mut client = sighting(Some("Ada"), Some(d1)).into_client(10);
        assert_eq!(client.bookings, 1);

        client.absorb(&sighting(Some("Someone Else"), Some(d0)), 20);
        assert_eq!(client.name.as_deref(), Some("Ada"));
        assert_eq!(client.bookings, 2);
        // An older visit never moves last_visit backwards
        assert_eq!(client.last_visit, Some(d1));
        assert_eq!(client.updated_at, 20);
        assert_eq!(client.first_seen, 10);
    }

    #[test]
    fn absorb_without_visit_only_fills_gaps() {
        let mut client = sighting(None, None).into_client(1);
        assert_eq!(client.bookings, 0);
        client.absorb(&sighting(Some("Ada"), None), 2);
        assert_eq!(client.name.as_deref(), Some("Ada"));
        assert_eq!(client.bookings, 0);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ClosureSet(Closure {
            date: NaiveDate::from_ymd_opt(2026, 12, 25).unwrap(),
            kind: ClosureKind::Closed,
            note: Some("Christmas".into()),
        });
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
