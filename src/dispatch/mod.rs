//! Best-effort notification side channel: transactional email to guests and
//! staff, Web Push to admin devices. Nothing in here returns an error to the
//! caller; failures are logged, counted and reported back for bookkeeping.

mod email;
mod push;
pub mod templates;

pub use email::{DisabledEmail, EmailMessage, EmailProvider, HttpEmailProvider, Recipient};
pub use push::{DisabledPush, HttpPushGateway, PushGateway, PushNotice, PushOutcome};

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use ulid::Ulid;

use crate::config::Restaurant;
use crate::model::*;

#[derive(Debug)]
pub enum DispatchError {
    Disabled(&'static str),
    Http(String),
    Status { code: u16, body: String },
    Decode(String),
    Timeout(Duration),
}

/// Deadline for one provider call unless [`Dispatcher::with_deadline`] says otherwise.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Disabled(what) => write!(f, "{what} provider not configured"),
            DispatchError::Http(e) => write!(f, "http error: {e}"),
            DispatchError::Status { code, body } => write!(f, "provider returned {code}: {body}"),
            DispatchError::Decode(e) => write!(f, "unexpected provider response: {e}"),
            DispatchError::Timeout(after) => write!(f, "no provider response within {} ms", after.as_millis()),
        }
    }
}

impl std::error::Error for DispatchError {}

/// What happened during one dispatch, for the caller to persist.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub emails: Vec<EmailRecord>,
    /// Push endpoints reported gone; the caller drops them.
    pub stale_subscriptions: Vec<String>,
}

impl DispatchReport {
    /// When the guest confirmation went out, if it did.
    pub fn confirmation_sent(&self) -> Option<Ms> {
        self.emails
            .iter()
            .find(|e| e.template == Template::Confirmation && e.outcome.is_sent())
            .map(|e| e.at)
    }
}

pub struct Dispatcher {
    email: Arc<dyn EmailProvider>,
    push: Arc<dyn PushGateway>,
    restaurant: Restaurant,
    deadline: Duration,
}

impl Dispatcher {
    pub fn new(email: Arc<dyn EmailProvider>, push: Arc<dyn PushGateway>, restaurant: Restaurant) -> Self {
        Self {
            email,
            push,
            restaurant,
            deadline: DEFAULT_DEADLINE,
        }
    }

    /// Cap every email and push call, so a hung provider can't hold up the
    /// booking that triggered it.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Recipients of recently sent mail, newest first.
    pub async fn recent_recipients(&self, limit: usize) -> Result<Vec<Recipient>, DispatchError> {
        tokio::time::timeout(self.deadline, self.email.recent_recipients(limit))
            .await
            .map_err(|_| DispatchError::Timeout(self.deadline))?
    }

    pub fn restaurant(&self) -> &Restaurant {
        &self.restaurant
    }

    /// A guest submitted the booking form. Guest and staff get one email each,
    /// admin devices get a push.
    pub async fn reservation_submitted(
        &self,
        r: &Reservation,
        subscriptions: &[PushSubscription],
    ) -> DispatchReport {
        let (guest, staff) = match r.status {
            Status::Confirmed => (Template::Confirmation, Template::StaffNewBooking),
            _ => (Template::RequestReceived, Template::StaffApprovalNeeded),
        };
        let mut report = DispatchReport::default();
        report.emails.push(self.send(guest, r, &r.email).await);
        let staff_email = self.restaurant.staff_email.clone();
        report.emails.push(self.send(staff, r, &staff_email).await);

        let notice = PushNotice {
            title: match r.status {
                Status::Confirmed => "New booking".into(),
                _ => "Booking request to review".into(),
            },
            body: format!(
                "{}, {} guests, {} {}",
                r.name,
                r.party_size,
                r.date,
                r.time.format("%H:%M")
            ),
            url: format!("{}/admin/reservations/{}", self.restaurant.site_url, r.id),
            tag: r.id.to_string(),
        };
        report.stale_subscriptions = self.push_all(subscriptions, &notice).await;
        report
    }

    /// Staff moved a reservation from `previous` to its current status.
    pub async fn status_changed(&self, r: &Reservation, previous: Status) -> DispatchReport {
        let template = match (previous, r.status) {
            (_, Status::Confirmed) if r.confirmation_sent_at.is_none() => Some(Template::Confirmation),
            (_, Status::Declined) => Some(Template::Declined),
            (Status::Pending | Status::Confirmed, Status::Cancelled) => Some(Template::Cancelled),
            _ => None,
        };
        let mut report = DispatchReport::default();
        match template {
            Some(t) => report.emails.push(self.send(t, r, &r.email).await),
            None => debug!("no email for {} {previous} -> {}", r.id, r.status),
        }
        report
    }

    /// Staff entered a booking directly. Only a confirmed one tells the guest.
    pub async fn staff_booking(&self, r: &Reservation) -> DispatchReport {
        let mut report = DispatchReport::default();
        if r.status == Status::Confirmed {
            report.emails.push(self.send(Template::Confirmation, r, &r.email).await);
        }
        report
    }

    async fn send(&self, template: Template, r: &Reservation, recipient: &str) -> EmailRecord {
        let rendered = templates::render(template, r, &self.restaurant);
        let message = EmailMessage {
            from: self.restaurant.sender.clone(),
            to: recipient.to_string(),
            subject: rendered.subject,
            text: rendered.text,
            html: rendered.html,
            reply_to: Some(self.restaurant.staff_email.clone()),
        };
        let sent = tokio::time::timeout(self.deadline, self.email.send(&message))
            .await
            .unwrap_or(Err(DispatchError::Timeout(self.deadline)));
        let outcome = match sent {
            Ok(provider_id) => EmailOutcome::Sent { provider_id },
            Err(e) => {
                warn!("email {} for {} to {recipient} failed: {e}", template.as_str(), r.id);
                EmailOutcome::Failed { error: e.to_string() }
            }
        };
        let status = if outcome.is_sent() { "sent" } else { "failed" };
        metrics::counter!(
            crate::observability::EMAILS_TOTAL,
            "template" => template.as_str(),
            "status" => status
        )
        .increment(1);
        EmailRecord {
            id: Ulid::new(),
            reservation_id: Some(r.id),
            template,
            recipient: recipient.to_string(),
            outcome,
            at: now_ms(),
        }
    }

    async fn push_all(&self, subscriptions: &[PushSubscription], notice: &PushNotice) -> Vec<String> {
        let outcomes = futures::future::join_all(subscriptions.iter().map(|sub| async move {
            tokio::time::timeout(self.deadline, self.push.push(sub, notice))
                .await
                .unwrap_or_else(|_| PushOutcome::Failed(DispatchError::Timeout(self.deadline).to_string()))
        }))
        .await;
        let mut stale = Vec::new();
        for (sub, outcome) in subscriptions.iter().zip(outcomes) {
            metrics::counter!(crate::observability::PUSH_TOTAL, "outcome" => outcome.label()).increment(1);
            match outcome {
                PushOutcome::Delivered => {}
                PushOutcome::Gone => {
                    debug!("push subscription gone: {}", sub.endpoint);
                    stale.push(sub.endpoint.clone());
                }
                PushOutcome::Failed(e) => warn!("push to {} failed: {e}", sub.endpoint),
            }
        }
        stale
    }
}
