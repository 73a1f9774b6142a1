use std::path::Path;

use chrono::NaiveDate;
use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::checkout::CheckoutRequest;
use crate::clients::{self, ImportReport};
use crate::limits::*;
use crate::model::*;

use super::reservations::{validate_email, validate_phone};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    // ── Closures ─────────────────────────────────────────

    pub async fn set_closure(
        &self,
        date: NaiveDate,
        kind: ClosureKind,
        note: Option<String>,
    ) -> Result<Closure, EngineError> {
        let note = note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        if note.as_ref().is_some_and(|n| n.chars().count() > MAX_CLOSURE_NOTE_LEN) {
            return Err(EngineError::LimitExceeded("closure note too long"));
        }
        let closure = Closure { date, kind, note };
        self.persist_and_apply(Event::ClosureSet(closure.clone())).await?;
        info!("closure {date}: {}", kind.as_str());
        Ok(closure)
    }

    pub async fn remove_closure(&self, date: NaiveDate) -> Result<(), EngineError> {
        if !self.closures.contains_key(&date) {
            return Err(EngineError::not_found("closure", date));
        }
        self.persist_and_apply(Event::ClosureRemoved { date }).await
    }

    // ── Clients ──────────────────────────────────────────

    /// Create or edit a client by hand. Given fields overwrite stored ones.
    pub async fn upsert_client(
        &self,
        email: &str,
        name: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Client, EngineError> {
        let email = validate_email(email)?;
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        if name.is_some_and(|n| n.chars().count() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("client name too long"));
        }
        let phone = validate_phone(phone)?;
        let now = now_ms();

        let client = match self.clients.get(&email).map(|c| c.value().clone()) {
            Some(mut existing) => {
                if let Some(name) = name {
                    existing.name = Some(name.to_string());
                }
                if phone.is_some() {
                    existing.phone = phone;
                }
                existing.updated_at = now;
                existing
            }
            None => {
                if self.clients.len() >= MAX_CLIENTS {
                    return Err(EngineError::LimitExceeded("too many clients"));
                }
                ClientSighting {
                    email,
                    name: name.map(str::to_string),
                    phone,
                    source: ClientSource::Manual,
                    visit: None,
                }
                .into_client(now)
            }
        };
        self.persist_and_apply(Event::ClientSaved(client.clone())).await?;
        Ok(client)
    }

    pub async fn remove_client(&self, email: &str) -> Result<(), EngineError> {
        let email = clients::normalize_email(email);
        if !self.clients.contains_key(&email) {
            return Err(EngineError::not_found("client", email));
        }
        self.persist_and_apply(Event::ClientRemoved { email }).await
    }

    /// Import a contacts CSV from a path on the server host.
    pub async fn import_clients_csv(&self, path: &Path) -> Result<ImportReport, EngineError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(clients::ImportError::from)?;
        let import = clients::parse_csv(&text)?;
        let mut report = ImportReport {
            skipped: import.skipped,
            ..ImportReport::default()
        };
        self.merge_sightings(import.sightings, &mut report).await?;
        info!(
            "imported {}: {} new, {} merged, {} skipped",
            path.display(),
            report.imported,
            report.merged,
            report.skipped
        );
        Ok(report)
    }

    /// Pull recent recipients from the email provider into the contact book.
    /// The restaurant's own staff address is left out.
    pub async fn sync_clients_from_email_history(&self) -> Result<ImportReport, EngineError> {
        let recipients = self
            .dispatcher
            .recent_recipients(EMAIL_HISTORY_LIMIT)
            .await
            .map_err(EngineError::Upstream)?;
        let staff = clients::normalize_email(&self.dispatcher.restaurant().staff_email);

        let mut report = ImportReport::default();
        let mut sightings = Vec::with_capacity(recipients.len());
        for r in &recipients {
            match clients::sighting_from_recipient(&r.email, r.name.as_deref()) {
                Some(s) if s.email != staff => sightings.push(s),
                _ => {
                    debug!("skipping history recipient {}", r.email);
                    report.skipped += 1;
                }
            }
        }
        self.merge_sightings(sightings, &mut report).await?;
        info!(
            "email history sync: {} new, {} merged, {} skipped",
            report.imported, report.merged, report.skipped
        );
        Ok(report)
    }

    async fn merge_sightings(
        &self,
        sightings: Vec<ClientSighting>,
        report: &mut ImportReport,
    ) -> Result<(), EngineError> {
        for sighting in sightings {
            if self.clients.contains_key(&sighting.email) {
                report.merged += 1;
            } else if self.clients.len() >= MAX_CLIENTS {
                return Err(EngineError::LimitExceeded("too many clients"));
            } else {
                report.imported += 1;
            }
            self.persist_and_apply(Event::ClientSeen { sighting, at: now_ms() }).await?;
        }
        Ok(())
    }

    // ── Push subscriptions ───────────────────────────────

    /// Register an admin device. Re-registering an endpoint replaces its keys.
    pub async fn add_subscription(
        &self,
        endpoint: &str,
        p256dh: &str,
        auth: &str,
    ) -> Result<PushSubscription, EngineError> {
        let endpoint = endpoint.trim();
        if !endpoint.starts_with("https://") || endpoint.len() > MAX_ENDPOINT_LEN {
            return Err(EngineError::Invalid("push endpoint must be an https URL".into()));
        }
        if p256dh.trim().is_empty() || auth.trim().is_empty() {
            return Err(EngineError::Invalid("push subscription keys are required".into()));
        }
        if !self.subscriptions.contains_key(endpoint) && self.subscriptions.len() >= MAX_PUSH_SUBSCRIPTIONS {
            return Err(EngineError::LimitExceeded("too many push subscriptions"));
        }
        let subscription = PushSubscription {
            endpoint: endpoint.to_string(),
            p256dh: p256dh.trim().to_string(),
            auth: auth.trim().to_string(),
            created_at: now_ms(),
        };
        self.persist_and_apply(Event::SubscriptionAdded(subscription.clone())).await?;
        Ok(subscription)
    }

    pub async fn remove_subscription(&self, endpoint: &str) -> Result<(), EngineError> {
        if !self.subscriptions.contains_key(endpoint) {
            return Err(EngineError::not_found("push subscription", endpoint));
        }
        self.persist_and_apply(Event::SubscriptionRemoved {
            endpoint: endpoint.to_string(),
        })
        .await
    }

    // ── Checkout ─────────────────────────────────────────

    /// Open a hosted payment page and remember it.
    pub async fn create_checkout(&self, request: CheckoutRequest) -> Result<Checkout, EngineError> {
        let request = CheckoutRequest {
            email: validate_email(&request.email)?,
            ..request
        };
        request.validate()?;
        let session = self.checkout.create_session(&request).await?;
        let checkout = Checkout {
            id: Ulid::new(),
            email: request.email,
            description: request.description.trim().to_string(),
            amount_cents: request.amount_cents,
            quantity: request.quantity,
            currency: self.checkout.currency().to_string(),
            session_id: session.id,
            url: session.url,
            created_at: now_ms(),
        };
        self.persist_and_apply(Event::CheckoutCreated(checkout.clone())).await?;
        info!("checkout {} opened ({} cents x{})", checkout.id, checkout.amount_cents, checkout.quantity);
        Ok(checkout)
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL as the minimal event list that recreates current state.
    /// Commits wait on the gate until the compacted file has replaced the log.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;
        let mut events = Vec::new();

        let mut closures: Vec<Closure> = self.closures.iter().map(|e| e.value().clone()).collect();
        closures.sort_by_key(|c| c.date);
        events.extend(closures.into_iter().map(Event::ClosureSet));

        let mut clients: Vec<Client> = self.clients.iter().map(|e| e.value().clone()).collect();
        clients.sort_by(|a, b| a.email.cmp(&b.email));
        events.extend(clients.into_iter().map(Event::ClientSaved));

        let mut subscriptions: Vec<PushSubscription> =
            self.subscriptions.iter().map(|e| e.value().clone()).collect();
        subscriptions.sort_by_key(|s| s.created_at);
        events.extend(subscriptions.into_iter().map(Event::SubscriptionAdded));

        let shared: Vec<_> = self.reservations.iter().map(|e| e.value().clone()).collect();
        let mut reservations = Vec::with_capacity(shared.len());
        for r in shared {
            reservations.push(r.read().await.clone());
        }
        reservations.sort_by_key(|r| r.id);
        events.extend(reservations.into_iter().map(Event::ReservationCreated));

        let mut emails: Vec<EmailRecord> = self.email_log.iter().map(|e| e.value().clone()).collect();
        emails.sort_by_key(|e| e.id);
        events.extend(emails.into_iter().map(Event::EmailLogged));

        let mut checkouts: Vec<Checkout> = self.checkouts.iter().map(|e| e.value().clone()).collect();
        checkouts.sort_by_key(|c| c.id);
        events.extend(checkouts.into_iter().map(Event::CheckoutCreated));

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
