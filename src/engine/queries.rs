use chrono::{NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::model::*;
use crate::policy::{self, Slot};

use super::Engine;

/// Conjunction of optional reservation predicates; the default matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub id: Option<Ulid>,
    pub date: Option<NaiveDate>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub status: Option<Status>,
    pub email: Option<String>,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        self.id.is_none_or(|id| r.id == id)
            && self.date.is_none_or(|d| r.date == d)
            && self.from.is_none_or(|d| r.date >= d)
            && self.to.is_none_or(|d| r.date <= d)
            && self.status.is_none_or(|s| r.status == s)
            && self.email.as_ref().is_none_or(|e| r.email == *e)
    }
}

impl Engine {
    /// Matching reservations in service order: date, time, then creation.
    pub async fn reservations(&self, filter: &ReservationFilter) -> Vec<Reservation> {
        let shared: Vec<_> = match filter.id {
            Some(id) => self.reservations.get(&id).map(|e| e.value().clone()).into_iter().collect(),
            None => self.reservations.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for r in shared {
            let guard = r.read().await;
            if filter.matches(&guard) {
                out.push(guard.clone());
            }
        }
        out.sort_by(|a, b| (a.date, a.time, a.created_at, a.id).cmp(&(b.date, b.time, b.created_at, b.id)));
        out
    }

    pub async fn reservation(&self, id: Ulid) -> Option<Reservation> {
        let shared = self.reservations.get(&id).map(|e| e.value().clone())?;
        let r = shared.read().await.clone();
        Some(r)
    }

    pub fn clients(&self) -> Vec<Client> {
        let mut out: Vec<Client> = self.clients.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.email.cmp(&b.email));
        out
    }

    pub fn client(&self, email: &str) -> Option<Client> {
        self.clients
            .get(&crate::clients::normalize_email(email))
            .map(|e| e.value().clone())
    }

    pub fn closures(&self) -> Vec<Closure> {
        let mut out: Vec<Closure> = self.closures.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|c| c.date);
        out
    }

    pub fn closure(&self, date: NaiveDate) -> Option<Closure> {
        self.closures.get(&date).map(|e| e.value().clone())
    }

    pub fn subscriptions(&self) -> Vec<PushSubscription> {
        let mut out: Vec<PushSubscription> = self.subscriptions.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| (a.created_at, &a.endpoint).cmp(&(b.created_at, &b.endpoint)));
        out
    }

    /// Email attempts, oldest first, optionally for one reservation.
    pub fn email_log(&self, reservation_id: Option<Ulid>) -> Vec<EmailRecord> {
        let mut out: Vec<EmailRecord> = self
            .email_log
            .iter()
            .filter(|e| reservation_id.is_none() || e.reservation_id == reservation_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|e| e.id);
        out
    }

    pub fn checkouts(&self) -> Vec<Checkout> {
        let mut out: Vec<Checkout> = self.checkouts.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|c| c.id);
        out
    }

    /// Seatings the public form may offer on `date`.
    pub fn slots(&self, date: NaiveDate, now: NaiveDateTime) -> Vec<Slot> {
        let closure = self.closures.get(&date).map(|c| c.kind);
        policy::slots_for(date, &self.policy, closure, now)
    }
}
