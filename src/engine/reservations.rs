use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::clients::{is_valid_email, normalize_email};
use crate::limits::*;
use crate::model::*;
use crate::policy::{self, Decision, Rejection, Request};

use super::{Engine, EngineError};

/// Submission fields after trimming, parsing and bounds checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Validated {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub party_size: u32,
    pub notes: Option<String>,
}

pub(super) fn validate_name(raw: &str) -> Result<String, EngineError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(EngineError::Invalid("name is required".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(EngineError::Invalid(format!("name longer than {MAX_NAME_LEN} characters")));
    }
    Ok(name.to_string())
}

pub(super) fn validate_email(raw: &str) -> Result<String, EngineError> {
    let email = normalize_email(raw);
    if !is_valid_email(&email) {
        return Err(EngineError::Invalid(format!("not a valid email address: {}", raw.trim())));
    }
    Ok(email)
}

pub(super) fn validate_phone(raw: Option<&str>) -> Result<Option<String>, EngineError> {
    let Some(phone) = raw.map(str::trim).filter(|p| !p.is_empty()) else {
        return Ok(None);
    };
    if phone.len() > MAX_PHONE_LEN {
        return Err(EngineError::Invalid(format!("phone longer than {MAX_PHONE_LEN} characters")));
    }
    if !phone
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, ' ' | '+' | '-' | '(' | ')'))
    {
        return Err(EngineError::Invalid(format!("not a phone number: {phone}")));
    }
    Ok(Some(phone.to_string()))
}

pub(super) fn validate_notes(raw: Option<&str>) -> Result<Option<String>, EngineError> {
    let Some(notes) = raw.map(str::trim).filter(|n| !n.is_empty()) else {
        return Ok(None);
    };
    if notes.chars().count() > MAX_NOTES_LEN {
        return Err(EngineError::Invalid(format!("notes longer than {MAX_NOTES_LEN} characters")));
    }
    Ok(Some(notes.to_string()))
}

fn party_size(raw: i64) -> u32 {
    // 0 and oversize are the policy's call; negatives collapse to 0
    u32::try_from(raw.max(0)).unwrap_or(u32::MAX)
}

pub(super) fn validate_submission(s: &Submission) -> Result<Validated, EngineError> {
    Ok(Validated {
        name: validate_name(&s.name)?,
        email: validate_email(&s.email)?,
        phone: validate_phone(s.phone.as_deref())?,
        date: policy::parse_date(&s.date).map_err(EngineError::Invalid)?,
        time: policy::parse_time(&s.time).map_err(EngineError::Invalid)?,
        party_size: party_size(s.party_size),
        notes: validate_notes(s.notes.as_deref())?,
    })
}

impl Engine {
    /// Guest booking form. Runs the acceptance policy and stores the booking
    /// as confirmed or pending review, then notifies guest, staff and admin devices.
    pub async fn submit_reservation(
        &self,
        submission: &Submission,
        now: NaiveDateTime,
    ) -> Result<Reservation, EngineError> {
        let v = validate_submission(submission)?;
        let closure = self.closures.get(&v.date).map(|c| c.kind);
        let request = Request {
            date: v.date,
            time: v.time,
            party_size: v.party_size,
        };
        let decision = policy::evaluate(&request, &self.policy, closure, now);
        let label = match decision {
            Decision::AutoConfirm => "confirmed",
            Decision::Review(_) => "review",
            Decision::Reject(r) => r.code(),
        };
        metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "decision" => label).increment(1);

        let (status, review) = match decision {
            Decision::AutoConfirm => (Status::Confirmed, None),
            Decision::Review(reason) => (Status::Pending, Some(reason)),
            Decision::Reject(rejection) => {
                debug!("rejected booking for {} {}: {rejection}", v.date, v.time);
                return Err(EngineError::Rejected(rejection));
            }
        };

        let reservation = self.create(v, status, review, Origin::Web).await?;
        info!(
            "reservation {} {status} ({} guests on {})",
            reservation.id, reservation.party_size, reservation.date
        );

        let subscriptions: Vec<PushSubscription> =
            self.subscriptions.iter().map(|e| e.value().clone()).collect();
        let report = self.dispatcher.reservation_submitted(&reservation, &subscriptions).await;
        self.record_dispatch(reservation.id, report).await;
        self.current(reservation.id).await
    }

    /// Booking entered by staff (phone, walk-in). Skips the acceptance policy.
    pub async fn record_staff_booking(
        &self,
        submission: &Submission,
        status: Status,
    ) -> Result<Reservation, EngineError> {
        let v = validate_submission(submission)?;
        if v.party_size == 0 {
            return Err(EngineError::Rejected(Rejection::InvalidPartySize));
        }
        if v.party_size > self.policy.max_party {
            return Err(EngineError::Rejected(Rejection::PartyTooLarge { max: self.policy.max_party }));
        }
        let reservation = self.create(v, status, None, Origin::Staff).await?;
        info!("staff booking {} {}", reservation.id, status);

        let report = self.dispatcher.staff_booking(&reservation).await;
        self.record_dispatch(reservation.id, report).await;
        self.current(reservation.id).await
    }

    /// Latest state, including bookkeeping written after dispatch.
    async fn current(&self, id: Ulid) -> Result<Reservation, EngineError> {
        Ok(self.get_reservation(&id)?.read().await.clone())
    }

    async fn create(
        &self,
        v: Validated,
        status: Status,
        review: Option<ReviewReason>,
        origin: Origin,
    ) -> Result<Reservation, EngineError> {
        if self.reservations.len() >= MAX_RESERVATIONS {
            return Err(EngineError::LimitExceeded("too many reservations"));
        }
        let now = now_ms();
        let reservation = Reservation {
            id: Ulid::new(),
            name: v.name,
            email: v.email,
            phone: v.phone,
            date: v.date,
            time: v.time,
            party_size: v.party_size,
            notes: v.notes,
            status,
            review,
            origin,
            confirmation_sent_at: None,
            created_at: now,
            updated_at: now,
        };
        self.persist_and_apply(Event::ReservationCreated(reservation.clone())).await?;

        let sighting = ClientSighting {
            email: reservation.email.clone(),
            name: Some(reservation.name.clone()),
            phone: reservation.phone.clone(),
            source: ClientSource::Booking,
            visit: Some(reservation.date),
        };
        // The booking is already stored; the contact book is side bookkeeping.
        if self.clients.contains_key(&sighting.email) || self.clients.len() < MAX_CLIENTS {
            if let Err(e) = self.persist_and_apply(Event::ClientSeen { sighting, at: now }).await {
                warn!("could not record client for {}: {e}", reservation.id);
            }
        }
        Ok(reservation)
    }

    /// Staff decision on a booking. Moving to the same status does nothing;
    /// otherwise the guest hears about confirmation, decline or cancellation.
    pub async fn set_status(&self, id: Ulid, status: Status) -> Result<Reservation, EngineError> {
        let shared = self.get_reservation(&id)?;
        let permit = self.commit_permit().await;
        let mut guard = shared.write().await;
        let previous = guard.status;
        if previous == status {
            return Ok(guard.clone());
        }
        let mut updated = guard.clone();
        updated.status = status;
        updated.updated_at = now_ms();
        self.persist_and_apply_locked(&permit, &mut guard, Event::ReservationUpdated(updated.clone()))
            .await?;
        drop(guard);
        drop(permit);
        info!("reservation {id} {previous} -> {status}");

        let report = self.dispatcher.status_changed(&updated, previous).await;
        self.record_dispatch(id, report).await;
        self.current(id).await
    }

    /// Admin edit. Field changes are validated but not re-checked against the
    /// acceptance policy; a status change goes through [`Engine::set_status`].
    pub async fn update_reservation(
        &self,
        id: Ulid,
        patch: &ReservationPatch,
    ) -> Result<Reservation, EngineError> {
        let shared = self.get_reservation(&id)?;
        if patch.touches_fields() {
            let permit = self.commit_permit().await;
            let mut guard = shared.write().await;
            let mut updated = guard.clone();
            if let Some(name) = &patch.name {
                updated.name = validate_name(name)?;
            }
            if let Some(email) = &patch.email {
                updated.email = validate_email(email)?;
            }
            if let Some(phone) = &patch.phone {
                updated.phone = validate_phone(phone.as_deref())?;
            }
            if let Some(date) = &patch.date {
                updated.date = policy::parse_date(date).map_err(EngineError::Invalid)?;
            }
            if let Some(time) = &patch.time {
                updated.time = policy::parse_time(time).map_err(EngineError::Invalid)?;
            }
            if let Some(size) = patch.party_size {
                let size = party_size(size);
                if size == 0 || size > self.policy.max_party {
                    return Err(EngineError::Invalid(format!(
                        "party size must be between 1 and {}",
                        self.policy.max_party
                    )));
                }
                updated.party_size = size;
            }
            if let Some(notes) = &patch.notes {
                updated.notes = validate_notes(notes.as_deref())?;
            }
            if updated != *guard {
                updated.updated_at = now_ms();
                self.persist_and_apply_locked(&permit, &mut guard, Event::ReservationUpdated(updated))
                    .await?;
            }
        }
        match patch.status {
            Some(status) => self.set_status(id, status).await,
            None => Ok(shared.read().await.clone()),
        }
    }

    pub async fn delete_reservation(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.reservations.contains_key(&id) {
            return Err(EngineError::not_found("reservation", id));
        }
        self.persist_and_apply(Event::ReservationDeleted { id }).await?;
        info!("reservation {id} deleted");
        Ok(())
    }
}
