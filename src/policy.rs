//! Reservation-acceptance policy: a rules table over dates, services and
//! party sizes. Everything here is pure; the caller supplies `now` and the
//! closure stored for the requested date.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};

use crate::model::{ClosureKind, ReviewReason};

/// Seating window of a service, both bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceWindow {
    pub first: NaiveTime,
    pub last: NaiveTime,
}

impl ServiceWindow {
    pub fn new(first: NaiveTime, last: NaiveTime) -> Self {
        debug_assert!(first <= last, "window must not wrap midnight");
        Self { first, last }
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        self.first <= t && t <= self.last
    }
}

impl FromStr for ServiceWindow {
    type Err = String;

    /// Parses `HH:MM-HH:MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (a, b) = s
            .split_once('-')
            .ok_or_else(|| format!("expected HH:MM-HH:MM, got {s:?}"))?;
        let first = parse_time(a)?;
        let last = parse_time(b)?;
        if first > last {
            return Err(format!("window {s:?} ends before it starts"));
        }
        Ok(Self { first, last })
    }
}

impl fmt::Display for ServiceWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first.format("%H:%M"), self.last.format("%H:%M"))
    }
}

/// Accepts `HH:MM` and `HH:MM:SS`.
pub fn parse_time(s: &str) -> Result<NaiveTime, String> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| format!("bad time: {s:?}"))
}

pub fn parse_date(s: &str) -> Result<NaiveDate, String> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| format!("bad date: {s:?}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    pub closed_weekdays: Vec<Weekday>,
    pub lunch: ServiceWindow,
    pub dinner: ServiceWindow,
    /// Seatings inside these windows always need approval.
    pub request_windows: Vec<ServiceWindow>,
    /// Parties of at least this size need approval.
    pub large_party: u32,
    pub max_party: u32,
    pub max_advance_days: i64,
    pub slot_step_minutes: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN);
        Self {
            closed_weekdays: vec![Weekday::Mon],
            lunch: ServiceWindow::new(t(12, 0), t(14, 30)),
            dinner: ServiceWindow::new(t(18, 30), t(22, 0)),
            request_windows: vec![ServiceWindow::new(t(21, 30), t(22, 0))],
            large_party: 8,
            max_party: 20,
            max_advance_days: 180,
            slot_step_minutes: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Lunch,
    Dinner,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Lunch => "lunch",
            Service::Dinner => "dinner",
        }
    }
}

/// A validated booking request as the policy sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub party_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    AutoConfirm,
    Review(ReviewReason),
    Reject(Rejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    InvalidPartySize,
    PartyTooLarge { max: u32 },
    InThePast,
    TooFarAhead { days: i64 },
    DateClosed,
    WeekdayClosed(Weekday),
    OutsideService,
    LunchOnly,
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::InvalidPartySize => "invalid_party_size",
            Rejection::PartyTooLarge { .. } => "party_too_large",
            Rejection::InThePast => "in_the_past",
            Rejection::TooFarAhead { .. } => "too_far_ahead",
            Rejection::DateClosed => "date_closed",
            Rejection::WeekdayClosed(_) => "weekday_closed",
            Rejection::OutsideService => "outside_service",
            Rejection::LunchOnly => "lunch_only",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::InvalidPartySize => write!(f, "party size must be at least 1"),
            Rejection::PartyTooLarge { max } => {
                write!(f, "parties above {max} guests must contact the restaurant")
            }
            Rejection::InThePast => write!(f, "requested time is in the past"),
            Rejection::TooFarAhead { days } => {
                write!(f, "bookings open at most {days} days in advance")
            }
            Rejection::DateClosed => write!(f, "the restaurant is closed on that date"),
            Rejection::WeekdayClosed(day) => write!(f, "the restaurant is closed on {day}"),
            Rejection::OutsideService => write!(f, "requested time is outside service hours"),
            Rejection::LunchOnly => write!(f, "only lunch is served on that date"),
        }
    }
}

pub fn service_for(config: &PolicyConfig, time: NaiveTime) -> Option<Service> {
    if config.lunch.contains(time) {
        Some(Service::Lunch)
    } else if config.dinner.contains(time) {
        Some(Service::Dinner)
    } else {
        None
    }
}

/// Date-level checks shared by `evaluate` and `slots_for`.
fn check_date(
    date: NaiveDate,
    config: &PolicyConfig,
    closure: Option<ClosureKind>,
    now: NaiveDateTime,
) -> Result<(), Rejection> {
    if date < now.date() {
        return Err(Rejection::InThePast);
    }
    if date - now.date() > Duration::days(config.max_advance_days) {
        return Err(Rejection::TooFarAhead {
            days: config.max_advance_days,
        });
    }
    match closure {
        Some(ClosureKind::Closed) => return Err(Rejection::DateClosed),
        // Any explicit opening override beats the weekly schedule.
        Some(_) => {}
        None => {
            let weekday = date.weekday();
            if config.closed_weekdays.contains(&weekday) {
                return Err(Rejection::WeekdayClosed(weekday));
            }
        }
    }
    Ok(())
}

/// Decide whether a booking is auto-confirmed, needs review, or is refused.
/// First matching rule wins.
pub fn evaluate(
    request: &Request,
    config: &PolicyConfig,
    closure: Option<ClosureKind>,
    now: NaiveDateTime,
) -> Decision {
    if request.party_size == 0 {
        return Decision::Reject(Rejection::InvalidPartySize);
    }
    if request.party_size > config.max_party {
        return Decision::Reject(Rejection::PartyTooLarge {
            max: config.max_party,
        });
    }
    if request.date.and_time(request.time) <= now {
        return Decision::Reject(Rejection::InThePast);
    }
    if let Err(r) = check_date(request.date, config, closure, now) {
        return Decision::Reject(r);
    }

    let service = match service_for(config, request.time) {
        Some(s) => s,
        None => return Decision::Reject(Rejection::OutsideService),
    };
    if closure == Some(ClosureKind::LunchOnly) && service == Service::Dinner {
        return Decision::Reject(Rejection::LunchOnly);
    }

    if closure == Some(ClosureKind::RequestOnly) {
        return Decision::Review(ReviewReason::RequestOnlyDate);
    }
    if config.request_windows.iter().any(|w| w.contains(request.time)) {
        return Decision::Review(ReviewReason::RequestOnlySlot);
    }
    if request.party_size >= config.large_party {
        return Decision::Review(ReviewReason::LargeParty);
    }
    Decision::AutoConfirm
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotMode {
    Instant,
    Request,
}

impl SlotMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotMode::Instant => "instant",
            SlotMode::Request => "request",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub time: NaiveTime,
    pub service: Service,
    pub mode: SlotMode,
}

/// Bookable seatings on `date` for the public form, in time order.
/// Party size is not known here, so large-party review is not reflected.
pub fn slots_for(
    date: NaiveDate,
    config: &PolicyConfig,
    closure: Option<ClosureKind>,
    now: NaiveDateTime,
) -> Vec<Slot> {
    if check_date(date, config, closure, now).is_err() {
        return Vec::new();
    }
    let step = Duration::minutes(i64::from(config.slot_step_minutes.max(1)));

    let mut services = vec![(Service::Lunch, config.lunch)];
    if closure != Some(ClosureKind::LunchOnly) {
        services.push((Service::Dinner, config.dinner));
    }

    let mut slots = Vec::new();
    for (service, window) in services {
        let mut t = window.first;
        loop {
            if date.and_time(t) > now {
                let request = closure == Some(ClosureKind::RequestOnly)
                    || config.request_windows.iter().any(|w| w.contains(t));
                slots.push(Slot {
                    time: t,
                    service,
                    mode: if request { SlotMode::Request } else { SlotMode::Instant },
                });
            }
            let (next, wrapped) = t.overflowing_add_signed(step);
            if wrapped != 0 || next > window.last || next <= t {
                break;
            }
            t = next;
        }
    }
    slots
}
