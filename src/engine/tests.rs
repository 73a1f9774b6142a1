use std::path::PathBuf;

use chrono::{NaiveDateTime, Weekday};

use super::*;
use crate::checkout::testing::FakeCheckout;
use crate::checkout::CheckoutRequest;
use crate::config::Restaurant;
use crate::dispatch::testing::{RecordingMailer, RecordingPush};
use crate::dispatch::Recipient;
use crate::policy::{parse_date, Rejection, Service, SlotMode};

const GUEST: &str = "ada@example.com";
const STAFF: &str = "staff@localhost";

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("tavola_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// Sunday 2026-10-18, 10:00 local.
fn now() -> NaiveDateTime {
    parse_date("2026-10-18").unwrap().and_hms_opt(10, 0, 0).unwrap()
}

fn d(s: &str) -> NaiveDate {
    parse_date(s).unwrap()
}

struct Harness {
    engine: Engine,
    mailer: Arc<RecordingMailer>,
    push: Arc<RecordingPush>,
    checkout: Arc<FakeCheckout>,
    path: PathBuf,
}

fn open(path: PathBuf) -> Harness {
    let mailer = Arc::new(RecordingMailer::default());
    let push = Arc::new(RecordingPush::default());
    let checkout = Arc::new(FakeCheckout::default());
    let dispatcher = Dispatcher::new(mailer.clone(), push.clone(), Restaurant::default());
    let engine = Engine::new(
        path.clone(),
        Arc::new(NotifyHub::new()),
        PolicyConfig::default(),
        dispatcher,
        checkout.clone(),
    )
    .unwrap();
    Harness {
        engine,
        mailer,
        push,
        checkout,
        path,
    }
}

fn harness(name: &str) -> Harness {
    open(test_wal_path(name))
}

/// Tuesday dinner for two.
fn submission() -> Submission {
    Submission {
        name: "Ada Lovelace".into(),
        email: "Ada@Example.com".into(),
        phone: Some("+39 055 1234".into()),
        date: "2026-10-20".into(),
        time: "19:30".into(),
        party_size: 2,
        notes: None,
    }
}

fn templates_to(mailer: &RecordingMailer, to: &str) -> Vec<String> {
    mailer.sent_to(to).into_iter().map(|m| m.subject).collect()
}

// ── Submission handler ───────────────────────────────────

#[tokio::test]
async fn auto_confirmed_submission() {
    let h = harness("auto_confirm.wal");
    h.engine.add_subscription("https://push.example/1", "k", "a").await.unwrap();

    let r = h.engine.submit_reservation(&submission(), now()).await.unwrap();
    assert_eq!(r.status, Status::Confirmed);
    assert_eq!(r.review, None);
    assert_eq!(r.origin, Origin::Web);
    assert_eq!(r.email, GUEST);
    assert!(r.confirmation_sent_at.is_some());

    assert_eq!(templates_to(&h.mailer, GUEST), vec!["Your table at Tavola is confirmed"]);
    assert_eq!(h.mailer.sent_to(STAFF).len(), 1);
    assert_eq!(h.push.pushed.lock().unwrap().len(), 1);

    let log = h.engine.email_log(Some(r.id));
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|e| e.outcome.is_sent()));

    let client = h.engine.client(GUEST).unwrap();
    assert_eq!(client.bookings, 1);
    assert_eq!(client.source, ClientSource::Booking);
    assert_eq!(client.last_visit, Some(d("2026-10-20")));
}

#[tokio::test]
async fn large_party_goes_to_review() {
    let h = harness("large_party.wal");
    let r = h
        .engine
        .submit_reservation(&Submission { party_size: 8, ..submission() }, now())
        .await
        .unwrap();
    assert_eq!(r.status, Status::Pending);
    assert_eq!(r.review, Some(ReviewReason::LargeParty));
    assert_eq!(r.confirmation_sent_at, None);
    assert_eq!(templates_to(&h.mailer, GUEST), vec!["We received your request at Tavola"]);
    assert!(h.mailer.sent_to(STAFF)[0].subject.starts_with("Approval needed"));
}

#[tokio::test]
async fn request_only_slot_goes_to_review() {
    let h = harness("request_slot.wal");
    let r = h
        .engine
        .submit_reservation(&Submission { time: "21:45".into(), ..submission() }, now())
        .await
        .unwrap();
    assert_eq!(r.review, Some(ReviewReason::RequestOnlySlot));
}

#[tokio::test]
async fn rejection_persists_nothing() {
    let h = harness("rejection.wal");
    // 2026-10-19 is a Monday
    let err = h
        .engine
        .submit_reservation(&Submission { date: "2026-10-19".into(), ..submission() }, now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Rejected(Rejection::WeekdayClosed(Weekday::Mon))));

    let err = h
        .engine
        .submit_reservation(&Submission { time: "16:00".into(), ..submission() }, now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Rejected(Rejection::OutsideService)));

    assert!(h.engine.reservations(&ReservationFilter::default()).await.is_empty());
    assert!(h.engine.clients().is_empty());
    assert!(h.mailer.sent.lock().unwrap().is_empty());
    assert_eq!(h.engine.wal_appends_since_compact().await, 0);
}

#[tokio::test]
async fn past_and_party_size_rejections() {
    let h = harness("past.wal");
    let err = h
        .engine
        .submit_reservation(&Submission { date: "2026-10-18".into(), time: "09:30".into(), ..submission() }, now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Rejected(Rejection::InThePast)));

    let err = h
        .engine
        .submit_reservation(&Submission { party_size: -3, ..submission() }, now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Rejected(Rejection::InvalidPartySize)));

    let err = h
        .engine
        .submit_reservation(&Submission { party_size: 21, ..submission() }, now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Rejected(Rejection::PartyTooLarge { max: 20 })));
}

#[tokio::test]
async fn invalid_input() {
    let h = harness("invalid.wal");
    for bad in [
        Submission { name: "  ".into(), ..submission() },
        Submission { email: "ada".into(), ..submission() },
        Submission { phone: Some("call me".into()), ..submission() },
        Submission { phone: Some("055.123.4567".into()), ..submission() },
        Submission { date: "20/10/2026".into(), ..submission() },
        Submission { time: "7pm".into(), ..submission() },
        Submission { notes: Some("x".repeat(1001)), ..submission() },
    ] {
        let err = h.engine.submit_reservation(&bad, now()).await.unwrap_err();
        assert!(matches!(err, EngineError::Invalid(_)), "{bad:?} gave {err}");
    }
}

#[tokio::test]
async fn closures_drive_the_policy() {
    let h = harness("closures.wal");
    h.engine.set_closure(d("2026-10-20"), ClosureKind::Closed, Some("private event".into())).await.unwrap();
    let err = h.engine.submit_reservation(&submission(), now()).await.unwrap_err();
    assert!(matches!(err, EngineError::Rejected(Rejection::DateClosed)));

    // Monday re-opened for lunch only
    h.engine.set_closure(d("2026-10-19"), ClosureKind::LunchOnly, None).await.unwrap();
    let monday = Submission { date: "2026-10-19".into(), ..submission() };
    let err = h.engine.submit_reservation(&monday, now()).await.unwrap_err();
    assert!(matches!(err, EngineError::Rejected(Rejection::LunchOnly)));
    let r = h
        .engine
        .submit_reservation(&Submission { time: "13:00".into(), ..monday }, now())
        .await
        .unwrap();
    assert_eq!(r.status, Status::Confirmed);

    h.engine.set_closure(d("2026-10-21"), ClosureKind::RequestOnly, None).await.unwrap();
    let r = h
        .engine
        .submit_reservation(&Submission { date: "2026-10-21".into(), ..submission() }, now())
        .await
        .unwrap();
    assert_eq!(r.review, Some(ReviewReason::RequestOnlyDate));

    h.engine.remove_closure(d("2026-10-20")).await.unwrap();
    assert!(h.engine.closure(d("2026-10-20")).is_none());
    assert!(matches!(
        h.engine.remove_closure(d("2026-10-20")).await,
        Err(EngineError::NotFound { what: "closure", .. })
    ));
    assert_eq!(h.engine.closures().len(), 2);
}

#[tokio::test]
async fn slots_follow_closures() {
    let h = harness("slots.wal");
    let tuesday = d("2026-10-20");
    let slots = h.engine.slots(tuesday, now());
    assert!(slots.iter().any(|s| s.time.format("%H:%M").to_string() == "20:00"));
    assert!(slots.iter().any(|s| s.mode == SlotMode::Request));

    h.engine.set_closure(tuesday, ClosureKind::LunchOnly, None).await.unwrap();
    assert!(h.engine.slots(tuesday, now()).iter().all(|s| s.service == Service::Lunch));

    h.engine.set_closure(tuesday, ClosureKind::Closed, None).await.unwrap();
    assert!(h.engine.slots(tuesday, now()).is_empty());
    assert!(h.engine.slots(d("2026-10-19"), now()).is_empty());
}

// ── Status-change handler ────────────────────────────────

#[tokio::test]
async fn confirming_a_pending_booking_sends_confirmation_once() {
    let h = harness("confirm_once.wal");
    let r = h
        .engine
        .submit_reservation(&Submission { party_size: 10, ..submission() }, now())
        .await
        .unwrap();
    assert_eq!(r.status, Status::Pending);

    let r = h.engine.set_status(r.id, Status::Confirmed).await.unwrap();
    assert_eq!(r.status, Status::Confirmed);
    assert!(r.confirmation_sent_at.is_some());
    assert_eq!(h.mailer.sent_to(GUEST).len(), 2);

    // Same status again: no-op
    h.engine.set_status(r.id, Status::Confirmed).await.unwrap();
    assert_eq!(h.mailer.sent_to(GUEST).len(), 2);

    // Back to pending and confirmed again: the guest already has a confirmation
    h.engine.set_status(r.id, Status::Pending).await.unwrap();
    h.engine.set_status(r.id, Status::Confirmed).await.unwrap();
    assert_eq!(h.mailer.sent_to(GUEST).len(), 2);

    h.engine.set_status(r.id, Status::Cancelled).await.unwrap();
    let subjects = templates_to(&h.mailer, GUEST);
    assert_eq!(subjects.last().unwrap(), "Your reservation at Tavola was cancelled");
}

#[tokio::test]
async fn declining_sends_decline() {
    let h = harness("decline.wal");
    let r = h
        .engine
        .submit_reservation(&Submission { party_size: 9, ..submission() }, now())
        .await
        .unwrap();
    let r = h.engine.set_status(r.id, Status::Declined).await.unwrap();
    assert_eq!(r.status, Status::Declined);
    assert_eq!(templates_to(&h.mailer, GUEST).last().unwrap(), "About your request at Tavola");
    assert!(matches!(
        h.engine.set_status(Ulid::new(), Status::Confirmed).await,
        Err(EngineError::NotFound { what: "reservation", .. })
    ));
}

#[tokio::test]
async fn failed_confirmation_is_retried_on_next_confirm() {
    let h = harness("failed_confirmation.wal");
    h.mailer.failing.lock().unwrap().push(GUEST.into());
    let r = h.engine.submit_reservation(&submission(), now()).await.unwrap();
    assert_eq!(r.status, Status::Confirmed);
    assert_eq!(r.confirmation_sent_at, None);
    let log = h.engine.email_log(Some(r.id));
    assert!(log.iter().any(|e| e.template == Template::Confirmation && !e.outcome.is_sent()));

    h.mailer.failing.lock().unwrap().clear();
    h.engine.set_status(r.id, Status::Pending).await.unwrap();
    let r = h.engine.set_status(r.id, Status::Confirmed).await.unwrap();
    assert!(r.confirmation_sent_at.is_some());
    assert_eq!(h.mailer.sent_to(GUEST).len(), 1);
}

// ── Staff bookings and edits ─────────────────────────────

#[tokio::test]
async fn staff_booking_skips_policy() {
    let h = harness("staff_booking.wal");
    // Monday, outside service hours
    let walk_in = Submission {
        date: "2026-10-19".into(),
        time: "16:00".into(),
        ..submission()
    };
    let r = h.engine.record_staff_booking(&walk_in, Status::Confirmed).await.unwrap();
    assert_eq!(r.origin, Origin::Staff);
    assert!(r.confirmation_sent_at.is_some());
    assert!(h.mailer.sent_to(STAFF).is_empty());

    let r = h.engine.record_staff_booking(&walk_in, Status::Pending).await.unwrap();
    assert_eq!(r.status, Status::Pending);
    assert_eq!(h.mailer.sent_to(GUEST).len(), 1);
    assert_eq!(h.engine.client(GUEST).unwrap().bookings, 2);

    let err = h
        .engine
        .record_staff_booking(&Submission { party_size: 0, ..walk_in }, Status::Confirmed)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Rejected(Rejection::InvalidPartySize)));
}

#[tokio::test]
async fn update_reservation_fields_and_status() {
    let h = harness("update.wal");
    let r = h.engine.submit_reservation(&submission(), now()).await.unwrap();
    let sent_before = h.mailer.sent.lock().unwrap().len();

    let patch = ReservationPatch {
        time: Some("20:15".into()),
        party_size: Some(4),
        notes: Some(Some("birthday".into())),
        phone: Some(None),
        ..ReservationPatch::default()
    };
    let updated = h.engine.update_reservation(r.id, &patch).await.unwrap();
    assert_eq!(updated.time.format("%H:%M").to_string(), "20:15");
    assert_eq!(updated.party_size, 4);
    assert_eq!(updated.notes.as_deref(), Some("birthday"));
    assert_eq!(updated.phone, None);
    assert!(updated.updated_at >= r.updated_at);
    // Field edits never email
    assert_eq!(h.mailer.sent.lock().unwrap().len(), sent_before);

    let patch = ReservationPatch {
        status: Some(Status::Cancelled),
        ..ReservationPatch::default()
    };
    let cancelled = h.engine.update_reservation(r.id, &patch).await.unwrap();
    assert_eq!(cancelled.status, Status::Cancelled);
    assert_eq!(h.mailer.sent.lock().unwrap().len(), sent_before + 1);

    let bad = ReservationPatch {
        party_size: Some(0),
        ..ReservationPatch::default()
    };
    assert!(matches!(
        h.engine.update_reservation(r.id, &bad).await,
        Err(EngineError::Invalid(_))
    ));
}

#[tokio::test]
async fn delete_reservation() {
    let h = harness("delete.wal");
    let r = h.engine.submit_reservation(&submission(), now()).await.unwrap();
    h.engine.delete_reservation(r.id).await.unwrap();
    assert!(h.engine.reservation(r.id).await.is_none());
    assert!(matches!(
        h.engine.delete_reservation(r.id).await,
        Err(EngineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn reservation_filters_and_order() {
    let h = harness("filters.wal");
    let late = h.engine.submit_reservation(&Submission { time: "20:30".into(), ..submission() }, now()).await.unwrap();
    let early = h.engine.submit_reservation(&Submission { time: "12:30".into(), ..submission() }, now()).await.unwrap();
    let other = h
        .engine
        .submit_reservation(
            &Submission {
                date: "2026-10-22".into(),
                email: "bob@example.com".into(),
                party_size: 12,
                ..submission()
            },
            now(),
        )
        .await
        .unwrap();

    let all = h.engine.reservations(&ReservationFilter::default()).await;
    let ids: Vec<Ulid> = all.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![early.id, late.id, other.id]);

    let pending = ReservationFilter {
        status: Some(Status::Pending),
        ..ReservationFilter::default()
    };
    assert_eq!(h.engine.reservations(&pending).await.len(), 1);

    let range = ReservationFilter {
        from: Some(d("2026-10-21")),
        to: Some(d("2026-10-31")),
        ..ReservationFilter::default()
    };
    assert_eq!(h.engine.reservations(&range).await[0].id, other.id);

    let by_email = ReservationFilter {
        email: Some(GUEST.into()),
        ..ReservationFilter::default()
    };
    assert_eq!(h.engine.reservations(&by_email).await.len(), 2);
}

// ── Clients ──────────────────────────────────────────────

#[tokio::test]
async fn csv_import_merges_by_email() {
    let h = harness("csv_import.wal");
    h.engine.submit_reservation(&submission(), now()).await.unwrap();

    let csv = test_wal_path("contacts.csv");
    std::fs::write(
        &csv,
        "Name,Email,Phone\n\"Lovelace, Ada\",ADA@example.com,\nBob,bob@example.com,+1 555\nBobby,Bob@Example.com,\nnobody,,\n",
    )
    .unwrap();
    let report = h.engine.import_clients_csv(&csv).await.unwrap();
    assert_eq!(report.imported, 1);
    assert_eq!(report.merged, 2);
    assert_eq!(report.skipped, 1);

    let clients = h.engine.clients();
    assert_eq!(clients.len(), 2);
    // Booking data was there first and wins
    assert_eq!(clients[0].name.as_deref(), Some("Ada Lovelace"));
    assert_eq!(clients[1].email, "bob@example.com");
    assert_eq!(clients[1].name.as_deref(), Some("Bob"));
    assert_eq!(clients[1].source, ClientSource::Csv);

    assert!(matches!(
        h.engine.import_clients_csv(&test_wal_path("missing.csv")).await,
        Err(EngineError::Import(_))
    ));
}

#[tokio::test]
async fn email_history_sync_skips_staff_address() {
    let h = harness("history_sync.wal");
    *h.mailer.history.lock().unwrap() = vec![
        Recipient { email: "Carla@example.com".into(), name: Some("Carla".into()) },
        Recipient { email: STAFF.into(), name: None },
        Recipient { email: "carla@example.com".into(), name: None },
        Recipient { email: "broken".into(), name: None },
    ];
    let report = h.engine.sync_clients_from_email_history().await.unwrap();
    assert_eq!(report.imported, 1);
    assert_eq!(report.merged, 1);
    assert_eq!(report.skipped, 2);
    let carla = h.engine.client("carla@example.com").unwrap();
    assert_eq!(carla.source, ClientSource::EmailHistory);
    assert_eq!(carla.name.as_deref(), Some("Carla"));
}

#[tokio::test]
async fn manual_client_edits() {
    let h = harness("manual_clients.wal");
    let c = h.engine.upsert_client("Dora@Example.com", Some("Dora"), None).await.unwrap();
    assert_eq!(c.email, "dora@example.com");
    assert_eq!(c.source, ClientSource::Manual);

    let c = h.engine.upsert_client("dora@example.com", Some("Dora M."), Some("+39 1")).await.unwrap();
    assert_eq!(c.name.as_deref(), Some("Dora M."));
    assert_eq!(c.phone.as_deref(), Some("+39 1"));
    assert_eq!(h.engine.clients().len(), 1);

    assert!(matches!(
        h.engine.upsert_client("not an email", None, None).await,
        Err(EngineError::Invalid(_))
    ));
    h.engine.remove_client("DORA@example.com").await.unwrap();
    assert!(h.engine.clients().is_empty());
    assert!(h.engine.remove_client("dora@example.com").await.is_err());
}

// ── Push subscriptions ───────────────────────────────────

#[tokio::test]
async fn gone_subscriptions_are_dropped() {
    let h = harness("gone_push.wal");
    h.engine.add_subscription("https://push.example/dead", "k", "a").await.unwrap();
    h.engine.add_subscription("https://push.example/live", "k", "a").await.unwrap();
    // Re-registering replaces rather than duplicates
    h.engine.add_subscription("https://push.example/live", "k2", "a2").await.unwrap();
    assert_eq!(h.engine.subscriptions().len(), 2);

    h.push.gone.lock().unwrap().push("https://push.example/dead".into());
    h.engine.submit_reservation(&submission(), now()).await.unwrap();

    let subs = h.engine.subscriptions();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].endpoint, "https://push.example/live");
    assert_eq!(subs[0].p256dh, "k2");

    assert!(matches!(
        h.engine.add_subscription("http://insecure", "k", "a").await,
        Err(EngineError::Invalid(_))
    ));
    h.engine.remove_subscription("https://push.example/live").await.unwrap();
    assert!(h.engine.remove_subscription("https://push.example/live").await.is_err());
}

// ── Checkout ─────────────────────────────────────────────

#[tokio::test]
async fn checkout_is_recorded() {
    let h = harness("checkout.wal");
    let request = CheckoutRequest {
        email: "Ada@example.com".into(),
        description: "Gift voucher".into(),
        amount_cents: 7500,
        quantity: 2,
    };
    let c = h.engine.create_checkout(request.clone()).await.unwrap();
    assert_eq!(c.email, GUEST);
    assert_eq!(c.currency, "eur");
    assert_eq!(c.session_id, "cs_test_1");
    assert_eq!(h.engine.checkouts(), vec![c]);

    let err = h
        .engine
        .create_checkout(CheckoutRequest { amount_cents: 0, ..request })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Invalid(_)));
    assert_eq!(h.checkout.requests.lock().unwrap().len(), 1);
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn listeners_see_reservation_events() {
    let h = harness("notify.wal");
    let mut rx = h.engine.notify.subscribe("reservations");
    let r = h.engine.submit_reservation(&submission(), now()).await.unwrap();
    match rx.recv().await.unwrap() {
        Event::ReservationCreated(created) => assert_eq!(created.id, r.id),
        other => panic!("unexpected event {other:?}"),
    }
}

// ── Persistence ──────────────────────────────────────────

async fn snapshot(engine: &Engine) -> (Vec<Reservation>, Vec<Client>, Vec<Closure>, usize, usize) {
    (
        engine.reservations(&ReservationFilter::default()).await,
        engine.clients(),
        engine.closures(),
        engine.email_log(None).len(),
        engine.subscriptions().len(),
    )
}

async fn populate(h: &Harness) {
    h.engine.set_closure(d("2026-12-25"), ClosureKind::Closed, Some("Christmas".into())).await.unwrap();
    h.engine.add_subscription("https://push.example/1", "k", "a").await.unwrap();
    let r = h
        .engine
        .submit_reservation(&Submission { party_size: 9, ..submission() }, now())
        .await
        .unwrap();
    h.engine.set_status(r.id, Status::Confirmed).await.unwrap();
    h.engine.submit_reservation(&submission(), now()).await.unwrap();
    h.engine.upsert_client("bob@example.com", Some("Bob"), None).await.unwrap();
}

#[tokio::test]
async fn replay_restores_state() {
    let h = harness("replay.wal");
    populate(&h).await;
    let before = snapshot(&h.engine).await;
    assert!(before.0.iter().all(|r| r.confirmation_sent_at.is_some()));
    assert_eq!(before.1[0].bookings, 2);

    let reopened = open(h.path.clone());
    assert_eq!(snapshot(&reopened.engine).await, before);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let h = harness("compaction.wal");
    populate(&h).await;
    let r = h.engine.submit_reservation(&submission(), now()).await.unwrap();
    h.engine.delete_reservation(r.id).await.unwrap();
    let before = snapshot(&h.engine).await;
    assert!(h.engine.wal_appends_since_compact().await > 0);

    h.engine.compact_wal().await.unwrap();
    assert_eq!(h.engine.wal_appends_since_compact().await, 0);
    let compacted_len = Wal::replay(&h.path).unwrap().events.len();

    // Appends after compaction land in the new file
    h.engine.set_closure(d("2026-12-26"), ClosureKind::LunchOnly, None).await.unwrap();
    assert_eq!(Wal::replay(&h.path).unwrap().events.len(), compacted_len + 1);

    let reopened = open(h.path.clone());
    let after = snapshot(&reopened.engine).await;
    assert_eq!(after.0, before.0);
    assert_eq!(after.1, before.1);
    assert_eq!(after.2.len(), before.2.len() + 1);
    assert_eq!(after.3, before.3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compaction_keeps_commits_racing_it() {
    let h = harness("compaction_race.wal");
    let path = h.path.clone();
    let engine = Arc::new(h.engine);
    let r = engine.submit_reservation(&submission(), now()).await.unwrap();
    let base = d("2027-01-01");

    for round in 0..20u64 {
        let mut writers = Vec::new();
        for i in 0..50u64 {
            let engine = engine.clone();
            let date = base + chrono::Days::new(round * 50 + i);
            writers.push(tokio::spawn(async move {
                engine.set_closure(date, ClosureKind::Closed, None).await.unwrap();
            }));
        }
        let editor = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let patch = ReservationPatch {
                    notes: Some(Some(format!("round {round}"))),
                    ..ReservationPatch::default()
                };
                engine.update_reservation(r.id, &patch).await.unwrap();
            })
        };
        engine.compact_wal().await.unwrap();
        for w in writers {
            w.await.unwrap();
        }
        editor.await.unwrap();
    }

    let closures = engine.closures().len();
    let notes = engine.reservation(r.id).await.unwrap().notes;
    assert_eq!(closures, 1000);
    assert_eq!(notes.as_deref(), Some("round 19"));

    let reopened = open(path);
    assert_eq!(reopened.engine.closures().len(), closures);
    assert_eq!(reopened.engine.reservation(r.id).await.unwrap().notes, notes);
}

#[tokio::test]
async fn torn_tail_is_cut_before_new_appends() {
    use std::io::Write;

    let h = harness("torn_restart.wal");
    h.engine.set_closure(d("2026-12-24"), ClosureKind::Closed, None).await.unwrap();
    drop(h.engine);
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&h.path).unwrap();
        f.write_all(&200u32.to_le_bytes()).unwrap();
        f.write_all(&[0xAB; 17]).unwrap();
    }

    let reopened = open(h.path.clone());
    assert_eq!(reopened.engine.closures().len(), 1);
    reopened.engine.set_closure(d("2026-12-25"), ClosureKind::Closed, None).await.unwrap();
    drop(reopened.engine);

    let restarted = open(h.path);
    assert_eq!(restarted.engine.closures().len(), 2);
}

#[tokio::test]
async fn failed_client_bookkeeping_keeps_the_booking() {
    let mut h = harness("client_upsert_fails.wal");
    // Stand-in writer that accepts everything except contact-book events
    let (tx, mut rx) = mpsc::channel(64);
    h.engine.wal_tx = tx;
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            if let WalCommand::Append { event, response } = cmd {
                let result = match event {
                    Event::ClientSeen { .. } => Err(std::io::Error::other("disk full")),
                    _ => Ok(()),
                };
                let _ = response.send(result);
            }
        }
    });

    let r = h.engine.submit_reservation(&submission(), now()).await.unwrap();
    assert_eq!(r.status, Status::Confirmed);
    assert!(h.engine.clients().is_empty());
    assert_eq!(templates_to(&h.mailer, GUEST), vec!["Your table at Tavola is confirmed"]);
    assert_eq!(templates_to(&h.mailer, STAFF).len(), 1);
}
