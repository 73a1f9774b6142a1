//! Plain, single-language email bodies. Wording lives here and nowhere else.

use crate::config::Restaurant;
use crate::model::{Reservation, Template};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub subject: String,
    pub text: String,
    pub html: String,
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn when(r: &Reservation) -> String {
    format!("{} at {}", r.date.format("%A %-d %B %Y"), r.time.format("%H:%M"))
}

fn guests(n: u32) -> String {
    if n == 1 { "1 guest".into() } else { format!("{n} guests") }
}

pub fn render(template: Template, r: &Reservation, restaurant: &Restaurant) -> Rendered {
    let place = &restaurant.name;
    let (subject, lead) = match template {
        Template::Confirmation => (
            format!("Your table at {place} is confirmed"),
            format!("Dear {}, we look forward to welcoming you.", r.name),
        ),
        Template::RequestReceived => (
            format!("We received your request at {place}"),
            format!(
                "Dear {}, thank you for your request. We will confirm it by email as soon as possible.",
                r.name
            ),
        ),
        Template::Declined => (
            format!("About your request at {place}"),
            format!(
                "Dear {}, we are sorry but we cannot accommodate your request. Please try another date.",
                r.name
            ),
        ),
        Template::Cancelled => (
            format!("Your reservation at {place} was cancelled"),
            format!("Dear {}, your reservation has been cancelled.", r.name),
        ),
        Template::StaffNewBooking => (
            format!("New booking: {}, {}", r.name, guests(r.party_size)),
            "A booking was confirmed automatically.".to_string(),
        ),
        Template::StaffApprovalNeeded => (
            format!("Approval needed: {}, {}", r.name, guests(r.party_size)),
            format!(
                "A booking request needs review ({}).",
                r.review.map_or("manual", |reason| reason.as_str())
            ),
        ),
    };

    let mut details = vec![
        ("When", when(r)),
        ("Party", guests(r.party_size)),
        ("Name", r.name.clone()),
    ];
    if matches!(template, Template::StaffNewBooking | Template::StaffApprovalNeeded) {
        details.push(("Email", r.email.clone()));
        if let Some(phone) = &r.phone {
            details.push(("Phone", phone.clone()));
        }
    }
    if let Some(notes) = &r.notes {
        details.push(("Notes", notes.clone()));
    }
    details.push(("Reference", r.id.to_string()));

    let mut text = format!("{lead}\n\n");
    for (k, v) in &details {
        text.push_str(&format!("{k}: {v}\n"));
    }
    text.push_str(&format!("\n{place}\n{}\n", restaurant.site_url));

    let mut html = format!("<p>{}</p>\n<table>\n", escape_html(&lead));
    for (k, v) in &details {
        html.push_str(&format!("<tr><th align=\"left\">{k}</th><td>{}</td></tr>\n", escape_html(v)));
    }
    html.push_str(&format!(
        "</table>\n<p><a href=\"{url}\">{name}</a></p>\n",
        url = escape_html(&restaurant.site_url),
        name = escape_html(place),
    ));

    Rendered { subject, text, html }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime};
    use ulid::Ulid;

    use super::*;
    use crate::model::*;

    fn reservation() -> Reservation {
        Reservation {
            id: Ulid::new(),
            name: "Ada <script>".into(),
            email: "ada@example.com".into(),
            phone: Some("+39 055 123".into()),
            date: NaiveDate::from_ymd_opt(2026, 10, 20).unwrap(),
            time: NaiveTime::from_hms_opt(19, 30, 0).unwrap(),
            party_size: 1,
            notes: Some("window seat".into()),
            status: Status::Confirmed,
            review: None,
            origin: Origin::Web,
            confirmation_sent_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn guest_confirmation_mentions_date_and_party() {
        let out = render(Template::Confirmation, &reservation(), &Restaurant::default());
        assert_eq!(out.subject, "Your table at Tavola is confirmed");
        assert!(out.text.contains("Tuesday 20 October 2026 at 19:30"));
        assert!(out.text.contains("Party: 1 guest"));
        // contact details are for staff only
        assert!(!out.text.contains("+39 055 123"));
    }

    #[test]
    fn staff_email_has_contact_and_reason() {
        let mut r = reservation();
        r.party_size = 9;
        r.review = Some(ReviewReason::LargeParty);
        let out = render(Template::StaffApprovalNeeded, &r, &Restaurant::default());
        assert!(out.subject.contains("9 guests"));
        assert!(out.text.contains("large_party"));
        assert!(out.text.contains("Phone: +39 055 123"));
    }

    #[test]
    fn html_escapes_guest_input() {
        let out = render(Template::Confirmation, &reservation(), &Restaurant::default());
        assert!(out.html.contains("Ada &lt;script&gt;"));
        assert!(!out.html.contains("<script>"));
    }
}
