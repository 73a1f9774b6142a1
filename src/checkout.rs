//! Hosted payment checkout sessions (gift vouchers, event tickets). The
//! payment page itself lives at the provider; we only open the session and
//! keep a record of it.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::CheckoutApi;
use crate::limits::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub email: String,
    pub description: String,
    pub amount_cents: i64,
    pub quantity: u32,
}

/// What the provider hands back: its session id and the page to redirect to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug)]
pub enum CheckoutError {
    Disabled,
    Invalid(String),
    Http(String),
    Status { code: u16, body: String },
    Decode(String),
}

impl std::fmt::Display for CheckoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckoutError::Disabled => write!(f, "payments are not configured"),
            CheckoutError::Invalid(msg) => write!(f, "invalid checkout: {msg}"),
            CheckoutError::Http(e) => write!(f, "payment provider unreachable: {e}"),
            CheckoutError::Status { code, body } => {
                write!(f, "payment provider returned {code}: {body}")
            }
            CheckoutError::Decode(e) => write!(f, "unexpected payment provider response: {e}"),
        }
    }
}

impl std::error::Error for CheckoutError {}

impl CheckoutRequest {
    pub fn validate(&self) -> Result<(), CheckoutError> {
        if !(1..=MAX_CHECKOUT_AMOUNT_CENTS).contains(&self.amount_cents) {
            return Err(CheckoutError::Invalid(format!(
                "amount must be between 1 and {MAX_CHECKOUT_AMOUNT_CENTS} cents"
            )));
        }
        if !(1..=MAX_CHECKOUT_QUANTITY).contains(&self.quantity) {
            return Err(CheckoutError::Invalid(format!(
                "quantity must be between 1 and {MAX_CHECKOUT_QUANTITY}"
            )));
        }
        let description = self.description.trim();
        if description.is_empty() || description.len() > MAX_DESCRIPTION_LEN {
            return Err(CheckoutError::Invalid("description missing or too long".into()));
        }
        Ok(())
    }
}

#[async_trait]
pub trait CheckoutProvider: Send + Sync {
    /// Currency the provider charges in, lowercase ISO 4217.
    fn currency(&self) -> &str;

    async fn create_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession, CheckoutError>;
}

/// Card-payment API taking form-encoded session requests (`POST /v1/checkout/sessions`).
pub struct HttpCheckoutProvider {
    client: reqwest::Client,
    api: CheckoutApi,
}

impl HttpCheckoutProvider {
    pub fn new(api: &CheckoutApi, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            api: CheckoutApi {
                base_url: api.base_url.trim_end_matches('/').to_string(),
                currency: api.currency.to_lowercase(),
                ..api.clone()
            },
        })
    }
}

pub(crate) fn session_form(api: &CheckoutApi, request: &CheckoutRequest) -> Vec<(&'static str, String)> {
    vec![
        ("mode", "payment".into()),
        ("success_url", api.success_url.clone()),
        ("cancel_url", api.cancel_url.clone()),
        ("customer_email", request.email.clone()),
        ("line_items[0][quantity]", request.quantity.to_string()),
        ("line_items[0][price_data][currency]", api.currency.clone()),
        ("line_items[0][price_data][unit_amount]", request.amount_cents.to_string()),
        (
            "line_items[0][price_data][product_data][name]",
            request.description.trim().to_string(),
        ),
    ]
}

#[async_trait]
impl CheckoutProvider for HttpCheckoutProvider {
    fn currency(&self) -> &str {
        &self.api.currency
    }

    async fn create_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession, CheckoutError> {
        let resp = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.api.base_url))
            .bearer_auth(&self.api.secret_key)
            .form(&session_form(&self.api, request))
            .send()
            .await
            .map_err(|e| CheckoutError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CheckoutError::Status {
                code: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }
        resp.json().await.map_err(|e| CheckoutError::Decode(e.to_string()))
    }
}

pub struct DisabledCheckout;

#[async_trait]
impl CheckoutProvider for DisabledCheckout {
    fn currency(&self) -> &str {
        "eur"
    }

    async fn create_session(&self, _request: &CheckoutRequest) -> Result<CheckoutSession, CheckoutError> {
        Err(CheckoutError::Disabled)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CheckoutRequest {
        CheckoutRequest {
            email: "ada@example.com".into(),
            description: "Gift voucher".into(),
            amount_cents: 5000,
            quantity: 1,
        }
    }

    #[test]
    fn validation_bounds() {
        assert!(request().validate().is_ok());
        assert!(CheckoutRequest { amount_cents: 0, ..request() }.validate().is_err());
        assert!(
            CheckoutRequest { amount_cents: MAX_CHECKOUT_AMOUNT_CENTS + 1, ..request() }
                .validate()
                .is_err()
        );
        assert!(CheckoutRequest { quantity: 0, ..request() }.validate().is_err());
        assert!(CheckoutRequest { description: "  ".into(), ..request() }.validate().is_err());
    }

    #[test]
    fn form_carries_price_data() {
        let api = CheckoutApi {
            base_url: "https://api.pay.example".into(),
            secret_key: "sk".into(),
            currency: "eur".into(),
            success_url: "https://tavola.example/thanks".into(),
            cancel_url: "https://tavola.example/".into(),
        };
        let form = session_form(&api, &request());
        let get = |k: &str| form.iter().find(|(key, _)| *key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("mode"), Some("payment"));
        assert_eq!(get("line_items[0][price_data][unit_amount]"), Some("5000"));
        assert_eq!(get("line_items[0][price_data][product_data][name]"), Some("Gift voucher"));
        assert_eq!(get("customer_email"), Some("ada@example.com"));
    }

    #[tokio::test]
    async fn disabled_provider_refuses() {
        assert!(matches!(
            DisabledCheckout.create_session(&request()).await,
            Err(CheckoutError::Disabled)
        ));
    }
}
