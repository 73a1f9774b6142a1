use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::DispatchError;
use crate::config::EmailApi;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub reply_to: Option<String>,
}

/// A past recipient as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub email: String,
    pub name: Option<String>,
}

#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Send one message; returns the provider's message id.
    async fn send(&self, message: &EmailMessage) -> Result<String, DispatchError>;

    /// Recipients of recently sent mail, newest first.
    async fn recent_recipients(&self, limit: usize) -> Result<Vec<Recipient>, DispatchError>;
}

/// Transactional email over a JSON HTTP API (`POST /emails`, `GET /emails`).
pub struct HttpEmailProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpEmailProvider {
    pub fn new(api: &EmailApi, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            api_key: api.api_key.clone(),
        })
    }
}

pub(crate) fn send_body(message: &EmailMessage) -> serde_json::Value {
    let mut body = json!({
        "from": message.from,
        "to": [message.to],
        "subject": message.subject,
        "text": message.text,
        "html": message.html,
    });
    if let Some(reply_to) = &message.reply_to {
        body["reply_to"] = json!(reply_to);
    }
    body
}

#[derive(Deserialize)]
struct SendResponse {
    id: String,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    data: Vec<SentEmail>,
}

#[derive(Deserialize)]
struct SentEmail {
    #[serde(default)]
    to: Vec<String>,
}

/// Split `"Ada Lovelace <ada@example.com>"` into name and address.
pub(crate) fn parse_mailbox(raw: &str) -> Recipient {
    let raw = raw.trim();
    match (raw.rfind('<'), raw.ends_with('>')) {
        (Some(open), true) => {
            let name = raw[..open].trim().trim_matches('"').trim();
            Recipient {
                email: raw[open + 1..raw.len() - 1].trim().to_string(),
                name: (!name.is_empty()).then(|| name.to_string()),
            }
        }
        _ => Recipient {
            email: raw.to_string(),
            name: None,
        },
    }
}

async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response, DispatchError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(DispatchError::Status {
        code: status.as_u16(),
        body: body.chars().take(200).collect(),
    })
}

#[async_trait]
impl EmailProvider for HttpEmailProvider {
    async fn send(&self, message: &EmailMessage) -> Result<String, DispatchError> {
        let resp = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&send_body(message))
            .send()
            .await
            .map_err(|e| DispatchError::Http(e.to_string()))?;
        let parsed: SendResponse = error_for_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| DispatchError::Decode(e.to_string()))?;
        Ok(parsed.id)
    }

    async fn recent_recipients(&self, limit: usize) -> Result<Vec<Recipient>, DispatchError> {
        let resp = self
            .client
            .get(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .query(&[("limit", limit)])
            .send()
            .await
            .map_err(|e| DispatchError::Http(e.to_string()))?;
        let parsed: ListResponse = error_for_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| DispatchError::Decode(e.to_string()))?;
        Ok(parsed
            .data
            .iter()
            .flat_map(|sent| sent.to.iter())
            .map(|to| parse_mailbox(to))
            .take(limit)
            .collect())
    }
}

/// Stand-in when no email API is configured: every attempt fails and is logged.
pub struct DisabledEmail;

#[async_trait]
impl EmailProvider for DisabledEmail {
    async fn send(&self, _message: &EmailMessage) -> Result<String, DispatchError> {
        Err(DispatchError::Disabled("email"))
    }

    async fn recent_recipients(&self, _limit: usize) -> Result<Vec<Recipient>, DispatchError> {
        Err(DispatchError::Disabled("email"))
    }
}
