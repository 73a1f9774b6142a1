use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::config::PushRelay;
use crate::model::PushSubscription;

/// What an admin device shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNotice {
    pub title: String,
    pub body: String,
    pub url: String,
    /// Devices collapse notices with the same tag.
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// The subscription no longer exists and should be dropped.
    Gone,
    Failed(String),
}

impl PushOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PushOutcome::Delivered => "delivered",
            PushOutcome::Gone => "gone",
            PushOutcome::Failed(_) => "failed",
        }
    }
}

#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn push(&self, subscription: &PushSubscription, notice: &PushNotice) -> PushOutcome;
}

/// Hands notifications to a Web Push relay that owns VAPID signing and payload encryption.
pub struct HttpPushGateway {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpPushGateway {
    pub fn new(relay: &PushRelay, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: relay.url.clone(),
            token: relay.token.clone(),
        })
    }
}

pub(crate) fn relay_body(subscription: &PushSubscription, notice: &PushNotice) -> serde_json::Value {
    json!({
        "subscription": {
            "endpoint": subscription.endpoint,
            "keys": { "p256dh": subscription.p256dh, "auth": subscription.auth },
        },
        "notification": {
            "title": notice.title,
            "body": notice.body,
            "url": notice.url,
            "tag": notice.tag,
        },
        "ttl": 3600,
    })
}

/// 404 and 410 from a push service mean the subscription is dead.
pub(crate) fn outcome_for_status(code: u16) -> PushOutcome {
    match code {
        200..=299 => PushOutcome::Delivered,
        404 | 410 => PushOutcome::Gone,
        other => PushOutcome::Failed(format!("push relay returned {other}")),
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn push(&self, subscription: &PushSubscription, notice: &PushNotice) -> PushOutcome {
        let mut req = self.client.post(&self.url).json(&relay_body(subscription, notice));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        match req.send().await {
            Ok(resp) => outcome_for_status(resp.status().as_u16()),
            Err(e) => PushOutcome::Failed(e.to_string()),
        }
    }
}

pub struct DisabledPush;

#[async_trait]
impl PushGateway for DisabledPush {
    async fn push(&self, _subscription: &PushSubscription, _notice: &PushNotice) -> PushOutcome {
        PushOutcome::Failed("push relay not configured".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gone_statuses() {
        assert_eq!(outcome_for_status(201), PushOutcome::Delivered);
        assert_eq!(outcome_for_status(410), PushOutcome::Gone);
        assert_eq!(outcome_for_status(404), PushOutcome::Gone);
        assert!(matches!(outcome_for_status(502), PushOutcome::Failed(_)));
    }

    #[test]
    fn relay_body_carries_keys() {
        let sub = PushSubscription {
            endpoint: "https://push.example/x".into(),
            p256dh: "BPk".into(),
            auth: "aut".into(),
            created_at: 0,
        };
        let notice = PushNotice {
            title: "New booking".into(),
            body: "2 guests".into(),
            url: "/admin".into(),
            tag: "r1".into(),
        };
        let body = relay_body(&sub, &notice);
        assert_eq!(body["subscription"]["keys"]["p256dh"], "BPk");
        assert_eq!(body["notification"]["tag"], "r1");
    }
}
