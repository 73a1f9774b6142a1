use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::policy::{PolicyConfig, ServiceWindow};

/// Identity used in outgoing emails and push notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restaurant {
    pub name: String,
    pub site_url: String,
    /// Address receiving staff notifications.
    pub staff_email: String,
    /// `From:` header of outgoing mail.
    pub sender: String,
}

impl Default for Restaurant {
    fn default() -> Self {
        Self {
            name: "Tavola".into(),
            site_url: "http://localhost:3000".into(),
            staff_email: "staff@localhost".into(),
            sender: "Tavola <bookings@localhost>".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailApi {
    pub base_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRelay {
    pub url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutApi {
    pub base_url: String,
    pub secret_key: String,
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: String,
    pub admin_password: String,
    pub guest_password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    /// Upper bound on any single call to the email, push or payment API.
    pub http_timeout: Duration,
    pub restaurant: Restaurant,
    /// Unset disables outgoing email; attempts are logged as failed.
    pub email: Option<EmailApi>,
    pub push: Option<PushRelay>,
    pub checkout: Option<CheckoutApi>,
    pub policy: PolicyConfig,
}

#[derive(Debug)]
pub struct ConfigError {
    pub key: &'static str,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {}: {}", self.key, self.message)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup so tests don't touch the process env.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { get: &get };
        let defaults = PolicyConfig::default();
        let restaurant_defaults = Restaurant::default();

        let policy = PolicyConfig {
            closed_weekdays: env.list("TAVOLA_CLOSED_WEEKDAYS")?.unwrap_or(defaults.closed_weekdays),
            lunch: env.parse("TAVOLA_LUNCH")?.unwrap_or(defaults.lunch),
            dinner: env.parse("TAVOLA_DINNER")?.unwrap_or(defaults.dinner),
            request_windows: env.list::<ServiceWindow>("TAVOLA_REQUEST_WINDOWS")?
                .unwrap_or(defaults.request_windows),
            large_party: env.parse("TAVOLA_LARGE_PARTY")?.unwrap_or(defaults.large_party),
            max_party: env.parse("TAVOLA_MAX_PARTY")?.unwrap_or(defaults.max_party),
            max_advance_days: env.parse("TAVOLA_MAX_ADVANCE_DAYS")?.unwrap_or(defaults.max_advance_days),
            slot_step_minutes: env.parse("TAVOLA_SLOT_STEP_MINUTES")?.unwrap_or(defaults.slot_step_minutes),
        };
        if policy.slot_step_minutes == 0 {
            return Err(ConfigError {
                key: "TAVOLA_SLOT_STEP_MINUTES",
                message: "must be at least 1".into(),
            });
        }
        if policy.lunch.last >= policy.dinner.first {
            return Err(ConfigError {
                key: "TAVOLA_LUNCH",
                message: format!("lunch {} overlaps dinner {}", policy.lunch, policy.dinner),
            });
        }

        let restaurant = Restaurant {
            name: env.string("TAVOLA_RESTAURANT_NAME").unwrap_or(restaurant_defaults.name),
            site_url: env.string("TAVOLA_SITE_URL").unwrap_or(restaurant_defaults.site_url),
            staff_email: env.string("TAVOLA_STAFF_EMAIL").unwrap_or(restaurant_defaults.staff_email),
            sender: env.string("TAVOLA_EMAIL_FROM").unwrap_or(restaurant_defaults.sender),
        };

        let email = env.string("TAVOLA_EMAIL_API_KEY").map(|api_key| EmailApi {
            base_url: env
                .string("TAVOLA_EMAIL_API_URL")
                .unwrap_or_else(|| "https://api.resend.com".into()),
            api_key,
        });

        let push = env.string("TAVOLA_PUSH_RELAY_URL").map(|url| PushRelay {
            url,
            token: env.string("TAVOLA_PUSH_RELAY_TOKEN"),
        });

        let checkout = env.string("TAVOLA_CHECKOUT_SECRET_KEY").map(|secret_key| CheckoutApi {
            base_url: env
                .string("TAVOLA_CHECKOUT_API_URL")
                .unwrap_or_else(|| "https://api.stripe.com".into()),
            secret_key,
            currency: env.string("TAVOLA_CURRENCY").unwrap_or_else(|| "eur".into()),
            success_url: env
                .string("TAVOLA_CHECKOUT_SUCCESS_URL")
                .unwrap_or_else(|| format!("{}/checkout/success", restaurant.site_url)),
            cancel_url: env
                .string("TAVOLA_CHECKOUT_CANCEL_URL")
                .unwrap_or_else(|| format!("{}/checkout/cancel", restaurant.site_url)),
        });

        let http_timeout_ms: u64 = env.parse("TAVOLA_HTTP_TIMEOUT_MS")?.unwrap_or(10_000);
        if http_timeout_ms == 0 {
            return Err(ConfigError {
                key: "TAVOLA_HTTP_TIMEOUT_MS",
                message: "must be at least 1".into(),
            });
        }

        let tls_cert = env.string("TAVOLA_TLS_CERT");
        let tls_key = env.string("TAVOLA_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError {
                key: "TAVOLA_TLS_CERT",
                message: "both TAVOLA_TLS_CERT and TAVOLA_TLS_KEY must be set, or neither".into(),
            });
        }

        Ok(Self {
            bind: env.string("TAVOLA_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: env.parse("TAVOLA_PORT")?.unwrap_or(5433),
            data_dir: env.string("TAVOLA_DATA_DIR").unwrap_or_else(|| "./data".into()),
            admin_password: env.string("TAVOLA_ADMIN_PASSWORD").unwrap_or_else(|| "admin".into()),
            guest_password: env.string("TAVOLA_GUEST_PASSWORD").unwrap_or_else(|| "guest".into()),
            max_connections: env.parse("TAVOLA_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: env.parse("TAVOLA_COMPACT_THRESHOLD")?.unwrap_or(1000),
            tls_cert,
            tls_key,
            metrics_port: env.parse("TAVOLA_METRICS_PORT")?,
            http_timeout: Duration::from_millis(http_timeout_ms),
            restaurant,
            email,
            push,
            checkout,
            policy,
        })
    }

    pub fn log_summary(&self) {
        info!("  data_dir: {}", self.data_dir);
        info!("  max_connections: {}", self.max_connections);
        info!("  tls: {}", if self.tls_cert.is_some() { "enabled" } else { "disabled" });
        info!("  email: {}", self.email.as_ref().map_or("disabled", |e| e.base_url.as_str()));
        info!("  push relay: {}", self.push.as_ref().map_or("disabled", |p| p.url.as_str()));
        info!("  checkout: {}", self.checkout.as_ref().map_or("disabled", |c| c.base_url.as_str()));
        info!("  http timeout: {} ms", self.http_timeout.as_millis());
        info!(
            "  services: lunch {} dinner {}, closed {:?}",
            self.policy.lunch, self.policy.dinner, self.policy.closed_weekdays
        );
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    get: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Non-empty trimmed value.
    fn string(&self, key: &str) -> Option<String> {
        (self.get)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T::Err: Display,
    {
        self.string(key)
            .map(|v| {
                v.parse().map_err(|e: T::Err| ConfigError {
                    key,
                    message: format!("{v:?}: {e}"),
                })
            })
            .transpose()
    }

    /// Comma-separated list. An explicitly empty value yields an empty list.
    fn list<T: FromStr>(&self, key: &'static str) -> Result<Option<Vec<T>>, ConfigError>
    where
        T::Err: Display,
    {
        let Some(raw) = (self.get)(key) else {
            return Ok(None);
        };
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|item| {
                item.parse().map_err(|e: T::Err| ConfigError {
                    key,
                    message: format!("{item:?}: {e}"),
                })
            })
            .collect::<Result<Vec<T>, _>>()
            .map(Some)
    }
}
