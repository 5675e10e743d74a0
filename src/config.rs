// config.rs
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Knobs the booking core needs. Kept separate from `AppConfig` so services and
/// tests can build one without touching the environment.
#[derive(Debug, Clone)]
pub struct BookingPolicy {
    /// Unpaid bookings older than this are purged by the cleanup job.
    pub expiry: chrono::Duration,
    pub currency: String,
    /// How long a session's seat lease lives. It must outlast the seat count
    /// plus the insert; a booking whose lease lapsed before the insert is
    /// refused with `ServiceUnavailable` instead of being written.
    pub seat_lock_ttl: Duration,
    /// How long a buyer waits for a busy session lease before giving up with
    /// `ServiceUnavailable`.
    pub seat_lock_wait: Duration,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        BookingPolicy {
            expiry: chrono::Duration::minutes(15),
            currency: "eur".to_string(),
            seat_lock_ttl: Duration::from_secs(10),
            seat_lock_wait: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
    pub admin_email: String,
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub cleanup_interval: Duration,
    pub discrepancy_interval: Duration,
    pub discrepancy_lookback: chrono::Duration,
    pub discrepancy_grace_minutes: i64,
    pub completion_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub database_name: String,
    pub redis_url: Option<String>,
    pub jwt_secret: String,
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub stripe_api_base: String,
    pub gateway_timeout: Duration,
    pub email: Option<EmailConfig>,
    pub policy: BookingPolicy,
    pub schedule: ScheduleConfig,
    pub log_format: LogFormat,
    pub port: u16,
    pub host: String,
}

fn required(key: &str) -> Result<String> {
    env::var(key).map_err(|_| AppError::configuration(format!("{} must be set", key)))
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(key: &str, default: T) -> Result<T> {
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::configuration(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(default),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let email = match (optional("EMAIL_API_URL"), optional("EMAIL_API_KEY")) {
            (Some(api_url), Some(api_key)) => Some(EmailConfig {
                api_url,
                api_key,
                from: optional("EMAIL_FROM").unwrap_or_else(|| "bookings@retreats.local".to_string()),
                admin_email: optional("ADMIN_EMAIL").unwrap_or_else(|| "admin@retreats.local".to_string()),
            }),
            _ => None,
        };

        let log_format = match optional("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        let policy = BookingPolicy {
            expiry: chrono::Duration::minutes(parsed("BOOKING_EXPIRY_MINUTES", 15)?),
            currency: optional("PAYMENT_CURRENCY")
                .unwrap_or_else(|| "eur".to_string())
                .to_lowercase(),
            seat_lock_ttl: Duration::from_secs(parsed("SEAT_LOCK_TTL_SECS", 10)?),
            seat_lock_wait: Duration::from_millis(parsed("SEAT_LOCK_WAIT_MS", 5000)?),
        };

        let schedule = ScheduleConfig {
            cleanup_interval: Duration::from_secs(60 * parsed::<u64>("CLEANUP_INTERVAL_MINUTES", 20)?),
            discrepancy_interval: Duration::from_secs(3600 * parsed::<u64>("DISCREPANCY_INTERVAL_HOURS", 6)?),
            discrepancy_lookback: chrono::Duration::days(parsed("DISCREPANCY_LOOKBACK_DAYS", 5)?),
            discrepancy_grace_minutes: parsed("DISCREPANCY_GRACE_MINUTES", 30)?,
            completion_interval: Duration::from_secs(60 * parsed::<u64>("COMPLETION_INTERVAL_MINUTES", 60)?),
        };

        Ok(AppConfig {
            database_url: required("DATABASE_URL")?,
            database_name: optional("DATABASE_NAME").unwrap_or_else(|| "retreats".to_string()),
            redis_url: optional("REDIS_URL"),
            jwt_secret: required("JWT_SECRET")?,
            stripe_secret_key: required("STRIPE_SECRET_KEY")?,
            stripe_webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            stripe_api_base: optional("STRIPE_API_BASE")
                .unwrap_or_else(|| "https://api.stripe.com".to_string()),
            gateway_timeout: Duration::from_secs(parsed("GATEWAY_TIMEOUT_SECS", 15)?),
            email,
            policy,
            schedule,
            log_format,
            port: parsed("PORT", 3000)?,
            host: optional("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Safe-to-log summary; secrets are reported only as present/absent.
    pub fn get_config_info(&self) -> serde_json::Value {
        serde_json::json!({
            "database_name": self.database_name,
            "redis_locking": self.redis_url.is_some(),
            "stripe_api_base": self.stripe_api_base,
            "stripe_key_set": !self.stripe_secret_key.is_empty(),
            "email_enabled": self.email.is_some(),
            "currency": self.policy.currency,
            "booking_expiry_minutes": self.policy.expiry.num_minutes(),
            "cleanup_interval_secs": self.schedule.cleanup_interval.as_secs(),
            "discrepancy_interval_secs": self.schedule.discrepancy_interval.as_secs(),
            "port": self.port,
            "host": self.host,
        })
    }
}
