//! Processor webhook configuration

use time::Duration;

use crate::error::{BillingError, BillingResult};

/// Default replay tolerance for webhook timestamps (5 minutes)
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Default grace period after subscription expiry (3 days)
pub const DEFAULT_GRACE_PERIOD_DAYS: i64 = 3;

/// Configuration for the payment processor webhook channel
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Shared HMAC secret for webhook signatures
    pub webhook_secret: String,
    /// Maximum age of a webhook timestamp before it is rejected as a replay
    pub tolerance: Duration,
    /// How long access survives past expiry while payment resolves
    pub grace_period: Duration,
}

impl ProcessorConfig {
    /// Build a config with an explicit secret and default windows
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            tolerance: Duration::seconds(DEFAULT_TOLERANCE_SECS),
            grace_period: Duration::days(DEFAULT_GRACE_PERIOD_DAYS),
        }
    }

    /// Load configuration from environment variables
    ///
    /// `PROCESSOR_WEBHOOK_SECRET` is required; a missing secret is a fatal
    /// startup condition rather than a per-request failure.
    /// `WEBHOOK_TOLERANCE_SECS` and `GRACE_PERIOD_DAYS` are optional
    /// overrides for the default windows.
    pub fn from_env() -> BillingResult<Self> {
        let webhook_secret = std::env::var("PROCESSOR_WEBHOOK_SECRET").map_err(|_| {
            BillingError::Config("PROCESSOR_WEBHOOK_SECRET must be set".to_string())
        })?;

        if webhook_secret.is_empty() {
            return Err(BillingError::Config(
                "PROCESSOR_WEBHOOK_SECRET must not be empty".to_string(),
            ));
        }

        let tolerance_secs = std::env::var("WEBHOOK_TOLERANCE_SECS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(DEFAULT_TOLERANCE_SECS);

        let grace_days = std::env::var("GRACE_PERIOD_DAYS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(DEFAULT_GRACE_PERIOD_DAYS);

        Ok(Self {
            webhook_secret,
            tolerance: Duration::seconds(tolerance_secs),
            grace_period: Duration::days(grace_days),
        })
    }
}
