//! Billing error types

use thiserror::Error;

/// Result type for billing operations
pub type BillingResult<T> = Result<T, BillingError>;

/// Errors that can occur in the billing pipeline
///
/// The first two variants are rejected before any state exists and carry no
/// payload detail on purpose: an unverified caller gets a generic failure
/// and the processor retries. Everything after persistence is recoverable
/// through event reprocessing.
#[derive(Debug, Error)]
pub enum BillingError {
    /// Webhook signature did not match the computed HMAC
    #[error("invalid webhook signature")]
    InvalidSignature,

    /// Webhook timestamp outside the replay tolerance window
    #[error("webhook timestamp outside tolerance ({age_secs}s old)")]
    StaleTimestamp { age_secs: i64 },

    /// Webhook body could not be parsed into the expected envelope
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    /// No local user could be resolved for a processor customer
    #[error("unknown user: {0}")]
    UnknownUser(String),

    /// An operation referenced an entity that does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Plan id missing from the catalog
    #[error("unknown plan: {0}")]
    PlanUnknown(String),

    /// Required configuration is missing or invalid (fatal at startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON encoding/decoding of payloads or snapshots failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BillingError {
    /// True for failures rejected before the event is persisted
    ///
    /// These are the only errors that are never retryable internally;
    /// the processor's own redelivery is the retry mechanism.
    pub fn is_pre_persistence_rejection(&self) -> bool {
        matches!(
            self,
            BillingError::InvalidSignature | BillingError::StaleTimestamp { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_and_timestamp_failures_are_pre_persistence() {
        assert!(BillingError::InvalidSignature.is_pre_persistence_rejection());
        assert!(BillingError::StaleTimestamp { age_secs: 301 }.is_pre_persistence_rejection());
        assert!(!BillingError::NotFound("sub".into()).is_pre_persistence_rejection());
        assert!(!BillingError::MalformedPayload("bad json".into()).is_pre_persistence_rejection());
    }

    #[test]
    fn error_messages_carry_context() {
        let err = BillingError::StaleTimestamp { age_secs: 420 };
        assert!(err.to_string().contains("420"));

        let err = BillingError::PlanUnknown("enterprise".into());
        assert!(err.to_string().contains("enterprise"));
    }
}
