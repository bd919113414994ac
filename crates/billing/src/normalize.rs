//! Event type normalization
//!
//! The payment processor has renamed its webhook event types more than once,
//! so the live vocabulary carries several historical spellings for the same
//! concept. Everything downstream of ingestion works on the canonical
//! vocabulary only; this module is the single place raw spellings appear.

use std::fmt;

/// Internal, processor-agnostic event vocabulary
///
/// Unknown raw types pass through as `Other` rather than failing closed, so
/// a new processor event type never blocks ingestion. Drift caused by an
/// unhandled `Other` shows up in reconciliation instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalEvent {
    PaymentConfirmed,
    SubscriptionRenewed,
    Refund,
    Chargeback,
    SubscriptionCanceled,
    Other(String),
}

impl CanonicalEvent {
    /// Canonical string as stored in `webhook_events.event_type`
    pub fn as_str(&self) -> &str {
        match self {
            Self::PaymentConfirmed => "PAYMENT_CONFIRMED",
            Self::SubscriptionRenewed => "SUBSCRIPTION_RENEWED",
            Self::Refund => "REFUND",
            Self::Chargeback => "CHARGEBACK",
            Self::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            Self::Other(raw) => raw,
        }
    }

    /// Whether this type has pipeline semantics attached
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl fmt::Display for CanonicalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a raw processor event type onto the canonical vocabulary
///
/// Case-insensitive. The alias groups cover every spelling the processor
/// has used; anything else upper-cases and passes through. Canonical
/// spellings map to themselves, since reprocessing feeds stored canonical
/// types back through here.
pub fn normalize(external: &str) -> CanonicalEvent {
    let raw = external.trim();
    match raw.to_ascii_lowercase().as_str() {
        "order_approved" | "order_paid" | "purchase" | "purchase_approved"
        | "payment_confirmed" => CanonicalEvent::PaymentConfirmed,
        "subscription_renewed" | "renewal" | "recurring_payment" => {
            CanonicalEvent::SubscriptionRenewed
        }
        "refund" | "order_refunded" => CanonicalEvent::Refund,
        "chargeback" | "dispute_opened" => CanonicalEvent::Chargeback,
        "subscription_canceled" | "subscription_cancelled" | "cancellation" => {
            CanonicalEvent::SubscriptionCanceled
        }
        _ => CanonicalEvent::Other(raw.to_ascii_uppercase()),
    }
}
