//! Webhook signature verification
//!
//! The processor signs each delivery with `HMAC-SHA256("{timestamp}.{body}",
//! secret)`, hex-encoded. Verification checks freshness first (replays are
//! rejected regardless of signature validity), then compares MACs in
//! constant time. Nothing is persisted or audited for a delivery that fails
//! here; the caller emits a generic notice and the processor retries.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::config::ProcessorConfig;
use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Verifies webhook authenticity and freshness
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl SignatureVerifier {
    pub fn new(config: &ProcessorConfig) -> Self {
        Self {
            secret: config.webhook_secret.clone(),
            tolerance_secs: config.tolerance.whole_seconds(),
        }
    }

    /// Verify a delivery against the current clock
    pub fn verify(&self, raw_body: &str, signature: &str, timestamp: i64) -> BillingResult<()> {
        self.verify_at(OffsetDateTime::now_utc().unix_timestamp(), raw_body, signature, timestamp)
    }

    /// Verify a delivery against an explicit clock reading
    ///
    /// Freshness is checked before the signature so that a replayed
    /// delivery with a valid signature is still rejected.
    pub fn verify_at(
        &self,
        now: i64,
        raw_body: &str,
        signature: &str,
        timestamp: i64,
    ) -> BillingResult<()> {
        let age_secs = now.saturating_sub(timestamp).saturating_abs();
        if age_secs > self.tolerance_secs {
            return Err(BillingError::StaleTimestamp { age_secs });
        }

        let expected = self.compute(raw_body, timestamp)?;

        // Hex-decode the caller's signature; anything that is not valid hex
        // of the right length cannot match.
        let provided = match hex::decode(signature) {
            Ok(bytes) => bytes,
            Err(_) => return Err(BillingError::InvalidSignature),
        };

        if expected.ct_eq(&provided).into() {
            Ok(())
        } else {
            Err(BillingError::InvalidSignature)
        }
    }

    /// Compute the MAC for a signed payload
    fn compute(&self, raw_body: &str, timestamp: i64) -> BillingResult<Vec<u8>> {
        let signed_payload = format!("{}.{}", timestamp, raw_body);
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            BillingError::InvalidSignature
        })?;
        mac.update(signed_payload.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Hex signature for a payload, as the processor would send it
    ///
    /// Exposed for tests and for local tooling that replays captured
    /// deliveries against a development instance.
    pub fn sign(&self, raw_body: &str, timestamp: i64) -> BillingResult<String> {
        Ok(hex::encode(self.compute(raw_body, timestamp)?))
    }
}
