//! Payment ledger
//!
//! One row per monetary transaction, keyed by the processor's
//! `transaction_id`. Deliberately not foreign-keyed to `webhook_events`;
//! the two tables correlate by transaction id value only, and that loose
//! seam is exactly what reconciliation inspects for drift.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use botforge_shared::UserId;

use crate::error::BillingResult;

/// Ledger status of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
    Chargeback,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Refunded => "refunded",
            Self::Chargeback => "chargeback",
            Self::Failed => "failed",
        }
    }

    /// Whether this status represents settled money
    pub fn is_paid(&self) -> bool {
        matches!(self, Self::Paid)
    }
}

/// A ledger row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Payment {
    pub transaction_id: String,
    pub user_id: UserId,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub paid_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Fields for recording or rebuilding a payment
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub transaction_id: String,
    pub user_id: UserId,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub paid_at: Option<OffsetDateTime>,
}

/// Storage surface for the payment ledger
#[derive(Clone)]
pub struct PaymentLedger {
    pool: PgPool,
}

impl PaymentLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a transaction, upserting by transaction id
    ///
    /// Re-recording the same transaction overwrites amount, currency,
    /// status and paid_at. Both the live pipeline and the operator rebuild
    /// path come through here, so replays converge on the same row.
    pub async fn record(&self, payment: &NewPayment) -> BillingResult<Payment> {
        let recorded: Payment = sqlx::query_as(
            r#"
            INSERT INTO payments
                (transaction_id, user_id, amount_cents, currency, status, paid_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (transaction_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                amount_cents = EXCLUDED.amount_cents,
                currency = EXCLUDED.currency,
                status = EXCLUDED.status,
                paid_at = EXCLUDED.paid_at
            RETURNING transaction_id, user_id, amount_cents, currency, status, paid_at, created_at
            "#,
        )
        .bind(&payment.transaction_id)
        .bind(payment.user_id)
        .bind(payment.amount_cents)
        .bind(&payment.currency)
        .bind(payment.status)
        .bind(payment.paid_at)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            transaction_id = %recorded.transaction_id,
            user_id = %recorded.user_id,
            status = %recorded.status.as_str(),
            amount_cents = recorded.amount_cents,
            "Payment recorded"
        );

        Ok(recorded)
    }

    /// Move a transaction to a new ledger status
    pub async fn mark_status(
        &self,
        transaction_id: &str,
        status: PaymentStatus,
    ) -> BillingResult<()> {
        sqlx::query("UPDATE payments SET status = $2 WHERE transaction_id = $1")
            .bind(transaction_id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, transaction_id: &str) -> BillingResult<Option<Payment>> {
        let payment: Option<Payment> = sqlx::query_as(
            "SELECT transaction_id, user_id, amount_cents, currency, status, paid_at, created_at
             FROM payments WHERE transaction_id = $1",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    /// Ledger rows created since a point in time, for reconciliation
    pub async fn in_window(&self, since: OffsetDateTime) -> BillingResult<Vec<Payment>> {
        let payments: Vec<Payment> = sqlx::query_as(
            "SELECT transaction_id, user_id, amount_cents, currency, status, paid_at, created_at
             FROM payments WHERE created_at >= $1 ORDER BY created_at",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }
}
