//! Idempotent webhook event storage
//!
//! Every verified delivery lands here before anything else happens. The
//! `ON CONFLICT (event_id) DO NOTHING ... RETURNING` insert is the only
//! idempotency guarantee in the pipeline: if the insert returns no row the
//! event was already claimed, and the stored record is returned unchanged.
//! No component may check for duplicates with a separate read, since two
//! concurrent deliveries could both pass an EXISTS check.

use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Lifecycle of a stored event
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessingStatus {
    Pending,
    Processed,
    Error,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processed => "PROCESSED",
            Self::Error => "ERROR",
        }
    }
}

/// A stored webhook delivery
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct WebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub raw_payload: serde_json::Value,
    pub raw_headers: serde_json::Value,
    pub signature: String,
    pub processing_status: ProcessingStatus,
    pub processing_error: Option<String>,
    pub processed_at: Option<OffsetDateTime>,
    pub received_at: OffsetDateTime,
}

/// Result of a persist call
#[derive(Debug, Clone)]
pub struct PersistOutcome {
    pub event: WebhookEvent,
    /// False when the event id was already stored; the returned record is
    /// the original, not the duplicate delivery.
    pub is_new: bool,
}

/// Append-only store for webhook deliveries
#[derive(Clone)]
pub struct EventStore {
    pool: PgPool,
}

impl EventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist a delivery, claiming it atomically
    ///
    /// Returns the stored record plus whether this call created it. On a
    /// duplicate event id the original record is returned and nothing is
    /// written.
    pub async fn persist(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
        headers: &serde_json::Value,
        signature: &str,
    ) -> BillingResult<PersistOutcome> {
        let inserted: Option<WebhookEvent> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (event_id, event_type, raw_payload, raw_headers, signature, processing_status)
            VALUES ($1, $2, $3, $4, $5, 'PENDING')
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id, event_type, raw_payload, raw_headers, signature,
                      processing_status, processing_error, processed_at, received_at
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(payload)
        .bind(headers)
        .bind(signature)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(event_id = %event_id, error = %e, "Failed to claim webhook event");
            BillingError::Database(e)
        })?;

        if let Some(event) = inserted {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Webhook event stored (claimed exclusive processing rights)"
            );
            return Ok(PersistOutcome { event, is_new: true });
        }

        // Lost the claim; hand back whatever the first delivery stored.
        let existing = self.get(event_id).await?.ok_or_else(|| {
            BillingError::NotFound(format!("webhook event {event_id} vanished after conflict"))
        })?;

        tracing::info!(
            event_id = %event_id,
            status = %existing.processing_status.as_str(),
            "Duplicate webhook event, returning stored record"
        );

        Ok(PersistOutcome { event: existing, is_new: false })
    }

    /// Mark an event fully processed
    pub async fn mark_processed(&self, event_id: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE webhook_events
             SET processing_status = 'PROCESSED', processed_at = NOW(), processing_error = NULL
             WHERE event_id = $1",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a processing failure without losing the event
    pub async fn mark_error(&self, event_id: &str, reason: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE webhook_events
             SET processing_status = 'ERROR', processing_error = $2
             WHERE event_id = $1",
        )
        .bind(event_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        tracing::warn!(event_id = %event_id, reason = %reason, "Webhook event marked ERROR");
        Ok(())
    }

    /// Reset an event to PENDING so the pipeline can run it again
    ///
    /// Used only by operator-driven reprocessing. Clears the error and
    /// processed timestamp so the record reads like a fresh arrival.
    pub async fn reset_for_reprocessing(&self, event_id: &str) -> BillingResult<WebhookEvent> {
        let event: Option<WebhookEvent> = sqlx::query_as(
            r#"
            UPDATE webhook_events
            SET processing_status = 'PENDING', processing_error = NULL, processed_at = NULL
            WHERE event_id = $1
            RETURNING event_id, event_type, raw_payload, raw_headers, signature,
                      processing_status, processing_error, processed_at, received_at
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        event.ok_or_else(|| BillingError::NotFound(format!("webhook event {event_id}")))
    }

    pub async fn get(&self, event_id: &str) -> BillingResult<Option<WebhookEvent>> {
        let event: Option<WebhookEvent> = sqlx::query_as(
            "SELECT event_id, event_type, raw_payload, raw_headers, signature,
                    processing_status, processing_error, processed_at, received_at
             FROM webhook_events WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(event)
    }

    /// Most recent deliveries, newest first
    pub async fn recent(&self, limit: i64) -> BillingResult<Vec<WebhookEvent>> {
        let events: Vec<WebhookEvent> = sqlx::query_as(
            "SELECT event_id, event_type, raw_payload, raw_headers, signature,
                    processing_status, processing_error, processed_at, received_at
             FROM webhook_events ORDER BY received_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    /// Event counts per processing status, for the operator summary
    pub async fn count_by_status(&self) -> BillingResult<Vec<(String, i64)>> {
        let counts: Vec<(String, i64)> = sqlx::query_as(
            "SELECT processing_status::TEXT, COUNT(*)
             FROM webhook_events
             GROUP BY processing_status
             ORDER BY processing_status",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(counts)
    }
}
