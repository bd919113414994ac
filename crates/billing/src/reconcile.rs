//! Reconciliation engine
//!
//! Compares the webhook event stream against the payment ledger and
//! reports where they disagree. Detection is strictly read-only; the only
//! ways it ever changes state are the two operator actions, each of which
//! is audited on its own.
//!
//! ## Design Principles
//!
//! 1. **Report, never repair**: findings are returned and audited, not
//!    auto-corrected
//! 2. **Keyed on transaction id**: events and payments correlate by value
//!    match only, there is no foreign key between them
//! 3. **Explanatory**: every discrepancy carries enough context to debug

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};

use botforge_shared::UserId;

use crate::audit::{Actor, AuditAction, AuditEntryBuilder, AuditLogger};
use crate::error::{BillingError, BillingResult};
use crate::event_store::EventStore;
use crate::payments::{NewPayment, Payment, PaymentLedger, PaymentStatus};
use crate::pipeline::{resolve_user, DeliveryOutcome, PayloadFields, WebhookPipeline};

/// How the event stream and the ledger disagree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// A confirmed event has no ledger row: the payment write failed
    EventWithoutPayment,
    /// A ledger row has no processed event: out-of-band or manual payment
    PaymentWithoutEvent,
    /// Both sides exist but disagree on whether the money settled
    StatusMismatch,
}

impl std::fmt::Display for DiscrepancyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscrepancyKind::EventWithoutPayment => write!(f, "event_without_payment"),
            DiscrepancyKind::PaymentWithoutEvent => write!(f, "payment_without_event"),
            DiscrepancyKind::StatusMismatch => write!(f, "status_mismatch"),
        }
    }
}

/// One finding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discrepancy {
    pub kind: DiscrepancyKind,
    pub transaction_id: String,
    pub event_id: Option<String>,
    pub user_id: Option<UserId>,
    /// Human-readable description of what disagrees
    pub detail: String,
}

/// Result of one detection run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscrepancyReport {
    pub window_days: i64,
    pub checked_events: usize,
    pub checked_payments: usize,
    pub discrepancies: Vec<Discrepancy>,
    pub total_discrepancies: usize,
    pub ran_at: OffsetDateTime,
}

impl DiscrepancyReport {
    pub fn is_clean(&self) -> bool {
        self.total_discrepancies == 0
    }
}

/// A processed money event, projected down to its correlation key
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventTxn {
    pub event_id: String,
    pub transaction_id: String,
}

/// Diff the two sides of the money seam
///
/// Pure; takes what detection loaded and answers which transactions
/// disagree. Confirmed events expect a settled (`paid`) ledger row.
pub fn diff_ledger(events: &[EventTxn], payments: &[Payment]) -> Vec<Discrepancy> {
    let ledger_by_txn: HashMap<&str, &Payment> =
        payments.iter().map(|p| (p.transaction_id.as_str(), p)).collect();
    let event_txns: HashSet<&str> =
        events.iter().map(|e| e.transaction_id.as_str()).collect();

    let mut discrepancies = Vec::new();

    for event in events {
        match ledger_by_txn.get(event.transaction_id.as_str()) {
            None => discrepancies.push(Discrepancy {
                kind: DiscrepancyKind::EventWithoutPayment,
                transaction_id: event.transaction_id.clone(),
                event_id: Some(event.event_id.clone()),
                user_id: None,
                detail: format!(
                    "processed event {} has no payment row for transaction {}",
                    event.event_id, event.transaction_id
                ),
            }),
            Some(payment) if !payment.status.is_paid() => discrepancies.push(Discrepancy {
                kind: DiscrepancyKind::StatusMismatch,
                transaction_id: event.transaction_id.clone(),
                event_id: Some(event.event_id.clone()),
                user_id: Some(payment.user_id),
                detail: format!(
                    "event {} confirms payment but ledger status is {}",
                    event.event_id,
                    payment.status.as_str()
                ),
            }),
            Some(_) => {}
        }
    }

    for payment in payments {
        if !event_txns.contains(payment.transaction_id.as_str()) {
            discrepancies.push(Discrepancy {
                kind: DiscrepancyKind::PaymentWithoutEvent,
                transaction_id: payment.transaction_id.clone(),
                event_id: None,
                user_id: Some(payment.user_id),
                detail: format!(
                    "payment {} ({}) has no processed confirmation event",
                    payment.transaction_id,
                    payment.status.as_str()
                ),
            });
        }
    }

    discrepancies
}

/// Detection plus the two operator repair actions
#[derive(Clone)]
pub struct ReconciliationService {
    pool: PgPool,
    events: EventStore,
    ledger: PaymentLedger,
    audit: AuditLogger,
    pipeline: WebhookPipeline,
}

impl ReconciliationService {
    pub fn new(pool: PgPool, pipeline: WebhookPipeline) -> Self {
        Self {
            events: EventStore::new(pool.clone()),
            ledger: PaymentLedger::new(pool.clone()),
            audit: AuditLogger::new(pool.clone()),
            pool,
            pipeline,
        }
    }

    /// Compare confirmed events against the ledger inside a window
    ///
    /// Never mutates billing state. Always audits the run; audits a
    /// second entry when anything was found.
    pub async fn detect_discrepancies(
        &self,
        window_days: i64,
    ) -> BillingResult<DiscrepancyReport> {
        let ran_at = OffsetDateTime::now_utc();
        let since = ran_at - Duration::days(window_days);

        let events: Vec<EventTxn> = sqlx::query_as(
            r#"
            SELECT event_id, raw_payload->>'transaction_id' AS transaction_id
            FROM webhook_events
            WHERE processing_status = 'PROCESSED'
              AND event_type IN ('PAYMENT_CONFIRMED', 'SUBSCRIPTION_RENEWED')
              AND received_at >= $1
              AND raw_payload->>'transaction_id' IS NOT NULL
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let payments = self.ledger.in_window(since).await?;

        let discrepancies = diff_ledger(&events, &payments);
        let report = DiscrepancyReport {
            window_days,
            checked_events: events.len(),
            checked_payments: payments.len(),
            total_discrepancies: discrepancies.len(),
            discrepancies,
            ran_at,
        };

        if report.is_clean() {
            tracing::info!(
                window_days = window_days,
                checked_events = report.checked_events,
                checked_payments = report.checked_payments,
                "Reconciliation clean"
            );
        } else {
            tracing::warn!(
                window_days = window_days,
                checked_events = report.checked_events,
                checked_payments = report.checked_payments,
                discrepancies = report.total_discrepancies,
                "Reconciliation found discrepancies"
            );
        }

        self.audit
            .log_best_effort(
                AuditEntryBuilder::new(AuditAction::ReconciliationRun).metadata(
                    serde_json::json!({
                        "window_days": window_days,
                        "checked_events": report.checked_events,
                        "checked_payments": report.checked_payments,
                        "total_discrepancies": report.total_discrepancies,
                    }),
                ),
            )
            .await;

        if !report.is_clean() {
            let findings =
                serde_json::to_value(&report.discrepancies).unwrap_or(serde_json::Value::Null);
            self.audit
                .log_best_effort(
                    AuditEntryBuilder::new(AuditAction::ReconciliationDiscrepancy)
                        .metadata(serde_json::json!({
                            "window_days": window_days,
                            "discrepancies": findings,
                        })),
                )
                .await;
        }

        Ok(report)
    }

    /// Reset an event to PENDING and run it through the pipeline again
    ///
    /// The only retry mechanism for a failed or miscomputed event.
    pub async fn reprocess_event(
        &self,
        event_id: &str,
        actor: Actor,
    ) -> BillingResult<DeliveryOutcome> {
        let event = self.events.reset_for_reprocessing(event_id).await?;

        tracing::info!(
            event_id = %event_id,
            event_type = %event.event_type,
            actor = %actor,
            "Reprocessing webhook event"
        );

        let outcome = self.pipeline.process_stored_event(&event).await?;

        self.audit
            .log_best_effort(
                AuditEntryBuilder::new(AuditAction::EventReprocessed)
                    .actor(actor)
                    .entity("webhook_event", event_id.to_string())
                    .metadata(serde_json::json!({
                        "event_type": event.event_type,
                        "outcome": match &outcome {
                            DeliveryOutcome::Processed { .. } => "processed".to_string(),
                            DeliveryOutcome::Failed { reason, .. } => format!("failed: {reason}"),
                            DeliveryOutcome::Duplicate { .. } => "duplicate".to_string(),
                        },
                    })),
            )
            .await;

        Ok(outcome)
    }

    /// Rebuild a missing or wrong ledger row from a stored event payload
    ///
    /// Upserts by transaction id, so repeated calls converge. The owner is
    /// resolved like the live pipeline does: payload user id, then
    /// processor customer id, then email; `UnknownUser` is surfaced to the
    /// operator, never skipped.
    pub async fn rebuild_payment_from_event(
        &self,
        event_id: &str,
        actor: Actor,
    ) -> BillingResult<Payment> {
        let event = self
            .events
            .get(event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {event_id}")))?;

        let fields = PayloadFields::from_payload(&event.raw_payload)?;
        let transaction_id = fields
            .transaction_id
            .clone()
            .ok_or_else(|| BillingError::MalformedPayload("transaction_id missing".to_string()))?;
        let user_id = resolve_user(&self.pool, &fields).await?;

        let before = self.ledger.get(&transaction_id).await?;
        let before_snapshot = before
            .as_ref()
            .map(|p| serde_json::to_value(p).unwrap_or(serde_json::Value::Null));

        let rebuilt = self
            .ledger
            .record(&NewPayment {
                transaction_id,
                user_id,
                amount_cents: fields.amount_cents.unwrap_or(0),
                currency: fields.currency.clone().unwrap_or_else(|| "USD".to_string()),
                status: PaymentStatus::Paid,
                paid_at: Some(event.received_at),
            })
            .await?;

        let mut entry = AuditEntryBuilder::new(AuditAction::PaymentRebuilt)
            .actor(actor)
            .entity("payment", rebuilt.transaction_id.clone())
            .after(serde_json::to_value(&rebuilt).unwrap_or(serde_json::Value::Null))
            .metadata(serde_json::json!({ "event_id": event_id }));
        if let Some(before) = before_snapshot {
            entry = entry.before(before);
        }
        self.audit.log_best_effort(entry).await;

        Ok(rebuilt)
    }
}
