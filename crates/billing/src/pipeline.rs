//! Webhook processing pipeline
//!
//! One delivery runs verify → persist → normalize → dispatch → mark, all
//! synchronously. The trust boundary sits between verify and persist:
//! an unauthenticated delivery is rejected with nothing stored, while any
//! failure after persistence lands in the event's ERROR status and stays
//! retryable through operator reprocessing. Nothing past persist is ever
//! allowed to lose an event.

use serde::Deserialize;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};

use botforge_shared::{PlanCatalog, UserId};

use crate::audit::{Actor, AuditAction, AuditEntryBuilder, AuditLogger};
use crate::config::ProcessorConfig;
use crate::entitlement::{EntitlementService, EntitlementSource};
use crate::error::{BillingError, BillingResult};
use crate::event_store::{EventStore, ProcessingStatus, WebhookEvent};
use crate::normalize::{normalize, CanonicalEvent};
use crate::payments::{NewPayment, PaymentLedger, PaymentStatus};
use crate::signature::SignatureVerifier;
use crate::subscription::{EntitlementEffect, SubscriptionService, Transition, TransitionAction};

/// The envelope every processor delivery wraps its payload in
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookDelivery {
    pub event_id: String,
    /// Processor-specific event type string, normalized during ingestion
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// The payload fields the pipeline knows how to read
///
/// Everything is optional; each handler states which fields it actually
/// requires. Unknown fields pass through untouched in `raw_payload`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PayloadFields {
    pub user_id: Option<UserId>,
    pub customer_id: Option<String>,
    pub email: Option<String>,
    pub plan_id: Option<String>,
    pub transaction_id: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    /// Unix seconds
    pub expires_at: Option<i64>,
}

impl PayloadFields {
    /// Read the known fields out of a stored payload
    pub fn from_payload(payload: &serde_json::Value) -> BillingResult<Self> {
        if payload.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(payload.clone())
            .map_err(|e| BillingError::MalformedPayload(format!("payload fields: {e}")))
    }

    fn expires_at_datetime(&self) -> BillingResult<Option<OffsetDateTime>> {
        self.expires_at
            .map(|ts| {
                OffsetDateTime::from_unix_timestamp(ts).map_err(|_| {
                    BillingError::MalformedPayload(format!("expires_at out of range: {ts}"))
                })
            })
            .transpose()
    }
}

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Stored and fully processed
    Processed { event_id: String },
    /// Event id already stored; the original record stands and nothing
    /// re-ran. ERROR events are retried only through explicit reprocessing.
    Duplicate { event_id: String, status: ProcessingStatus },
    /// Stored, but processing failed; the ERROR row is the retry record
    Failed { event_id: String, reason: String },
}

/// Everything one webhook delivery touches, wired together
#[derive(Clone)]
pub struct WebhookPipeline {
    pool: PgPool,
    verifier: SignatureVerifier,
    store: EventStore,
    subscriptions: SubscriptionService,
    entitlements: EntitlementService,
    ledger: PaymentLedger,
    audit: AuditLogger,
    catalog: PlanCatalog,
}

impl WebhookPipeline {
    pub fn new(pool: PgPool, config: &ProcessorConfig, catalog: PlanCatalog) -> Self {
        Self {
            verifier: SignatureVerifier::new(config),
            store: EventStore::new(pool.clone()),
            subscriptions: SubscriptionService::new(pool.clone(), config.grace_period),
            entitlements: EntitlementService::new(pool.clone(), catalog.clone()),
            ledger: PaymentLedger::new(pool.clone()),
            audit: AuditLogger::new(pool.clone()),
            catalog,
            pool,
        }
    }

    /// Process one inbound delivery end to end
    ///
    /// `signature` and `timestamp` come from the transport layer; the
    /// signed string is `"{timestamp}.{raw_body}"` over the body exactly
    /// as received.
    pub async fn handle_delivery(
        &self,
        raw_body: &str,
        headers: serde_json::Value,
        signature: &str,
        timestamp: i64,
    ) -> BillingResult<DeliveryOutcome> {
        // Reject before anything is stored. A failed signature gets a
        // generic notice only; the payload is not trusted enough to log.
        if let Err(e) = self.verifier.verify(raw_body, signature, timestamp) {
            tracing::warn!(reason = %e, "Rejected webhook delivery");
            return Err(e);
        }

        let delivery: WebhookDelivery = serde_json::from_str(raw_body)
            .map_err(|e| BillingError::MalformedPayload(format!("envelope: {e}")))?;
        if delivery.event_id.trim().is_empty() {
            return Err(BillingError::MalformedPayload("event_id missing".to_string()));
        }

        let canonical = normalize(&delivery.event);

        let outcome = self
            .store
            .persist(
                &delivery.event_id,
                canonical.as_str(),
                &delivery.data,
                &headers,
                signature,
            )
            .await?;

        if !outcome.is_new {
            return Ok(DeliveryOutcome::Duplicate {
                event_id: outcome.event.event_id,
                status: outcome.event.processing_status,
            });
        }

        self.process_stored_event(&outcome.event).await
    }

    /// Run the normalize → dispatch → mark stage for a stored event
    ///
    /// Also the re-entry point for operator reprocessing. A processing
    /// failure is recorded on the event and returned as an outcome, not an
    /// error; the delivery itself succeeded.
    pub async fn process_stored_event(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<DeliveryOutcome> {
        match self.dispatch(event).await {
            Ok(()) => {
                self.store.mark_processed(&event.event_id).await?;
                tracing::info!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    "Webhook event processed"
                );
                Ok(DeliveryOutcome::Processed { event_id: event.event_id.clone() })
            }
            Err(e) => {
                let reason = e.to_string();
                self.store.mark_error(&event.event_id, &reason).await?;
                Ok(DeliveryOutcome::Failed { event_id: event.event_id.clone(), reason })
            }
        }
    }

    /// Route a stored event to its handler by canonical type
    async fn dispatch(&self, event: &WebhookEvent) -> BillingResult<()> {
        let fields = PayloadFields::from_payload(&event.raw_payload)?;

        match normalize(&event.event_type) {
            CanonicalEvent::PaymentConfirmed => {
                self.handle_payment_confirmed(event, &fields).await
            }
            CanonicalEvent::SubscriptionRenewed => {
                self.handle_subscription_renewed(event, &fields).await
            }
            CanonicalEvent::Refund => self.handle_refund(event, &fields).await,
            CanonicalEvent::Chargeback => self.handle_chargeback(event, &fields).await,
            CanonicalEvent::SubscriptionCanceled => self.handle_cancellation(&fields).await,
            CanonicalEvent::Other(raw) => {
                // Fail-open; reconciliation flags any drift this causes.
                tracing::info!(
                    event_id = %event.event_id,
                    event_type = %raw,
                    "No handler for event type, recording as processed"
                );
                Ok(())
            }
        }
    }

    async fn handle_payment_confirmed(
        &self,
        event: &WebhookEvent,
        fields: &PayloadFields,
    ) -> BillingResult<()> {
        let user_id = self.resolve_user(fields).await?;
        let plan_id = fields
            .plan_id
            .clone()
            .ok_or_else(|| BillingError::MalformedPayload("plan_id missing".to_string()))?;
        let transaction_id = fields
            .transaction_id
            .clone()
            .ok_or_else(|| BillingError::MalformedPayload("transaction_id missing".to_string()))?;

        let expires_at = match fields.expires_at_datetime()? {
            Some(ts) => ts,
            None => {
                let plan = self
                    .catalog
                    .get(&plan_id)
                    .ok_or_else(|| BillingError::PlanUnknown(plan_id.clone()))?;
                OffsetDateTime::now_utc() + Duration::days(plan.period_days)
            }
        };

        let payment = self
            .ledger
            .record(&NewPayment {
                transaction_id: transaction_id.clone(),
                user_id,
                amount_cents: fields.amount_cents.unwrap_or(0),
                currency: fields.currency.clone().unwrap_or_else(|| "USD".to_string()),
                status: PaymentStatus::Paid,
                paid_at: Some(event.received_at),
            })
            .await?;
        self.audit
            .log_best_effort(
                AuditEntryBuilder::new(AuditAction::PaymentRecorded)
                    .entity("payment", payment.transaction_id.clone())
                    .after(serde_json::to_value(&payment).unwrap_or(serde_json::Value::Null))
                    .metadata(serde_json::json!({ "event_id": event.event_id })),
            )
            .await;

        let transition = self
            .subscriptions
            .transition(
                user_id,
                TransitionAction::Activate {
                    plan_id,
                    expires_at,
                    customer_id: fields.customer_id.clone(),
                    transaction_id: Some(transaction_id),
                },
                Actor::System,
            )
            .await?;

        self.apply_effect(user_id, &transition).await
    }

    async fn handle_subscription_renewed(
        &self,
        event: &WebhookEvent,
        fields: &PayloadFields,
    ) -> BillingResult<()> {
        let user_id = self.resolve_user(fields).await?;
        let transaction_id = fields
            .transaction_id
            .clone()
            .ok_or_else(|| BillingError::MalformedPayload("transaction_id missing".to_string()))?;

        let new_expires_at = match fields.expires_at_datetime()? {
            Some(ts) => ts,
            None => {
                // No expiry in the payload: extend by the plan period. A
                // renewal without a subscription surfaces as NotFound and
                // stays retryable once the activation arrives.
                let sub = self.subscriptions.get(user_id).await?.ok_or_else(|| {
                    BillingError::NotFound(format!("no subscription for user {user_id} to renew"))
                })?;
                let plan_id = fields.plan_id.as_deref().unwrap_or(&sub.plan_id);
                let plan = self
                    .catalog
                    .get(plan_id)
                    .ok_or_else(|| BillingError::PlanUnknown(plan_id.to_string()))?;
                OffsetDateTime::now_utc() + Duration::days(plan.period_days)
            }
        };

        let payment = self
            .ledger
            .record(&NewPayment {
                transaction_id: transaction_id.clone(),
                user_id,
                amount_cents: fields.amount_cents.unwrap_or(0),
                currency: fields.currency.clone().unwrap_or_else(|| "USD".to_string()),
                status: PaymentStatus::Paid,
                paid_at: Some(event.received_at),
            })
            .await?;
        self.audit
            .log_best_effort(
                AuditEntryBuilder::new(AuditAction::PaymentRecorded)
                    .entity("payment", payment.transaction_id.clone())
                    .after(serde_json::to_value(&payment).unwrap_or(serde_json::Value::Null))
                    .metadata(serde_json::json!({ "event_id": event.event_id })),
            )
            .await;

        let transition = self
            .subscriptions
            .transition(
                user_id,
                TransitionAction::Renew {
                    new_expires_at,
                    transaction_id: Some(transaction_id),
                },
                Actor::System,
            )
            .await?;

        self.apply_effect(user_id, &transition).await
    }

    async fn handle_refund(
        &self,
        event: &WebhookEvent,
        fields: &PayloadFields,
    ) -> BillingResult<()> {
        let user_id = self.resolve_user(fields).await?;

        if let Some(transaction_id) = &fields.transaction_id {
            self.ledger.mark_status(transaction_id, PaymentStatus::Refunded).await?;
        } else {
            tracing::warn!(
                event_id = %event.event_id,
                user_id = %user_id,
                "Refund without transaction_id, ledger row left as is"
            );
        }

        let transition = self
            .subscriptions
            .transition(user_id, TransitionAction::Refund, Actor::System)
            .await?;

        self.apply_effect(user_id, &transition).await
    }

    async fn handle_chargeback(
        &self,
        event: &WebhookEvent,
        fields: &PayloadFields,
    ) -> BillingResult<()> {
        let user_id = self.resolve_user(fields).await?;

        if let Some(transaction_id) = &fields.transaction_id {
            self.ledger.mark_status(transaction_id, PaymentStatus::Chargeback).await?;
        } else {
            tracing::warn!(
                event_id = %event.event_id,
                user_id = %user_id,
                "Chargeback without transaction_id, ledger row left as is"
            );
        }

        let transition = self
            .subscriptions
            .transition(user_id, TransitionAction::Chargeback, Actor::System)
            .await?;

        self.apply_effect(user_id, &transition).await
    }

    async fn handle_cancellation(&self, fields: &PayloadFields) -> BillingResult<()> {
        let user_id = self.resolve_user(fields).await?;
        let transition = self
            .subscriptions
            .transition(user_id, TransitionAction::Cancel, Actor::System)
            .await?;
        self.apply_effect(user_id, &transition).await
    }

    /// Route a transition's entitlement effect through the engine
    async fn apply_effect(&self, user_id: UserId, transition: &Transition) -> BillingResult<()> {
        match transition.effect {
            EntitlementEffect::RebuildFromPlan => {
                self.entitlements
                    .derive_from_plan(
                        user_id,
                        &transition.next.plan_id,
                        transition.next.expires_at,
                    )
                    .await?;
            }
            EntitlementEffect::RevokePlanIncluded => {
                self.entitlements
                    .revoke_entitlements(user_id, Some(EntitlementSource::PlanIncluded))
                    .await?;
            }
            EntitlementEffect::RevokeAll => {
                self.entitlements.revoke_entitlements(user_id, None).await?;
            }
            EntitlementEffect::None => {}
        }
        Ok(())
    }

    /// Find who a payload is about
    ///
    /// Payload `user_id` wins; otherwise the processor's `customer_id` and
    /// then the email are matched against the users table. The rebuild
    /// path shares this.
    pub(crate) async fn resolve_user(&self, fields: &PayloadFields) -> BillingResult<UserId> {
        resolve_user(&self.pool, fields).await
    }
}

pub(crate) async fn resolve_user(
    pool: &PgPool,
    fields: &PayloadFields,
) -> BillingResult<UserId> {
    if let Some(user_id) = fields.user_id {
        return Ok(user_id);
    }

    if let Some(customer_id) = &fields.customer_id {
        let found: Option<(UserId,)> =
            sqlx::query_as("SELECT id FROM users WHERE customer_id = $1")
                .bind(customer_id)
                .fetch_optional(pool)
                .await?;
        if let Some((user_id,)) = found {
            return Ok(user_id);
        }
    }

    if let Some(email) = &fields.email {
        let found: Option<(UserId,)> =
            sqlx::query_as("SELECT id FROM users WHERE LOWER(email) = LOWER($1)")
                .bind(email)
                .fetch_optional(pool)
                .await?;
        if let Some((user_id,)) = found {
            return Ok(user_id);
        }
    }

    Err(BillingError::UnknownUser(format!(
        "no user for customer_id={:?} email={:?}",
        fields.customer_id, fields.email
    )))
}
