// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! BotForge Billing Module
//!
//! Handles payment processor webhooks for subscriptions, entitlements,
//! and the payment ledger.
//!
//! ## Features
//!
//! - **Webhook Verification**: HMAC signatures with replay protection
//! - **Idempotent Ingestion**: Every delivery stored exactly once by event id
//! - **Event Normalization**: Processor spellings mapped to a canonical vocabulary
//! - **Subscription Lifecycle**: Activate, renew, grace, expire, cancel, refund, chargeback
//! - **Entitlements**: Plan-derived, add-on, and promo grants behind one access check
//! - **Payment Ledger**: Per-transaction money records reconciled against events
//! - **Reconciliation**: Drift detection plus operator reprocess and rebuild
//! - **Audit Trail**: Before/after snapshots for every billing mutation

pub mod audit;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod event_store;
pub mod normalize;
pub mod payments;
pub mod pipeline;
pub mod reconcile;
pub mod schema;
pub mod signature;
pub mod subscription;


// Audit
pub use audit::{Actor, AuditAction, AuditEntry, AuditEntryBuilder, AuditLogger};

// Config
pub use config::{ProcessorConfig, DEFAULT_GRACE_PERIOD_DAYS, DEFAULT_TOLERANCE_SECS};

// Entitlement
pub use entitlement::{
    evaluate_access, grants_feature, plan_grants, AccessChecker, Entitlement, EntitlementService,
    EntitlementSource, EntitlementStatus, EntitlementType, NewEntitlement,
};

// Error
pub use error::{BillingError, BillingResult};

// Event store
pub use event_store::{EventStore, PersistOutcome, ProcessingStatus, WebhookEvent};

// Normalize
pub use normalize::{normalize, CanonicalEvent};

// Payments
pub use payments::{NewPayment, Payment, PaymentLedger, PaymentStatus};

// Pipeline
pub use pipeline::{DeliveryOutcome, PayloadFields, WebhookDelivery, WebhookPipeline};

// Reconcile
pub use reconcile::{
    diff_ledger, Discrepancy, DiscrepancyKind, DiscrepancyReport, ReconciliationService,
};

// Schema
pub use schema::{ensure_schema, BILLING_SCHEMA};

// Signature
pub use signature::SignatureVerifier;

// Subscription
pub use subscription::{
    apply, EntitlementEffect, Subscription, SubscriptionService, SubscriptionStatus, Transition,
    TransitionAction,
};

use botforge_shared::PlanCatalog;
use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub access: AccessChecker,
    pub audit: AuditLogger,
    pub entitlements: EntitlementService,
    pub events: EventStore,
    pub ledger: PaymentLedger,
    pub pipeline: WebhookPipeline,
    pub reconciliation: ReconciliationService,
    pub subscriptions: SubscriptionService,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = ProcessorConfig::from_env()?;
        Ok(Self::new(config, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: ProcessorConfig, pool: PgPool) -> Self {
        let catalog = PlanCatalog::standard();
        let pipeline = WebhookPipeline::new(pool.clone(), &config, catalog.clone());

        Self {
            access: AccessChecker::new(pool.clone()),
            audit: AuditLogger::new(pool.clone()),
            entitlements: EntitlementService::new(pool.clone(), catalog),
            events: EventStore::new(pool.clone()),
            ledger: PaymentLedger::new(pool.clone()),
            reconciliation: ReconciliationService::new(pool.clone(), pipeline.clone()),
            subscriptions: SubscriptionService::new(pool, config.grace_period),
            pipeline,
        }
    }
}
