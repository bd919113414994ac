//! Append-only audit trail
//!
//! Every state transition, entitlement change, payment write and
//! reconciliation run records an entry here with before/after snapshots.
//! The table answers "why is this user in this state?" without replaying
//! webhook payloads. There are no UPDATE or DELETE statements against it
//! anywhere in the codebase.
//!
//! Audit writes are best-effort for state-changing callers: a failed insert
//! is logged and swallowed, never allowed to roll back the transition it
//! describes.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use botforge_shared::UserId;

use crate::error::BillingResult;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    // Subscription lifecycle
    SubscriptionActivated,
    SubscriptionRenewed,
    SubscriptionGrace,
    SubscriptionExpired,
    SubscriptionCanceled,
    SubscriptionRefunded,
    SubscriptionChargeback,

    // Entitlement ledger
    EntitlementsRebuilt,
    EntitlementGranted,
    EntitlementsRevoked,
    EntitlementsExpired,

    // Payments
    PaymentRecorded,

    // Operator actions
    EventReprocessed,
    PaymentRebuilt,

    // Reconciliation
    ReconciliationRun,
    ReconciliationDiscrepancy,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditAction::SubscriptionActivated => "SUBSCRIPTION_ACTIVATED",
            AuditAction::SubscriptionRenewed => "SUBSCRIPTION_RENEWED",
            AuditAction::SubscriptionGrace => "SUBSCRIPTION_GRACE",
            AuditAction::SubscriptionExpired => "SUBSCRIPTION_EXPIRED",
            AuditAction::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            AuditAction::SubscriptionRefunded => "SUBSCRIPTION_REFUNDED",
            AuditAction::SubscriptionChargeback => "SUBSCRIPTION_CHARGEBACK",
            AuditAction::EntitlementsRebuilt => "ENTITLEMENTS_REBUILT",
            AuditAction::EntitlementGranted => "ENTITLEMENT_GRANTED",
            AuditAction::EntitlementsRevoked => "ENTITLEMENTS_REVOKED",
            AuditAction::EntitlementsExpired => "ENTITLEMENTS_EXPIRED",
            AuditAction::PaymentRecorded => "PAYMENT_RECORDED",
            AuditAction::EventReprocessed => "EVENT_REPROCESSED",
            AuditAction::PaymentRebuilt => "PAYMENT_REBUILT",
            AuditAction::ReconciliationRun => "RECONCILIATION_RUN",
            AuditAction::ReconciliationDiscrepancy => "RECONCILIATION_DISCREPANCY",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// End user through a bot or the storefront
    User(UserId),
    /// Operator through the admin surface
    Admin(UserId),
    /// Pipeline, worker jobs, reconciliation
    System,
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user:{}", id),
            Actor::Admin(id) => write!(f, "admin:{}", id),
            Actor::System => write!(f, "system"),
        }
    }
}

/// A stored audit record
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: Uuid,
    pub action: String,
    pub actor: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub before_state: Option<serde_json::Value>,
    pub after_state: Option<serde_json::Value>,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// Builder for audit entries
pub struct AuditEntryBuilder {
    action: AuditAction,
    actor: Actor,
    entity_type: Option<String>,
    entity_id: Option<String>,
    before_state: Option<serde_json::Value>,
    after_state: Option<serde_json::Value>,
    metadata: serde_json::Value,
}

impl AuditEntryBuilder {
    pub fn new(action: AuditAction) -> Self {
        Self {
            action,
            actor: Actor::System,
            entity_type: None,
            entity_id: None,
            before_state: None,
            after_state: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    /// The record this entry is about, as free-form type + id strings
    pub fn entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Snapshot of the entity before the change
    pub fn before(mut self, state: serde_json::Value) -> Self {
        self.before_state = Some(state);
        self
    }

    /// Snapshot of the entity after the change
    pub fn after(mut self, state: serde_json::Value) -> Self {
        self.after_state = Some(state);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Service for writing and querying the audit trail
#[derive(Clone)]
pub struct AuditLogger {
    pool: PgPool,
}

impl AuditLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append an entry, returning its id
    pub async fn log(&self, builder: AuditEntryBuilder) -> BillingResult<Uuid> {
        let id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO audit_log
                (action, actor, entity_type, entity_id, before_state, after_state, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(builder.action.to_string())
        .bind(builder.actor.to_string())
        .bind(&builder.entity_type)
        .bind(&builder.entity_id)
        .bind(&builder.before_state)
        .bind(&builder.after_state)
        .bind(&builder.metadata)
        .fetch_one(&self.pool)
        .await?;

        Ok(id.0)
    }

    /// Append an entry without letting a failure reach the caller
    ///
    /// State-changing paths use this: the transition has already been
    /// committed, and audit is observability, not a correctness dependency.
    pub async fn log_best_effort(&self, builder: AuditEntryBuilder) {
        let action = builder.action;
        if let Err(e) = self.log(builder).await {
            tracing::warn!(action = %action, error = %e, "Audit write failed, continuing");
        }
    }

    /// Entries about one entity, newest first
    pub async fn recent_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<AuditEntry>> {
        let entries: Vec<AuditEntry> = sqlx::query_as(
            r#"
            SELECT id, action, actor, entity_type, entity_id,
                   before_state, after_state, metadata, created_at
            FROM audit_log
            WHERE entity_type = $1 AND entity_id = $2
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    /// Entries of one action type, newest first
    pub async fn recent_by_action(
        &self,
        action: AuditAction,
        limit: i64,
    ) -> BillingResult<Vec<AuditEntry>> {
        let entries: Vec<AuditEntry> = sqlx::query_as(
            r#"
            SELECT id, action, actor, entity_type, entity_id,
                   before_state, after_state, metadata, created_at
            FROM audit_log
            WHERE action = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(action.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_display_uses_stored_vocabulary() {
        assert_eq!(AuditAction::SubscriptionActivated.to_string(), "SUBSCRIPTION_ACTIVATED");
        assert_eq!(AuditAction::EntitlementsRevoked.to_string(), "ENTITLEMENTS_REVOKED");
        assert_eq!(AuditAction::PaymentRebuilt.to_string(), "PAYMENT_REBUILT");
        assert_eq!(
            AuditAction::ReconciliationDiscrepancy.to_string(),
            "RECONCILIATION_DISCREPANCY"
        );
    }

    #[test]
    fn actor_display_formats() {
        let id = UserId::new();
        assert_eq!(Actor::User(id).to_string(), format!("user:{}", id.0));
        assert_eq!(Actor::Admin(id).to_string(), format!("admin:{}", id.0));
        assert_eq!(Actor::System.to_string(), "system");
    }

    #[test]
    fn builder_accumulates_fields() {
        let builder = AuditEntryBuilder::new(AuditAction::SubscriptionRefunded)
            .entity("subscription", "a-user-id")
            .before(serde_json::json!({"status": "ACTIVE"}))
            .after(serde_json::json!({"status": "REFUNDED"}))
            .metadata(serde_json::json!({"event_id": "evt-9"}));

        assert_eq!(builder.action, AuditAction::SubscriptionRefunded);
        assert_eq!(builder.entity_type.as_deref(), Some("subscription"));
        assert_eq!(builder.entity_id.as_deref(), Some("a-user-id"));
        assert!(builder.before_state.is_some());
        assert!(builder.after_state.is_some());
        assert_eq!(builder.metadata["event_id"], "evt-9");
        assert_eq!(builder.actor, Actor::System);
    }
}
