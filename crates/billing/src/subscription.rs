//! Subscription state machine
//!
//! One subscription per user, mutated exclusively through this module. The
//! transition rules live in a pure core (`apply`) so every state/action
//! pair can be tested without a database; `SubscriptionService` adds the
//! row locking, the upsert and the audit write around it.
//!
//! Entitlement changes are not performed here. A transition reports what
//! should happen to the user's grants as an [`EntitlementEffect`] and the
//! caller routes that through the entitlement engine, keeping the two
//! ledgers decoupled.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};

use botforge_shared::UserId;

use crate::audit::{Actor, AuditAction, AuditEntryBuilder, AuditLogger};
use crate::error::{BillingError, BillingResult};

/// Where a subscription stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionStatus {
    Active,
    Grace,
    Expired,
    Canceled,
    Refunded,
    Chargeback,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Grace => "GRACE",
            Self::Expired => "EXPIRED",
            Self::Canceled => "CANCELED",
            Self::Refunded => "REFUNDED",
            Self::Chargeback => "CHARGEBACK",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subscription row
///
/// `grace_until` is non-null only while status is `Grace`; every other
/// transition clears it.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub user_id: UserId,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub expires_at: OffsetDateTime,
    pub grace_until: Option<OffsetDateTime>,
    pub customer_id: Option<String>,
    pub transaction_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// What a transition wants done to the user's entitlements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntitlementEffect {
    /// Revoke PLAN_INCLUDED grants and re-derive them from the plan
    RebuildFromPlan,
    /// Revoke PLAN_INCLUDED grants; addon and promo grants survive
    RevokePlanIncluded,
    /// Revoke every grant regardless of source
    RevokeAll,
    None,
}

/// An action against one user's subscription
#[derive(Debug, Clone)]
pub enum TransitionAction {
    Activate {
        plan_id: String,
        expires_at: OffsetDateTime,
        customer_id: Option<String>,
        transaction_id: Option<String>,
    },
    Renew {
        new_expires_at: OffsetDateTime,
        transaction_id: Option<String>,
    },
    EnterGrace,
    Expire,
    Refund,
    Chargeback,
    Cancel,
}

impl TransitionAction {
    fn name(&self) -> &'static str {
        match self {
            Self::Activate { .. } => "activate",
            Self::Renew { .. } => "renew",
            Self::EnterGrace => "enter_grace",
            Self::Expire => "expire",
            Self::Refund => "refund",
            Self::Chargeback => "chargeback",
            Self::Cancel => "cancel",
        }
    }
}

/// Outcome of applying an action
#[derive(Debug, Clone)]
pub struct Transition {
    pub next: Subscription,
    pub effect: EntitlementEffect,
    /// Whether the row actually needs writing. An idempotent re-activation
    /// keeps `changed = false` but is still audited.
    pub changed: bool,
    /// Audit action for accepted transitions; `None` when the action's
    /// precondition did not hold and nothing happened.
    pub audit: Option<AuditAction>,
}

fn differs(prior: Option<&Subscription>, next: &Subscription) -> bool {
    match prior {
        None => true,
        Some(p) => {
            p.status != next.status
                || p.plan_id != next.plan_id
                || p.expires_at != next.expires_at
                || p.grace_until != next.grace_until
                || p.customer_id != next.customer_id
                || p.transaction_id != next.transaction_id
        }
    }
}

/// Apply one action to a (possibly absent) subscription
///
/// Pure: reads nothing, writes nothing, answers what the next row and the
/// entitlement side effect should be. Any state/action pair without a rule
/// comes back unchanged with no effect, never as an undefined status.
/// Every action except `Activate` requires an existing row.
pub fn apply(
    user_id: UserId,
    prior: Option<&Subscription>,
    action: &TransitionAction,
    now: OffsetDateTime,
    grace_period: Duration,
) -> BillingResult<Transition> {
    if let TransitionAction::Activate { plan_id, expires_at, customer_id, transaction_id } = action
    {
        let next = Subscription {
            user_id,
            plan_id: plan_id.clone(),
            status: SubscriptionStatus::Active,
            expires_at: *expires_at,
            grace_until: None,
            customer_id: customer_id
                .clone()
                .or_else(|| prior.and_then(|p| p.customer_id.clone())),
            transaction_id: transaction_id
                .clone()
                .or_else(|| prior.and_then(|p| p.transaction_id.clone())),
            created_at: prior.map_or(now, |p| p.created_at),
            updated_at: now,
        };
        return Ok(Transition {
            changed: differs(prior, &next),
            next,
            effect: EntitlementEffect::RebuildFromPlan,
            audit: Some(AuditAction::SubscriptionActivated),
        });
    }

    let prior = prior.ok_or_else(|| {
        BillingError::NotFound(format!("no subscription for user {user_id} to {}", action.name()))
    })?;

    let noop = Transition {
        next: prior.clone(),
        effect: EntitlementEffect::None,
        changed: false,
        audit: None,
    };

    let transition = match action {
        TransitionAction::Activate { .. } => unreachable!("handled above"),

        TransitionAction::Renew { new_expires_at, transaction_id } => {
            let next = Subscription {
                status: SubscriptionStatus::Active,
                expires_at: *new_expires_at,
                grace_until: None,
                transaction_id: transaction_id
                    .clone()
                    .or_else(|| prior.transaction_id.clone()),
                updated_at: now,
                ..prior.clone()
            };
            Transition {
                changed: differs(Some(prior), &next),
                next,
                effect: EntitlementEffect::RebuildFromPlan,
                audit: Some(AuditAction::SubscriptionRenewed),
            }
        }

        TransitionAction::EnterGrace => {
            if prior.status != SubscriptionStatus::Active || prior.expires_at > now {
                noop
            } else {
                let next = Subscription {
                    status: SubscriptionStatus::Grace,
                    grace_until: Some(now + grace_period),
                    updated_at: now,
                    ..prior.clone()
                };
                Transition {
                    changed: true,
                    next,
                    // Grace exists so access continues; grants stay put.
                    effect: EntitlementEffect::None,
                    audit: Some(AuditAction::SubscriptionGrace),
                }
            }
        }

        TransitionAction::Expire => {
            // A Grace row with no grace_until is treated as elapsed so it
            // cannot sit in grace forever.
            let elapsed = prior.grace_until.map_or(true, |g| g <= now);
            if prior.status != SubscriptionStatus::Grace || !elapsed {
                noop
            } else {
                let next = Subscription {
                    status: SubscriptionStatus::Expired,
                    grace_until: None,
                    updated_at: now,
                    ..prior.clone()
                };
                Transition {
                    changed: true,
                    next,
                    // Revocation is the caller's job via the entitlement
                    // engine, not a side effect of expiring.
                    effect: EntitlementEffect::None,
                    audit: Some(AuditAction::SubscriptionExpired),
                }
            }
        }

        TransitionAction::Refund => {
            let next = Subscription {
                status: SubscriptionStatus::Refunded,
                grace_until: None,
                updated_at: now,
                ..prior.clone()
            };
            Transition {
                changed: differs(Some(prior), &next),
                next,
                effect: EntitlementEffect::RevokePlanIncluded,
                audit: Some(AuditAction::SubscriptionRefunded),
            }
        }

        TransitionAction::Chargeback => {
            let next = Subscription {
                status: SubscriptionStatus::Chargeback,
                grace_until: None,
                updated_at: now,
                ..prior.clone()
            };
            Transition {
                changed: differs(Some(prior), &next),
                next,
                effect: EntitlementEffect::RevokeAll,
                audit: Some(AuditAction::SubscriptionChargeback),
            }
        }

        TransitionAction::Cancel => {
            let next = Subscription {
                status: SubscriptionStatus::Canceled,
                grace_until: None,
                updated_at: now,
                ..prior.clone()
            };
            Transition {
                changed: differs(Some(prior), &next),
                next,
                // Access runs until natural expiry; the sweep handles the
                // rest.
                effect: EntitlementEffect::None,
                audit: Some(AuditAction::SubscriptionCanceled),
            }
        }
    };

    Ok(transition)
}

/// Storage and audit wrapper around the transition core
#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    audit: AuditLogger,
    grace_period: Duration,
}

impl SubscriptionService {
    pub fn new(pool: PgPool, grace_period: Duration) -> Self {
        Self { audit: AuditLogger::new(pool.clone()), pool, grace_period }
    }

    /// Run one transition for a user
    ///
    /// Locks the user's row for the duration of the read-modify-write so
    /// two concurrent webhook events for the same user apply in receipt
    /// order instead of clobbering each other. The audit entry is written
    /// after commit, best-effort.
    pub async fn transition(
        &self,
        user_id: UserId,
        action: TransitionAction,
        actor: Actor,
    ) -> BillingResult<Transition> {
        let now = OffsetDateTime::now_utc();

        let mut tx = self.pool.begin().await?;

        let prior: Option<Subscription> = sqlx::query_as(
            "SELECT user_id, plan_id, status, expires_at, grace_until,
                    customer_id, transaction_id, created_at, updated_at
             FROM subscriptions WHERE user_id = $1
             FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let transition = apply(user_id, prior.as_ref(), &action, now, self.grace_period)?;

        if transition.changed {
            sqlx::query(
                r#"
                INSERT INTO subscriptions
                    (user_id, plan_id, status, expires_at, grace_until,
                     customer_id, transaction_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (user_id) DO UPDATE SET
                    plan_id = EXCLUDED.plan_id,
                    status = EXCLUDED.status,
                    expires_at = EXCLUDED.expires_at,
                    grace_until = EXCLUDED.grace_until,
                    customer_id = EXCLUDED.customer_id,
                    transaction_id = EXCLUDED.transaction_id,
                    updated_at = NOW()
                "#,
            )
            .bind(transition.next.user_id)
            .bind(&transition.next.plan_id)
            .bind(transition.next.status)
            .bind(transition.next.expires_at)
            .bind(transition.next.grace_until)
            .bind(&transition.next.customer_id)
            .bind(&transition.next.transaction_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        match transition.audit {
            Some(audit_action) => {
                tracing::info!(
                    user_id = %user_id,
                    action = action.name(),
                    status = %transition.next.status,
                    changed = transition.changed,
                    "Subscription transition applied"
                );

                let before = prior
                    .as_ref()
                    .map(|p| serde_json::to_value(p).unwrap_or(serde_json::Value::Null));
                let after =
                    serde_json::to_value(&transition.next).unwrap_or(serde_json::Value::Null);

                let mut entry = AuditEntryBuilder::new(audit_action)
                    .actor(actor)
                    .entity("subscription", user_id.to_string())
                    .after(after);
                if let Some(before) = before {
                    entry = entry.before(before);
                }
                self.audit.log_best_effort(entry).await;
            }
            None => {
                tracing::info!(
                    user_id = %user_id,
                    action = action.name(),
                    status = %transition.next.status,
                    "Subscription transition skipped, precondition not met"
                );
            }
        }

        Ok(transition)
    }

    pub async fn get(&self, user_id: UserId) -> BillingResult<Option<Subscription>> {
        let sub: Option<Subscription> = sqlx::query_as(
            "SELECT user_id, plan_id, status, expires_at, grace_until,
                    customer_id, transaction_id, created_at, updated_at
             FROM subscriptions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    /// Active subscriptions whose expiry has passed, oldest first
    ///
    /// Sweep input for `enter_grace`.
    pub async fn list_lapsed_active(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let subs: Vec<Subscription> = sqlx::query_as(
            "SELECT user_id, plan_id, status, expires_at, grace_until,
                    customer_id, transaction_id, created_at, updated_at
             FROM subscriptions
             WHERE status = 'ACTIVE' AND expires_at <= $1
             ORDER BY expires_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }

    /// Grace subscriptions whose grace window has elapsed, oldest first
    ///
    /// Sweep input for `expire`.
    pub async fn list_grace_elapsed(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let subs: Vec<Subscription> = sqlx::query_as(
            "SELECT user_id, plan_id, status, expires_at, grace_until,
                    customer_id, transaction_id, created_at, updated_at
             FROM subscriptions
             WHERE status = 'GRACE' AND (grace_until IS NULL OR grace_until <= $1)
             ORDER BY grace_until",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const GRACE: Duration = Duration::days(3);

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    fn sub(status: SubscriptionStatus, expires_at: OffsetDateTime) -> Subscription {
        Subscription {
            user_id: UserId::new(),
            plan_id: "growth".to_string(),
            status,
            expires_at,
            grace_until: None,
            customer_id: Some("cus_123".to_string()),
            transaction_id: Some("txn_123".to_string()),
            created_at: now() - Duration::days(30),
            updated_at: now() - Duration::days(30),
        }
    }

    fn activate(plan: &str, expires_at: OffsetDateTime) -> TransitionAction {
        TransitionAction::Activate {
            plan_id: plan.to_string(),
            expires_at,
            customer_id: Some("cus_123".to_string()),
            transaction_id: Some("txn_123".to_string()),
        }
    }

    #[test]
    fn activate_creates_active_from_nothing() {
        let t = apply(UserId::new(), None, &activate("starter", now() + Duration::days(30)), now(), GRACE)
            .unwrap();
        assert_eq!(t.next.status, SubscriptionStatus::Active);
        assert_eq!(t.next.plan_id, "starter");
        assert!(t.next.grace_until.is_none());
        assert!(t.changed);
        assert_eq!(t.effect, EntitlementEffect::RebuildFromPlan);
        assert_eq!(t.audit, Some(AuditAction::SubscriptionActivated));
    }

    #[test]
    fn reactivate_same_plan_and_expiry_is_noop_write_but_audited() {
        let existing = sub(SubscriptionStatus::Active, now() + Duration::days(10));
        let action = TransitionAction::Activate {
            plan_id: existing.plan_id.clone(),
            expires_at: existing.expires_at,
            customer_id: existing.customer_id.clone(),
            transaction_id: existing.transaction_id.clone(),
        };
        let t = apply(existing.user_id, Some(&existing), &action, now(), GRACE).unwrap();
        assert!(!t.changed);
        assert_eq!(t.audit, Some(AuditAction::SubscriptionActivated));
        assert_eq!(t.effect, EntitlementEffect::RebuildFromPlan);
    }

    #[test]
    fn activate_after_refund_reenters_active() {
        let refunded = sub(SubscriptionStatus::Refunded, now() - Duration::days(5));
        let t = apply(
            refunded.user_id,
            Some(&refunded),
            &activate("agency", now() + Duration::days(30)),
            now(),
            GRACE,
        )
        .unwrap();
        assert_eq!(t.next.status, SubscriptionStatus::Active);
        assert_eq!(t.next.plan_id, "agency");
        assert!(t.changed);
        assert_eq!(t.effect, EntitlementEffect::RebuildFromPlan);
    }

    #[test]
    fn renew_without_subscription_is_not_found() {
        let action = TransitionAction::Renew {
            new_expires_at: now() + Duration::days(30),
            transaction_id: None,
        };
        let err = apply(UserId::new(), None, &action, now(), GRACE).unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[test]
    fn renew_extends_expiry_and_clears_grace() {
        let mut graceful = sub(SubscriptionStatus::Grace, now() - Duration::days(1));
        graceful.grace_until = Some(now() + Duration::days(2));
        let action = TransitionAction::Renew {
            new_expires_at: now() + Duration::days(30),
            transaction_id: Some("txn_456".to_string()),
        };
        let t = apply(graceful.user_id, Some(&graceful), &action, now(), GRACE).unwrap();
        assert_eq!(t.next.status, SubscriptionStatus::Active);
        assert_eq!(t.next.expires_at, now() + Duration::days(30));
        assert!(t.next.grace_until.is_none());
        assert_eq!(t.next.transaction_id.as_deref(), Some("txn_456"));
        assert_eq!(t.effect, EntitlementEffect::RebuildFromPlan);
        assert_eq!(t.audit, Some(AuditAction::SubscriptionRenewed));
    }

    #[test]
    fn enter_grace_requires_lapsed_active() {
        let live = sub(SubscriptionStatus::Active, now() + Duration::days(3));
        let t = apply(live.user_id, Some(&live), &TransitionAction::EnterGrace, now(), GRACE)
            .unwrap();
        assert!(!t.changed);
        assert_eq!(t.next.status, SubscriptionStatus::Active);
        assert_eq!(t.audit, None);

        let lapsed = sub(SubscriptionStatus::Active, now() - Duration::hours(1));
        let t = apply(lapsed.user_id, Some(&lapsed), &TransitionAction::EnterGrace, now(), GRACE)
            .unwrap();
        assert!(t.changed);
        assert_eq!(t.next.status, SubscriptionStatus::Grace);
        assert_eq!(t.next.grace_until, Some(now() + GRACE));
        assert_eq!(t.effect, EntitlementEffect::None);
        assert_eq!(t.audit, Some(AuditAction::SubscriptionGrace));
    }

    #[test]
    fn enter_grace_from_other_states_is_noop() {
        for status in [
            SubscriptionStatus::Grace,
            SubscriptionStatus::Expired,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Refunded,
            SubscriptionStatus::Chargeback,
        ] {
            let existing = sub(status, now() - Duration::days(1));
            let t = apply(
                existing.user_id,
                Some(&existing),
                &TransitionAction::EnterGrace,
                now(),
                GRACE,
            )
            .unwrap();
            assert!(!t.changed, "enter_grace from {status} should not write");
            assert_eq!(t.next.status, status);
            assert_eq!(t.audit, None);
        }
    }

    #[test]
    fn expire_requires_elapsed_grace() {
        let mut fresh_grace = sub(SubscriptionStatus::Grace, now() - Duration::days(1));
        fresh_grace.grace_until = Some(now() + Duration::days(2));
        let t = apply(
            fresh_grace.user_id,
            Some(&fresh_grace),
            &TransitionAction::Expire,
            now(),
            GRACE,
        )
        .unwrap();
        assert!(!t.changed);
        assert_eq!(t.next.status, SubscriptionStatus::Grace);

        let mut done_grace = sub(SubscriptionStatus::Grace, now() - Duration::days(4));
        done_grace.grace_until = Some(now() - Duration::hours(1));
        let t = apply(
            done_grace.user_id,
            Some(&done_grace),
            &TransitionAction::Expire,
            now(),
            GRACE,
        )
        .unwrap();
        assert!(t.changed);
        assert_eq!(t.next.status, SubscriptionStatus::Expired);
        assert!(t.next.grace_until.is_none());
        // Revocation is routed through the sweep, not the transition.
        assert_eq!(t.effect, EntitlementEffect::None);
        assert_eq!(t.audit, Some(AuditAction::SubscriptionExpired));
    }

    #[test]
    fn refund_revokes_plan_included_only() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Grace,
            SubscriptionStatus::Expired,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Chargeback,
        ] {
            let existing = sub(status, now() + Duration::days(10));
            let t = apply(existing.user_id, Some(&existing), &TransitionAction::Refund, now(), GRACE)
                .unwrap();
            assert_eq!(t.next.status, SubscriptionStatus::Refunded, "refund from {status}");
            assert_eq!(t.effect, EntitlementEffect::RevokePlanIncluded);
            assert_eq!(t.audit, Some(AuditAction::SubscriptionRefunded));
        }
    }

    #[test]
    fn chargeback_revokes_everything() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Grace,
            SubscriptionStatus::Refunded,
        ] {
            let existing = sub(status, now() + Duration::days(10));
            let t = apply(
                existing.user_id,
                Some(&existing),
                &TransitionAction::Chargeback,
                now(),
                GRACE,
            )
            .unwrap();
            assert_eq!(t.next.status, SubscriptionStatus::Chargeback);
            assert_eq!(t.effect, EntitlementEffect::RevokeAll);
        }
    }

    #[test]
    fn cancel_leaves_entitlements_alone() {
        let existing = sub(SubscriptionStatus::Active, now() + Duration::days(10));
        let t = apply(existing.user_id, Some(&existing), &TransitionAction::Cancel, now(), GRACE)
            .unwrap();
        assert_eq!(t.next.status, SubscriptionStatus::Canceled);
        assert_eq!(t.effect, EntitlementEffect::None);
        assert_eq!(t.audit, Some(AuditAction::SubscriptionCanceled));
    }

    #[test]
    fn leaving_grace_always_clears_grace_until() {
        let mut graceful = sub(SubscriptionStatus::Grace, now() - Duration::days(1));
        graceful.grace_until = Some(now() + Duration::days(2));

        for action in [
            TransitionAction::Refund,
            TransitionAction::Chargeback,
            TransitionAction::Cancel,
            TransitionAction::Renew { new_expires_at: now() + Duration::days(30), transaction_id: None },
        ] {
            let t = apply(graceful.user_id, Some(&graceful), &action, now(), GRACE).unwrap();
            assert!(
                t.next.grace_until.is_none(),
                "grace_until must clear on {}",
                action.name()
            );
            assert_ne!(t.next.status, SubscriptionStatus::Grace);
        }
    }

    #[test]
    fn grace_row_without_deadline_expires() {
        let stuck = sub(SubscriptionStatus::Grace, now() - Duration::days(10));
        let t = apply(stuck.user_id, Some(&stuck), &TransitionAction::Expire, now(), GRACE)
            .unwrap();
        assert_eq!(t.next.status, SubscriptionStatus::Expired);
    }
}
