//! Entitlement engine
//!
//! Answers the question "what can this user access right now?" with a
//! ledger of additive, independently revocable grants rather than a single
//! mutable plan flag. Plan changes revoke-then-recreate the PLAN_INCLUDED
//! set instead of diffing, so an upgrade, a downgrade and a re-activation
//! after lapse all run the same code and can never leave stale grants.
//!
//! The grant derivation and the access rule are pure functions; the
//! services wrap them with storage and audit writes.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use botforge_shared::{BotKind, Feature, PlanCatalog, PlanDefinition, UserId};

use crate::audit::{AuditAction, AuditEntryBuilder, AuditLogger};
use crate::error::{BillingError, BillingResult};
use crate::subscription::{Subscription, SubscriptionStatus};

/// What kind of thing a grant unlocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntitlementType {
    BotAccess,
    MarketplaceSlot,
    PromoAccess,
}

/// Where a grant came from
///
/// Revocation is scoped by source: refunds take back PLAN_INCLUDED only,
/// chargebacks take everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntitlementSource {
    PlanIncluded,
    AddonPurchased,
    Promo,
}

impl EntitlementSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlanIncluded => "PLAN_INCLUDED",
            Self::AddonPurchased => "ADDON_PURCHASED",
            Self::Promo => "PROMO",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum EntitlementStatus {
    Active,
    Revoked,
}

/// A single feature grant
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Entitlement {
    pub id: Uuid,
    pub user_id: UserId,
    pub entitlement_type: EntitlementType,
    pub bot_kind: Option<BotKind>,
    pub marketplace: Option<String>,
    pub source: EntitlementSource,
    pub status: EntitlementStatus,
    pub expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub revoked_at: Option<OffsetDateTime>,
}

/// Fields for a grant that does not exist yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntitlement {
    pub user_id: UserId,
    pub entitlement_type: EntitlementType,
    pub bot_kind: Option<BotKind>,
    pub marketplace: Option<String>,
    pub source: EntitlementSource,
    pub expires_at: Option<OffsetDateTime>,
}

/// The grant set a plan confers
///
/// One BOT_ACCESS per baseline kind, one per gated flag the plan switches
/// on, and one MARKETPLACE_SLOT per included slot. All PLAN_INCLUDED, all
/// expiring with the subscription period.
pub fn plan_grants(
    user_id: UserId,
    plan: &PlanDefinition,
    expires_at: OffsetDateTime,
) -> Vec<NewEntitlement> {
    let mut grants = Vec::new();

    for kind in BotKind::BASELINE.into_iter().chain(plan.gated_bots()) {
        grants.push(NewEntitlement {
            user_id,
            entitlement_type: EntitlementType::BotAccess,
            bot_kind: Some(kind),
            marketplace: None,
            source: EntitlementSource::PlanIncluded,
            expires_at: Some(expires_at),
        });
    }

    for _ in 0..plan.marketplace_slots {
        grants.push(NewEntitlement {
            user_id,
            entitlement_type: EntitlementType::MarketplaceSlot,
            bot_kind: None,
            marketplace: None,
            source: EntitlementSource::PlanIncluded,
            expires_at: Some(expires_at),
        });
    }

    grants
}

/// Whether one grant covers one feature at a point in time
pub fn grants_feature(ent: &Entitlement, feature: Feature, now: OffsetDateTime) -> bool {
    if ent.status != EntitlementStatus::Active {
        return false;
    }
    if ent.expires_at.map_or(false, |e| e <= now) {
        return false;
    }
    match feature {
        Feature::Bot(kind) => {
            matches!(
                ent.entitlement_type,
                EntitlementType::BotAccess | EntitlementType::PromoAccess
            ) && ent.bot_kind == Some(kind)
        }
        Feature::Marketplace => ent.entitlement_type == EntitlementType::MarketplaceSlot,
    }
}

/// The access rule, over a loaded subscription and grant set
///
/// A live subscription (Active and unexpired, or Grace inside its window)
/// opens every feature; otherwise access falls back to per-feature grants,
/// which work with no subscription at all.
pub fn evaluate_access(
    subscription: Option<&Subscription>,
    entitlements: &[Entitlement],
    feature: Feature,
    now: OffsetDateTime,
) -> bool {
    if let Some(sub) = subscription {
        match sub.status {
            SubscriptionStatus::Active if sub.expires_at > now => return true,
            SubscriptionStatus::Grace if sub.grace_until.map_or(false, |g| g > now) => {
                return true
            }
            _ => {}
        }
    }
    entitlements.iter().any(|e| grants_feature(e, feature, now))
}

/// Storage side of the grant ledger
#[derive(Clone)]
pub struct EntitlementService {
    pool: PgPool,
    audit: AuditLogger,
    catalog: PlanCatalog,
}

impl EntitlementService {
    pub fn new(pool: PgPool, catalog: PlanCatalog) -> Self {
        Self { audit: AuditLogger::new(pool.clone()), pool, catalog }
    }

    /// Replace the user's PLAN_INCLUDED grants with the plan's set
    ///
    /// Revoke and recreate run in one transaction, so a failure partway
    /// leaves the old grants in place rather than a half-built set.
    pub async fn derive_from_plan(
        &self,
        user_id: UserId,
        plan_id: &str,
        expires_at: OffsetDateTime,
    ) -> BillingResult<Vec<Entitlement>> {
        let plan = self
            .catalog
            .get(plan_id)
            .ok_or_else(|| BillingError::PlanUnknown(plan_id.to_string()))?;

        let grants = plan_grants(user_id, plan, expires_at);

        let mut tx = self.pool.begin().await?;

        let revoked = sqlx::query(
            "UPDATE entitlements
             SET status = 'REVOKED', revoked_at = NOW()
             WHERE user_id = $1 AND source = 'PLAN_INCLUDED' AND status = 'ACTIVE'",
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let mut created = Vec::with_capacity(grants.len());
        for grant in &grants {
            let row: Entitlement = sqlx::query_as(
                r#"
                INSERT INTO entitlements
                    (user_id, entitlement_type, bot_kind, marketplace, source, status, expires_at)
                VALUES ($1, $2, $3, $4, $5, 'ACTIVE', $6)
                RETURNING id, user_id, entitlement_type, bot_kind, marketplace,
                          source, status, expires_at, created_at, revoked_at
                "#,
            )
            .bind(grant.user_id)
            .bind(grant.entitlement_type)
            .bind(grant.bot_kind)
            .bind(&grant.marketplace)
            .bind(grant.source)
            .bind(grant.expires_at)
            .fetch_one(&mut *tx)
            .await?;
            created.push(row);
        }

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            plan_id = %plan_id,
            revoked = revoked,
            granted = created.len(),
            "Plan entitlements rebuilt"
        );

        self.audit
            .log_best_effort(
                AuditEntryBuilder::new(AuditAction::EntitlementsRebuilt)
                    .entity("entitlements", user_id.to_string())
                    .metadata(serde_json::json!({
                        "plan_id": plan_id,
                        "revoked": revoked,
                        "granted": created.len(),
                    })),
            )
            .await;

        Ok(created)
    }

    /// Grant promotional access to one bot
    pub async fn add_promo_access(
        &self,
        user_id: UserId,
        bot_kind: BotKind,
        expires_at: OffsetDateTime,
    ) -> BillingResult<Entitlement> {
        let row: Entitlement = sqlx::query_as(
            r#"
            INSERT INTO entitlements
                (user_id, entitlement_type, bot_kind, marketplace, source, status, expires_at)
            VALUES ($1, 'PROMO_ACCESS', $2, NULL, 'PROMO', 'ACTIVE', $3)
            RETURNING id, user_id, entitlement_type, bot_kind, marketplace,
                      source, status, expires_at, created_at, revoked_at
            "#,
        )
        .bind(user_id)
        .bind(bot_kind)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;

        self.audit
            .log_best_effort(
                AuditEntryBuilder::new(AuditAction::EntitlementGranted)
                    .entity("entitlement", row.id.to_string())
                    .metadata(serde_json::json!({
                        "user_id": user_id,
                        "bot_kind": bot_kind,
                        "expires_at": expires_at.unix_timestamp(),
                    })),
            )
            .await;

        Ok(row)
    }

    /// Grant one additional marketplace slot outside the plan set
    pub async fn add_marketplace_slot(
        &self,
        user_id: UserId,
        marketplace: &str,
        source: EntitlementSource,
    ) -> BillingResult<Entitlement> {
        let row: Entitlement = sqlx::query_as(
            r#"
            INSERT INTO entitlements
                (user_id, entitlement_type, bot_kind, marketplace, source, status, expires_at)
            VALUES ($1, 'MARKETPLACE_SLOT', NULL, $2, $3, 'ACTIVE', NULL)
            RETURNING id, user_id, entitlement_type, bot_kind, marketplace,
                      source, status, expires_at, created_at, revoked_at
            "#,
        )
        .bind(user_id)
        .bind(marketplace)
        .bind(source)
        .fetch_one(&self.pool)
        .await?;

        self.audit
            .log_best_effort(
                AuditEntryBuilder::new(AuditAction::EntitlementGranted)
                    .entity("entitlement", row.id.to_string())
                    .metadata(serde_json::json!({
                        "user_id": user_id,
                        "marketplace": marketplace,
                        "source": source.as_str(),
                    })),
            )
            .await;

        Ok(row)
    }

    /// Bulk-revoke a user's ACTIVE grants, optionally scoped by source
    ///
    /// `None` revokes everything; that is the chargeback path.
    pub async fn revoke_entitlements(
        &self,
        user_id: UserId,
        source: Option<EntitlementSource>,
    ) -> BillingResult<u64> {
        let revoked = sqlx::query(
            "UPDATE entitlements
             SET status = 'REVOKED', revoked_at = NOW()
             WHERE user_id = $1 AND status = 'ACTIVE'
               AND ($2::VARCHAR IS NULL OR source = $2)",
        )
        .bind(user_id)
        .bind(source)
        .execute(&self.pool)
        .await?
        .rows_affected();

        tracing::info!(
            user_id = %user_id,
            source = source.map(|s| s.as_str()).unwrap_or("all"),
            revoked = revoked,
            "Entitlements revoked"
        );

        self.audit
            .log_best_effort(
                AuditEntryBuilder::new(AuditAction::EntitlementsRevoked)
                    .entity("entitlements", user_id.to_string())
                    .metadata(serde_json::json!({
                        "source": source.map(|s| s.as_str()),
                        "revoked": revoked,
                    })),
            )
            .await;

        Ok(revoked)
    }

    /// Revoke every ACTIVE grant whose expiry has passed
    ///
    /// Scheduled sweep; deliberately kept off the request path.
    pub async fn cleanup_expired_entitlements(&self) -> BillingResult<u64> {
        let revoked = sqlx::query(
            "UPDATE entitlements
             SET status = 'REVOKED', revoked_at = NOW()
             WHERE status = 'ACTIVE' AND expires_at IS NOT NULL AND expires_at <= NOW()",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        if revoked > 0 {
            tracing::info!(revoked = revoked, "Expired entitlements cleaned up");
            self.audit
                .log_best_effort(
                    AuditEntryBuilder::new(AuditAction::EntitlementsExpired)
                        .metadata(serde_json::json!({ "revoked": revoked })),
                )
                .await;
        }

        Ok(revoked)
    }

    /// ACTIVE, unexpired grants for a user
    pub async fn list_active_entitlements(
        &self,
        user_id: UserId,
    ) -> BillingResult<Vec<Entitlement>> {
        list_active(&self.pool, user_id).await
    }
}

async fn list_active(pool: &PgPool, user_id: UserId) -> BillingResult<Vec<Entitlement>> {
    let rows: Vec<Entitlement> = sqlx::query_as(
        "SELECT id, user_id, entitlement_type, bot_kind, marketplace,
                source, status, expires_at, created_at, revoked_at
         FROM entitlements
         WHERE user_id = $1 AND status = 'ACTIVE'
           AND (expires_at IS NULL OR expires_at > NOW())
         ORDER BY created_at",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// The only access-query surface other subsystems may use
///
/// Bot runtimes and the admin UI call this; they never read subscription
/// or entitlement rows themselves.
#[derive(Clone)]
pub struct AccessChecker {
    pool: PgPool,
}

impl AccessChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn has_access(&self, user_id: UserId, feature: Feature) -> BillingResult<bool> {
        let now = OffsetDateTime::now_utc();

        let subscription: Option<Subscription> = sqlx::query_as(
            "SELECT user_id, plan_id, status, expires_at, grace_until,
                    customer_id, transaction_id, created_at, updated_at
             FROM subscriptions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let entitlements = list_active(&self.pool, user_id).await?;

        Ok(evaluate_access(subscription.as_ref(), &entitlements, feature, now))
    }

    pub async fn list_active_entitlements(
        &self,
        user_id: UserId,
    ) -> BillingResult<Vec<Entitlement>> {
        list_active(&self.pool, user_id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use time::Duration;

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    fn grant(
        user_id: UserId,
        entitlement_type: EntitlementType,
        bot_kind: Option<BotKind>,
        source: EntitlementSource,
        expires_at: Option<OffsetDateTime>,
    ) -> Entitlement {
        Entitlement {
            id: Uuid::new_v4(),
            user_id,
            entitlement_type,
            bot_kind,
            marketplace: None,
            source,
            status: EntitlementStatus::Active,
            expires_at,
            created_at: now() - Duration::days(1),
            revoked_at: None,
        }
    }

    #[test]
    fn starter_plan_grants_baseline_and_one_slot() {
        let user = UserId::new();
        let grants = plan_grants(user, &PlanDefinition::starter(), now() + Duration::days(30));

        let bots: Vec<_> = grants
            .iter()
            .filter(|g| g.entitlement_type == EntitlementType::BotAccess)
            .filter_map(|g| g.bot_kind)
            .collect();
        assert_eq!(bots, vec![BotKind::Welcome, BotKind::Support]);

        let slots = grants
            .iter()
            .filter(|g| g.entitlement_type == EntitlementType::MarketplaceSlot)
            .count();
        assert_eq!(slots, 1);

        assert!(grants.iter().all(|g| g.source == EntitlementSource::PlanIncluded));
        assert!(grants.iter().all(|g| g.expires_at.is_some()));
    }

    #[test]
    fn agency_plan_grants_every_bot_and_ten_slots() {
        let grants = plan_grants(UserId::new(), &PlanDefinition::agency(), now());
        let bots = grants
            .iter()
            .filter(|g| g.entitlement_type == EntitlementType::BotAccess)
            .count();
        let slots = grants
            .iter()
            .filter(|g| g.entitlement_type == EntitlementType::MarketplaceSlot)
            .count();
        assert_eq!(bots, 5);
        assert_eq!(slots, 10);
    }

    #[test]
    fn revoked_or_expired_grants_confer_nothing() {
        let user = UserId::new();
        let mut revoked = grant(
            user,
            EntitlementType::BotAccess,
            Some(BotKind::Autopost),
            EntitlementSource::PlanIncluded,
            None,
        );
        revoked.status = EntitlementStatus::Revoked;
        assert!(!grants_feature(&revoked, Feature::Bot(BotKind::Autopost), now()));

        let expired = grant(
            user,
            EntitlementType::BotAccess,
            Some(BotKind::Autopost),
            EntitlementSource::PlanIncluded,
            Some(now() - Duration::hours(1)),
        );
        assert!(!grants_feature(&expired, Feature::Bot(BotKind::Autopost), now()));
    }

    #[test]
    fn bot_grants_match_their_kind_only() {
        let user = UserId::new();
        let autopost = grant(
            user,
            EntitlementType::BotAccess,
            Some(BotKind::Autopost),
            EntitlementSource::PlanIncluded,
            Some(now() + Duration::days(10)),
        );
        assert!(grants_feature(&autopost, Feature::Bot(BotKind::Autopost), now()));
        assert!(!grants_feature(&autopost, Feature::Bot(BotKind::Analytics), now()));
        assert!(!grants_feature(&autopost, Feature::Marketplace, now()));
    }

    #[test]
    fn promo_grant_opens_its_bot() {
        let user = UserId::new();
        let promo = grant(
            user,
            EntitlementType::PromoAccess,
            Some(BotKind::Analytics),
            EntitlementSource::Promo,
            Some(now() + Duration::days(7)),
        );
        assert!(grants_feature(&promo, Feature::Bot(BotKind::Analytics), now()));
    }

    #[test]
    fn marketplace_slot_opens_marketplace() {
        let user = UserId::new();
        let slot = grant(
            user,
            EntitlementType::MarketplaceSlot,
            None,
            EntitlementSource::AddonPurchased,
            None,
        );
        assert!(grants_feature(&slot, Feature::Marketplace, now()));
        assert!(!grants_feature(&slot, Feature::Bot(BotKind::Welcome), now()));
    }

    fn sub(status: SubscriptionStatus) -> Subscription {
        Subscription {
            user_id: UserId::new(),
            plan_id: "growth".to_string(),
            status,
            expires_at: now() + Duration::days(10),
            grace_until: None,
            customer_id: None,
            transaction_id: None,
            created_at: now() - Duration::days(30),
            updated_at: now() - Duration::days(1),
        }
    }

    #[test]
    fn live_subscription_opens_every_feature() {
        let live = sub(SubscriptionStatus::Active);
        for feature in [
            Feature::Bot(BotKind::Moderation),
            Feature::Bot(BotKind::Welcome),
            Feature::Marketplace,
        ] {
            assert!(evaluate_access(Some(&live), &[], feature, now()));
        }
    }

    #[test]
    fn lapsed_active_subscription_does_not_grant() {
        let mut lapsed = sub(SubscriptionStatus::Active);
        lapsed.expires_at = now() - Duration::hours(1);
        assert!(!evaluate_access(Some(&lapsed), &[], Feature::Marketplace, now()));
    }

    #[test]
    fn grace_grants_inside_window_only() {
        let mut graceful = sub(SubscriptionStatus::Grace);
        graceful.expires_at = now() - Duration::days(1);

        graceful.grace_until = Some(now() + Duration::days(2));
        assert!(evaluate_access(Some(&graceful), &[], Feature::Marketplace, now()));

        graceful.grace_until = Some(now() - Duration::hours(1));
        assert!(!evaluate_access(Some(&graceful), &[], Feature::Marketplace, now()));
    }

    #[test]
    fn promo_entitlement_works_without_any_subscription() {
        let user = UserId::new();
        let promo = grant(
            user,
            EntitlementType::PromoAccess,
            Some(BotKind::Autopost),
            EntitlementSource::Promo,
            Some(now() + Duration::days(7)),
        );
        assert!(evaluate_access(None, &[promo], Feature::Bot(BotKind::Autopost), now()));
        assert!(!evaluate_access(None, &[], Feature::Bot(BotKind::Autopost), now()));
    }

    #[test]
    fn expired_subscription_falls_back_to_surviving_grants() {
        let expired = sub(SubscriptionStatus::Expired);
        let addon_slot = grant(
            expired.user_id,
            EntitlementType::MarketplaceSlot,
            None,
            EntitlementSource::AddonPurchased,
            None,
        );
        assert!(evaluate_access(Some(&expired), &[addon_slot], Feature::Marketplace, now()));
        assert!(!evaluate_access(
            Some(&expired),
            &[],
            Feature::Bot(BotKind::Welcome),
            now()
        ));
    }
}
