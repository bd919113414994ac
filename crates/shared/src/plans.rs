//! Read-only plan catalog
//!
//! Plans are defined by the product team and consumed here as data: boolean
//! per-bot access flags plus a marketplace-slot count. The billing pipeline
//! never mutates plans; it only derives entitlements from them.

use serde::{Deserialize, Serialize};

use crate::types::BotKind;

/// One subscription plan as the entitlement engine sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDefinition {
    /// Catalog identifier, matched against webhook payloads
    pub id: String,
    /// Display name
    pub name: String,
    /// Per-bot access flags (welcome/support are always included)
    pub autopost: bool,
    pub analytics: bool,
    pub moderation: bool,
    /// Number of marketplace listing slots included
    pub marketplace_slots: u32,
    /// Billing period length, used when a payload carries no expiry
    pub period_days: i64,
}

impl PlanDefinition {
    /// Starter: baseline bots only, 1 marketplace slot
    pub fn starter() -> Self {
        Self {
            id: "starter".to_string(),
            name: "Starter".to_string(),
            autopost: false,
            analytics: false,
            moderation: false,
            marketplace_slots: 1,
            period_days: 30,
        }
    }

    /// Growth: autopost + analytics, 3 marketplace slots
    pub fn growth() -> Self {
        Self {
            id: "growth".to_string(),
            name: "Growth".to_string(),
            autopost: true,
            analytics: true,
            moderation: false,
            marketplace_slots: 3,
            period_days: 30,
        }
    }

    /// Agency: all bots, 10 marketplace slots
    pub fn agency() -> Self {
        Self {
            id: "agency".to_string(),
            name: "Agency".to_string(),
            autopost: true,
            analytics: true,
            moderation: true,
            marketplace_slots: 10,
            period_days: 30,
        }
    }

    /// Gated bot kinds this plan switches on, baseline excluded
    pub fn gated_bots(&self) -> Vec<BotKind> {
        let mut bots = Vec::new();
        if self.autopost {
            bots.push(BotKind::Autopost);
        }
        if self.analytics {
            bots.push(BotKind::Analytics);
        }
        if self.moderation {
            bots.push(BotKind::Moderation);
        }
        bots
    }
}

/// In-memory catalog of the plans the processor can sell
///
/// Lookup is by plan id as spelled in webhook payloads. Unknown ids resolve
/// to `None`; callers surface that as a `PlanUnknown` error rather than
/// guessing a default.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: Vec<PlanDefinition>,
}

impl PlanCatalog {
    /// The production catalog
    pub fn standard() -> Self {
        Self {
            plans: vec![
                PlanDefinition::starter(),
                PlanDefinition::growth(),
                PlanDefinition::agency(),
            ],
        }
    }

    /// A catalog with explicit entries, for tests and staging setups
    pub fn with_plans(plans: Vec<PlanDefinition>) -> Self {
        Self { plans }
    }

    pub fn get(&self, plan_id: &str) -> Option<&PlanDefinition> {
        self.plans.iter().find(|p| p.id == plan_id)
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_catalog_has_three_plans() {
        let catalog = PlanCatalog::standard();
        assert!(catalog.get("starter").is_some());
        assert!(catalog.get("growth").is_some());
        assert!(catalog.get("agency").is_some());
        assert!(catalog.get("enterprise").is_none());
    }

    #[test]
    fn agency_includes_every_gated_bot() {
        let agency = PlanDefinition::agency();
        assert!(agency.autopost);
        assert!(agency.analytics);
        assert!(agency.moderation);
        assert_eq!(agency.marketplace_slots, 10);
    }

    #[test]
    fn starter_is_baseline_only() {
        let starter = PlanDefinition::starter();
        assert!(!starter.autopost);
        assert!(!starter.analytics);
        assert!(!starter.moderation);
        assert_eq!(starter.marketplace_slots, 1);
        assert!(starter.gated_bots().is_empty());
    }

    #[test]
    fn gated_bots_follow_flags() {
        let growth = PlanDefinition::growth();
        assert_eq!(growth.gated_bots(), vec![BotKind::Autopost, BotKind::Analytics]);
    }
}
