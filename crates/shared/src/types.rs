//! Common types used across botforge

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Bot and feature vocabulary
// =============================================================================

/// The bot integrations the product ships
///
/// Stored as lowercase strings in `entitlements.bot_kind` and referenced by
/// plan flags. `Welcome` and `Support` are included with every paid plan;
/// the rest are gated per plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BotKind {
    Welcome,
    Support,
    Autopost,
    Analytics,
    Moderation,
}

impl BotKind {
    /// Bot kinds included with every plan, regardless of plan flags
    pub const BASELINE: [BotKind; 2] = [BotKind::Welcome, BotKind::Support];

    pub fn as_str(&self) -> &'static str {
        match self {
            BotKind::Welcome => "welcome",
            BotKind::Support => "support",
            BotKind::Autopost => "autopost",
            BotKind::Analytics => "analytics",
            BotKind::Moderation => "moderation",
        }
    }
}

impl fmt::Display for BotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BotKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "welcome" => Ok(BotKind::Welcome),
            "support" => Ok(BotKind::Support),
            "autopost" => Ok(BotKind::Autopost),
            "analytics" => Ok(BotKind::Analytics),
            "moderation" => Ok(BotKind::Moderation),
            other => Err(format!("unknown bot kind: {other}")),
        }
    }
}

/// A gated product feature, as seen by access checks
///
/// Bot runtimes and the admin UI gate on this vocabulary only; they never
/// read subscription or entitlement rows directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "feature", content = "bot")]
pub enum Feature {
    Bot(BotKind),
    Marketplace,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feature::Bot(kind) => write!(f, "bot:{kind}"),
            Feature::Marketplace => write!(f, "marketplace"),
        }
    }
}
