//! Shared vocabulary for botforge
//!
//! Types that cross crate boundaries: user identity, the bot/feature
//! vocabulary the access checks speak, and the read-only plan catalog.

pub mod db;
pub mod plans;
pub mod types;

pub use db::create_pool;
pub use plans::{PlanCatalog, PlanDefinition};
pub use types::{BotKind, Feature, UserId};
