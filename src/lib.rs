//! Fund Assistant
//!
//! Conversational back end for a mutual-fund investment assistant:
//! - Dispatches NLU-classified intents to handlers through a static registry
//! - Walks new users through a multi-turn account onboarding dialogue
//! - Keeps per-user cash and fund positions in a transactional ledger
//! - Carries slot-filling progress between turns in lifespan-bounded contexts
//!
//! TURN LOOP:
//! REQUEST → SNAPSHOT → DISPATCH → ADVANCE → APPLY MUTATIONS → REPLY

pub mod agent;
pub mod api;
pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod intents;
pub mod ledger;
pub mod models;
pub mod onboarding;

pub use error::{AssistantError, Result};

// Re-export common types
pub use agent::Assistant;
pub use catalog::FundCatalog;
pub use config::AssistantConfig;
pub use ledger::PortfolioLedger;
pub use models::*;
