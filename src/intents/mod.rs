//! Intent handlers and the dispatch registry
//!
//! The NLU layer resolves each utterance to an intent name plus extracted
//! parameters. The registry maps that name to a handler; unknown names go
//! to the fallback handler instead of failing the turn.

pub mod account;
pub mod faq;

use crate::agent::ConversationAgent;
use crate::catalog::FundCatalog;
use crate::error::AssistantError;
use crate::ledger::PortfolioLedger;
use crate::models::Parameters;
use crate::onboarding::{self, OnboardingHandler, StartOnboardingHandler};
use crate::Result;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

pub use account::{CheckBalanceHandler, FundDetailsHandler, PurchaseFundHandler, RedeemFundHandler};
pub use faq::{FallbackHandler, FaqHandler, WelcomeHandler};

pub const WELCOME_INTENT: &str = "Default Welcome Intent";
pub const FALLBACK_INTENT: &str = "Default Fallback Intent";
pub const CHECK_BALANCE_INTENT: &str = "Check Balance";
pub const FUND_DETAILS_INTENT: &str = "Fund Details";
pub const PURCHASE_FUND_INTENT: &str = "Purchase Fund";
pub const REDEEM_FUND_INTENT: &str = "Redeem Fund";
pub const FAQ_INTENT: &str = "FAQs";

/// Everything a handler may call besides the agent itself
pub struct TurnServices<'a> {
    pub user_id: &'a str,
    pub ledger: &'a PortfolioLedger,
    pub catalog: &'a FundCatalog,
    /// Cash credited to a newly onboarded account
    pub initial_balance: Decimal,
}

/// Trait for a single intent handler
#[async_trait::async_trait]
pub trait IntentHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(
        &self,
        agent: &mut dyn ConversationAgent,
        params: &Parameters,
        services: &TurnServices<'_>,
    ) -> Result<()>;
}

/// Registry for looking up handlers by intent name
pub struct IntentRegistry {
    handlers: HashMap<String, Arc<dyn IntentHandler>>,
    fallback: Arc<dyn IntentHandler>,
    onboarding: Arc<dyn IntentHandler>,
}

impl IntentRegistry {
    pub fn new(fallback: Arc<dyn IntentHandler>, onboarding: Arc<dyn IntentHandler>) -> Self {
        Self {
            handlers: HashMap::new(),
            fallback,
            onboarding,
        }
    }

    pub fn register(&mut self, intent_name: &str, handler: Arc<dyn IntentHandler>) {
        self.handlers.insert(intent_name.to_string(), handler);
    }

    pub fn get(&self, intent_name: &str) -> Option<Arc<dyn IntentHandler>> {
        self.handlers.get(intent_name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }

    /// Pick the handler for this turn.
    ///
    /// An utterance the NLU could not classify is most likely an answer to
    /// the pending onboarding question, so while an onboarding context is
    /// live the fallback routes there.
    pub fn resolve(
        &self,
        intent_name: &str,
        agent: &dyn ConversationAgent,
    ) -> Arc<dyn IntentHandler> {
        match self.get(intent_name) {
            Some(handler) if intent_name != FALLBACK_INTENT => handler,
            _ if onboarding::pending_step(agent).is_some() => self.onboarding.clone(),
            Some(handler) => handler,
            None => {
                debug!(intent = %intent_name, "Unknown intent, using fallback");
                self.fallback.clone()
            }
        }
    }

    /// Run the handler for `intent_name`. Handler errors become the reply.
    pub async fn dispatch(
        &self,
        intent_name: &str,
        agent: &mut dyn ConversationAgent,
        params: &Parameters,
        services: &TurnServices<'_>,
    ) -> Result<()> {
        let handler = self.resolve(intent_name, agent);
        debug!(intent = %intent_name, handler = handler.name(), "Dispatching");

        match handler.handle(agent, params, services).await {
            Ok(()) => Ok(()),
            Err(e) if matches!(e, AssistantError::StorageIo(_) | AssistantError::IoError(_)) => {
                Err(e)
            }
            Err(e) => {
                warn!(
                    intent = %intent_name,
                    user_id = %services.user_id,
                    error = %e,
                    "Handler rejected request"
                );
                agent.append_reply(&e.user_message());
                Ok(())
            }
        }
    }
}

/// Build the registry with every built-in intent
pub fn create_default_registry() -> IntentRegistry {
    let onboarding: Arc<dyn IntentHandler> = Arc::new(OnboardingHandler);
    let mut registry = IntentRegistry::new(Arc::new(FallbackHandler), onboarding.clone());

    registry.register(WELCOME_INTENT, Arc::new(WelcomeHandler));
    registry.register(FALLBACK_INTENT, Arc::new(FallbackHandler));
    registry.register(CHECK_BALANCE_INTENT, Arc::new(CheckBalanceHandler));
    registry.register(FUND_DETAILS_INTENT, Arc::new(FundDetailsHandler));
    registry.register(PURCHASE_FUND_INTENT, Arc::new(PurchaseFundHandler));
    registry.register(REDEEM_FUND_INTENT, Arc::new(RedeemFundHandler));
    registry.register(FAQ_INTENT, Arc::new(FaqHandler));
    registry.register(onboarding::CREATE_ACCOUNT_INTENT, Arc::new(StartOnboardingHandler));

    for intent in onboarding::ONBOARDING_INTENTS {
        registry.register(intent, onboarding.clone());
    }

    registry
}

static REGISTRY: OnceLock<Arc<IntentRegistry>> = OnceLock::new();

/// Process-wide registry, built on first use and never modified
pub fn shared_registry() -> Arc<IntentRegistry> {
    REGISTRY
        .get_or_init(|| Arc::new(create_default_registry()))
        .clone()
}

//
// ================= Parameter helpers =================
//

/// First non-empty text value among `keys`.
///
/// Accepts strings, numbers and `{ "name": ... }` objects (the shape some
/// NLU entities use for person names).
pub fn param_text(params: &Parameters, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match params.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(obj) => obj
            .get("name")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.trim().to_string()),
        _ => None,
    })
}

pub fn fund_name_param(params: &Parameters) -> Option<String> {
    param_text(params, &["FundName", "fund_name", "fundName", "fund"])
}

/// Parse a cash amount from a number, a string like "$1,500", or a
/// `{ "amount": .., "currency": .. }` object.
pub fn parse_amount(value: &Value) -> Result<Decimal> {
    let amount = match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .map_err(|_| AssistantError::InvalidAmount(n.to_string()))?,
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| !matches!(c, '$' | ',' | ' '))
                .collect();
            Decimal::from_str(&cleaned)
                .map_err(|_| AssistantError::InvalidAmount(s.trim().to_string()))?
        }
        Value::Object(obj) => {
            let inner = obj
                .get("amount")
                .ok_or_else(|| AssistantError::InvalidAmount("missing amount".to_string()))?;
            return parse_amount(inner);
        }
        other => return Err(AssistantError::InvalidAmount(other.to_string())),
    };

    if amount <= Decimal::ZERO {
        return Err(AssistantError::InvalidAmount(amount.to_string()));
    }
    Ok(amount)
}

pub fn amount_param(params: &Parameters) -> Result<Decimal> {
    let value = ["amount", "Amount", "unit-currency"]
        .iter()
        .find_map(|key| params.get(*key))
        .ok_or_else(|| AssistantError::InvalidAmount("no amount given".to_string()))?;
    parse_amount(value)
}
