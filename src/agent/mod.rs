//! Turn loop
//!
//! REQUEST → SNAPSHOT → DISPATCH → ADVANCE → APPLY MUTATIONS → REPLY
//!
//! One turn holds its session's lock from snapshot to apply, so turns for
//! the same session run one at a time. The ledger does its own per-user
//! locking underneath.

pub mod turn;

pub use turn::{ConversationAgent, TurnAgent};

use crate::catalog::FundCatalog;
use crate::context::{ContextStore, SessionContexts};
use crate::intents::{IntentRegistry, TurnServices};
use crate::ledger::PortfolioLedger;
use crate::models::{ActiveContext, TurnRequest, TurnResponse};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

pub const GENERIC_FAILURE_REPLY: &str =
    "Sorry, something went wrong while handling your request. Please try again in a moment.";

/// Lifespan given to a caller-reported context that carries none
const INBOUND_CONTEXT_LIFESPAN: u32 = 1;

pub struct Assistant {
    registry: Arc<IntentRegistry>,
    ledger: Arc<PortfolioLedger>,
    catalog: Arc<FundCatalog>,
    contexts: ContextStore,
    initial_balance: Decimal,
}

impl Assistant {
    pub fn new(
        registry: Arc<IntentRegistry>,
        ledger: Arc<PortfolioLedger>,
        catalog: Arc<FundCatalog>,
        initial_balance: Decimal,
    ) -> Self {
        Self {
            registry,
            ledger,
            catalog,
            contexts: ContextStore::new(),
            initial_balance,
        }
    }

    pub fn ledger(&self) -> &PortfolioLedger {
        &self.ledger
    }

    pub fn catalog(&self) -> &FundCatalog {
        &self.catalog
    }

    pub fn contexts(&self) -> &ContextStore {
        &self.contexts
    }

    /// Handle one conversational turn. Never fails: storage trouble becomes
    /// a generic reply and the turn's context writes are dropped.
    pub async fn handle_turn(&self, request: TurnRequest) -> TurnResponse {
        let start_time = Instant::now();
        let user_id = request.user_id().to_string();

        info!(
            session_id = %request.session_id,
            user_id = %user_id,
            intent = %request.intent_name,
            "Turn received"
        );

        let handle = self.contexts.session(&request.session_id).await;
        let mut session = handle.lock().await;

        let snapshot = overlay_inbound(&session, &request.contexts);
        let mut agent = TurnAgent::new(snapshot, request.raw_query_text.clone());

        let services = TurnServices {
            user_id: &user_id,
            ledger: &self.ledger,
            catalog: &self.catalog,
            initial_balance: self.initial_balance,
        };

        let outcome = self
            .registry
            .dispatch(&request.intent_name, &mut agent, &request.parameters, &services)
            .await;

        session.advance_turn();

        let response = match outcome {
            Ok(()) => {
                let (reply_text, context_mutations) = agent.into_parts();
                for mutation in &context_mutations {
                    session.apply(mutation);
                    debug!(
                        session_id = %request.session_id,
                        context = %mutation.name,
                        lifespan = mutation.lifespan,
                        "Context updated"
                    );
                }
                TurnResponse {
                    reply_text,
                    context_mutations,
                }
            }
            Err(e) => {
                error!(
                    session_id = %request.session_id,
                    user_id = %user_id,
                    intent = %request.intent_name,
                    error = %e,
                    "Turn failed"
                );
                TurnResponse {
                    reply_text: GENERIC_FAILURE_REPLY.to_string(),
                    context_mutations: Vec::new(),
                }
            }
        };

        drop(session);
        drop(handle);
        self.contexts.prune(&request.session_id).await;

        info!(
            session_id = %request.session_id,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            mutations = response.context_mutations.len(),
            "Turn complete"
        );

        response
    }
}

/// Pre-turn view: stored contexts plus any the caller reports that the
/// store has no record of (e.g. after a restart).
fn overlay_inbound(stored: &SessionContexts, inbound: &[ActiveContext]) -> SessionContexts {
    let mut snapshot = stored.clone();
    for ctx in inbound {
        if snapshot.contains(&ctx.name) {
            continue;
        }
        let lifespan = ctx.lifespan.unwrap_or(INBOUND_CONTEXT_LIFESPAN);
        snapshot.set(&ctx.name, ctx.parameters.clone(), lifespan);
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AssistantError;
    use crate::intents::{create_default_registry, CHECK_BALANCE_INTENT, PURCHASE_FUND_INTENT, REDEEM_FUND_INTENT};
    use crate::ledger::{InMemoryLedgerStore, LedgerStore, StoredAccount};
    use crate::models::{Account, Parameters};
    use crate::onboarding;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn catalog_at(nav: Decimal) -> Arc<FundCatalog> {
        let raw = json!({
            "Growth Fund": { "nav": nav, "minInvestment": 500, "performance": "12% over 1 year" }
        });
        Arc::new(FundCatalog::from_json_str(&raw.to_string()).unwrap())
    }

    fn assistant(ledger: Arc<PortfolioLedger>, catalog: Arc<FundCatalog>) -> Assistant {
        Assistant::new(Arc::new(create_default_registry()), ledger, catalog, dec!(10000.00))
    }

    fn say(intent: &str, text: &str) -> TurnRequest {
        TurnRequest::new("s1", intent).with_query(text)
    }

    #[tokio::test]
    async fn test_end_to_end_purchase_then_redeem_at_new_nav() {
        let ledger = Arc::new(PortfolioLedger::in_memory());
        ledger.create_account("s1", dec!(10000), None).await.unwrap();

        let at_20 = assistant(ledger.clone(), catalog_at(dec!(20)));
        let reply = at_20
            .handle_turn(
                say(PURCHASE_FUND_INTENT, "buy 2000 of growth fund")
                    .with_param("FundName", "Growth Fund")
                    .with_param("amount", 2000),
            )
            .await
            .reply_text;
        assert!(reply.contains("100 units"), "{reply}");

        let account = ledger.get_account("s1").await.unwrap();
        assert_eq!(account.cash_balance, dec!(8000));
        assert_eq!(account.position("Growth Fund").unwrap().units, dec!(100));

        let at_25 = assistant(ledger.clone(), catalog_at(dec!(25)));
        let reply = at_25
            .handle_turn(
                say(REDEEM_FUND_INTENT, "sell 1000 of growth fund")
                    .with_param("FundName", "Growth Fund")
                    .with_param("amount", 1000),
            )
            .await
            .reply_text;
        assert!(reply.contains("40 units"), "{reply}");

        let account = ledger.get_account("s1").await.unwrap();
        assert_eq!(account.cash_balance, dec!(9000));
        assert_eq!(account.position("Growth Fund").unwrap().units, dec!(60));
    }

    #[tokio::test]
    async fn test_rejection_becomes_reply() {
        let ledger = Arc::new(PortfolioLedger::in_memory());
        ledger.create_account("s1", dec!(1000), None).await.unwrap();
        let bot = assistant(ledger.clone(), catalog_at(dec!(20)));

        let response = bot
            .handle_turn(
                say(PURCHASE_FUND_INTENT, "buy 5000")
                    .with_param("FundName", "Growth Fund")
                    .with_param("amount", 5000),
            )
            .await;

        assert!(response.reply_text.contains("don't have enough cash"));
        assert_eq!(ledger.get_account("s1").await.unwrap().cash_balance, dec!(1000));
    }

    #[tokio::test]
    async fn test_onboarding_across_turns() {
        let ledger = Arc::new(PortfolioLedger::in_memory());
        let bot = assistant(ledger.clone(), catalog_at(dec!(20)));

        let response = bot.handle_turn(say("Create Account", "open an account")).await;
        assert!(response.reply_text.contains("Would you like to create one"));
        assert_eq!(response.context_mutations.last().unwrap().name, onboarding::AWAITING_CONFIRMATION);

        // Unclassified answers still reach onboarding
        for text in ["yes", "Asha Rao", "98765 43210", "34"] {
            bot.handle_turn(say("Default Fallback Intent", text)).await;
        }
        let response = bot
            .handle_turn(say("Provide Email", "").with_param("email", "asha@example.com"))
            .await;
        assert!(response.reply_text.contains("created successfully"), "{}", response.reply_text);

        let account = ledger.get_account("s1").await.unwrap();
        assert_eq!(account.cash_balance, dec!(10000.00));
        assert_eq!(account.profile.unwrap().name.as_deref(), Some("Asha Rao"));

        let reply = bot.handle_turn(say(CHECK_BALANCE_INTENT, "balance")).await.reply_text;
        assert!(reply.contains("cash balance is $10000.00"));
    }

    #[tokio::test]
    async fn test_invalid_mobile_keeps_step_and_name() {
        let bot = assistant(Arc::new(PortfolioLedger::in_memory()), catalog_at(dec!(20)));

        bot.handle_turn(say("Create Account", "open an account")).await;
        bot.handle_turn(say("Confirm Account", "yes")).await;
        bot.handle_turn(say("Provide Name", "Asha")).await;
        let response = bot.handle_turn(say("Provide Mobile", "12345")).await;

        assert!(response.reply_text.contains("10-digit mobile"));
        let contexts = bot.contexts();
        assert!(contexts.get("s1", onboarding::COLLECTING_MOBILE).await.is_some());
        assert!(contexts.get("s1", onboarding::COLLECTING_AGE).await.is_none());
        let details = contexts.get("s1", onboarding::USER_DETAILS).await.unwrap();
        assert_eq!(details.param_str("name"), Some("Asha"));
    }

    #[tokio::test]
    async fn test_user_id_overrides_session() {
        let ledger = Arc::new(PortfolioLedger::in_memory());
        ledger.create_account("alice", dec!(250), None).await.unwrap();
        let bot = assistant(ledger, catalog_at(dec!(20)));

        let mut request = say(CHECK_BALANCE_INTENT, "balance");
        request.user_id = Some("alice".to_string());
        let reply = bot.handle_turn(request).await.reply_text;

        assert!(reply.contains("$250.00"));
    }

    #[tokio::test]
    async fn test_inbound_context_reaches_handler() {
        let bot = assistant(Arc::new(PortfolioLedger::in_memory()), catalog_at(dec!(20)));

        let mut request = say("Default Fallback Intent", "Ravi Kumar");
        request.contexts.push(ActiveContext {
            name: "Collecting_Name".to_string(),
            parameters: Parameters::new(),
            lifespan: Some(1),
        });
        let response = bot.handle_turn(request).await;

        assert!(response.reply_text.contains("mobile number"));
        assert!(response
            .context_mutations
            .iter()
            .any(|m| m.name == onboarding::USER_DETAILS && m.parameters["name"] == "Ravi Kumar"));
    }

    #[tokio::test]
    async fn test_idle_session_is_pruned() {
        let bot = assistant(Arc::new(PortfolioLedger::in_memory()), catalog_at(dec!(20)));

        let reply = bot.handle_turn(say(CHECK_BALANCE_INTENT, "balance")).await.reply_text;
        assert!(reply.contains("create account"));
        assert_eq!(bot.contexts().session_count().await, 0);

        bot.handle_turn(say("Create Account", "new account")).await;
        assert_eq!(bot.contexts().session_count().await, 1);
    }

    /// Store whose every call fails
    struct BrokenStore;

    #[async_trait::async_trait]
    impl LedgerStore for BrokenStore {
        async fn load(&self, _user_id: &str) -> crate::Result<Option<StoredAccount>> {
            Err(AssistantError::StorageIo("disk unavailable".into()))
        }

        async fn save(&self, _account: &Account, _expected: Option<u64>) -> crate::Result<u64> {
            Err(AssistantError::StorageIo("disk unavailable".into()))
        }

        fn backend_name(&self) -> &'static str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_storage_failure_gives_generic_reply() {
        let policy = crate::ledger::RetryPolicy {
            max_io_retries: 1,
            backoff: std::time::Duration::from_millis(1),
            max_conflict_retries: 0,
        };
        let ledger = Arc::new(PortfolioLedger::with_retry_policy(Arc::new(BrokenStore), policy));
        let bot = assistant(ledger, catalog_at(dec!(20)));

        let response = bot.handle_turn(say("Create Account", "open an account")).await;
        assert_eq!(response.reply_text, GENERIC_FAILURE_REPLY);
        assert!(response.context_mutations.is_empty());
        assert!(!response.reply_text.contains("disk"));
    }

    #[tokio::test]
    async fn test_in_memory_store_is_shared_between_assistants() {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedgerStore::new());
        let ledger = Arc::new(PortfolioLedger::new(store));
        let first = assistant(ledger.clone(), catalog_at(dec!(20)));
        let second = assistant(ledger, catalog_at(dec!(20)));

        first.ledger().create_account("s1", dec!(75), None).await.unwrap();
        let reply = second.handle_turn(say(CHECK_BALANCE_INTENT, "balance")).await.reply_text;
        assert!(reply.contains("$75.00"));
    }

    /// Every save loses the race to another writer
    struct ContestedStore {
        inner: InMemoryLedgerStore,
    }

    #[async_trait::async_trait]
    impl LedgerStore for ContestedStore {
        async fn load(&self, user_id: &str) -> crate::Result<Option<StoredAccount>> {
            self.inner.load(user_id).await
        }

        async fn save(&self, account: &Account, _expected: Option<u64>) -> crate::Result<u64> {
            Err(AssistantError::StorageConflict(format!("{} changed underneath", account.user_id)))
        }

        fn backend_name(&self) -> &'static str {
            "contested"
        }
    }

    #[tokio::test]
    async fn test_persistent_conflict_asks_user_to_retry() {
        let inner = InMemoryLedgerStore::new();
        inner.save(&Account::new("s1", dec!(10000)), None).await.unwrap();
        let ledger = Arc::new(PortfolioLedger::new(Arc::new(ContestedStore { inner })));
        let bot = assistant(ledger.clone(), catalog_at(dec!(20)));

        let response = bot
            .handle_turn(
                say(PURCHASE_FUND_INTENT, "buy 2000 of growth fund")
                    .with_param("FundName", "Growth Fund")
                    .with_param("amount", 2000),
            )
            .await;

        assert!(response.reply_text.contains("Please try again"), "{}", response.reply_text);
        assert_ne!(response.reply_text, GENERIC_FAILURE_REPLY);
        assert_eq!(ledger.get_account("s1").await.unwrap().cash_balance, dec!(10000));
    }
}
