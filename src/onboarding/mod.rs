//! Account onboarding dialogue
//!
//! unauthenticated → awaiting_confirmation → collecting_name →
//! collecting_mobile → collecting_age → collecting_email → account_created
//!
//! Each step lives in a short-lived context named after it. Answers are
//! merged into a longer-lived `user_details` context until the email step
//! opens the account.

pub mod validation;

use crate::agent::ConversationAgent;
use crate::intents::{param_text, IntentHandler, TurnServices};
use crate::models::{AccountProfile, Parameters};
use crate::Result;
use serde_json::Value;
use tracing::{debug, info};
use validation::{AgeRule, EmailRule, FieldRule, MobileRule, NameRule};

pub const AWAITING_CONFIRMATION: &str = "awaiting_confirmation";
pub const COLLECTING_NAME: &str = "collecting_name";
pub const COLLECTING_MOBILE: &str = "collecting_mobile";
pub const COLLECTING_AGE: &str = "collecting_age";
pub const COLLECTING_EMAIL: &str = "collecting_email";
pub const USER_DETAILS: &str = "user_details";

/// Turns a step context survives without an answer
pub const STEP_LIFESPAN: u32 = 2;
/// Long enough to span the whole dialogue
pub const DETAILS_LIFESPAN: u32 = 10;

pub const CREATE_ACCOUNT_INTENT: &str = "Create Account";

/// Intents that carry an answer to the pending onboarding question
pub const ONBOARDING_INTENTS: [&str; 5] = [
    "Confirm Account",
    "Provide Name",
    "Provide Mobile",
    "Provide Age",
    "Provide Email",
];

const AFFIRMATIVE: &[&str] = &["yes", "sure", "okay", "ok", "confirm"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnboardingState {
    Unauthenticated,
    AwaitingConfirmation,
    CollectingName,
    CollectingMobile,
    CollectingAge,
    CollectingEmail,
    AccountCreated,
}

/// Steps backed by a context, latest first
const PENDING_STATES: [OnboardingState; 5] = [
    OnboardingState::CollectingEmail,
    OnboardingState::CollectingAge,
    OnboardingState::CollectingMobile,
    OnboardingState::CollectingName,
    OnboardingState::AwaitingConfirmation,
];

impl OnboardingState {
    pub fn context_name(&self) -> Option<&'static str> {
        match self {
            OnboardingState::AwaitingConfirmation => Some(AWAITING_CONFIRMATION),
            OnboardingState::CollectingName => Some(COLLECTING_NAME),
            OnboardingState::CollectingMobile => Some(COLLECTING_MOBILE),
            OnboardingState::CollectingAge => Some(COLLECTING_AGE),
            OnboardingState::CollectingEmail => Some(COLLECTING_EMAIL),
            OnboardingState::Unauthenticated | OnboardingState::AccountCreated => None,
        }
    }

    pub fn next(&self) -> OnboardingState {
        match self {
            OnboardingState::Unauthenticated => OnboardingState::AwaitingConfirmation,
            OnboardingState::AwaitingConfirmation => OnboardingState::CollectingName,
            OnboardingState::CollectingName => OnboardingState::CollectingMobile,
            OnboardingState::CollectingMobile => OnboardingState::CollectingAge,
            OnboardingState::CollectingAge => OnboardingState::CollectingEmail,
            OnboardingState::CollectingEmail | OnboardingState::AccountCreated => {
                OnboardingState::AccountCreated
            }
        }
    }

    fn rule(&self) -> Option<&'static dyn FieldRule> {
        match self {
            OnboardingState::CollectingName => Some(&NameRule),
            OnboardingState::CollectingMobile => Some(&MobileRule),
            OnboardingState::CollectingAge => Some(&AgeRule),
            OnboardingState::CollectingEmail => Some(&EmailRule),
            _ => None,
        }
    }

    /// Parameter keys the NLU may use for this step's answer
    fn param_keys(&self) -> &'static [&'static str] {
        match self {
            OnboardingState::AwaitingConfirmation => &["confirmation", "answer"],
            OnboardingState::CollectingName => &["name", "person", "given-name"],
            OnboardingState::CollectingMobile => &["mobile", "phone-number", "phone"],
            OnboardingState::CollectingAge => &["age", "number"],
            OnboardingState::CollectingEmail => &["email"],
            _ => &[],
        }
    }

    fn prompt(&self) -> &'static str {
        match self {
            OnboardingState::AwaitingConfirmation => {
                "It looks like you don't have an account yet. Would you like to create one? Please reply yes or no."
            }
            OnboardingState::CollectingName => "Great! Let's get started. What is your full name?",
            OnboardingState::CollectingMobile => "Thanks! What is your 10-digit mobile number?",
            OnboardingState::CollectingAge => "Got it. How old are you?",
            OnboardingState::CollectingEmail => "Almost done! What is your email address?",
            OnboardingState::Unauthenticated | OnboardingState::AccountCreated => "",
        }
    }
}

/// The onboarding step whose question is still open, if any
pub fn pending_step(agent: &dyn ConversationAgent) -> Option<OnboardingState> {
    PENDING_STATES.iter().copied().find(|state| {
        state
            .context_name()
            .map(|name| agent.read_context(name).is_some())
            .unwrap_or(false)
    })
}

pub fn is_affirmative(answer: &str) -> bool {
    let answer = answer
        .trim()
        .trim_matches(|c: char| c.is_ascii_punctuation())
        .to_lowercase();
    AFFIRMATIVE.contains(&answer.as_str())
}

fn arm(agent: &mut dyn ConversationAgent, state: OnboardingState) {
    if let Some(name) = state.context_name() {
        agent.write_context(name, Parameters::new(), STEP_LIFESPAN);
    }
}

fn disarm(agent: &mut dyn ConversationAgent, state: OnboardingState) {
    if let Some(name) = state.context_name() {
        agent.clear_context(name);
    }
}

/// Entry point for "Create Account": restarts the dialogue from scratch
pub struct StartOnboardingHandler;

#[async_trait::async_trait]
impl IntentHandler for StartOnboardingHandler {
    fn name(&self) -> &'static str {
        "onboarding_start"
    }

    async fn handle(
        &self,
        agent: &mut dyn ConversationAgent,
        _params: &Parameters,
        services: &TurnServices<'_>,
    ) -> Result<()> {
        if let Some(account) = services.ledger.find_account(services.user_id).await? {
            let name = account
                .profile
                .and_then(|p| p.name)
                .map(|n| format!(", {}", n))
                .unwrap_or_default();
            agent.append_reply(&format!(
                "Welcome back{}! You already have an account. You can check your balance, explore funds, or make a purchase.",
                name
            ));
            return Ok(());
        }

        for state in PENDING_STATES {
            disarm(agent, state);
        }
        agent.clear_context(USER_DETAILS);

        let next = OnboardingState::Unauthenticated.next();
        arm(agent, next);
        agent.append_reply(next.prompt());

        debug!(user_id = %services.user_id, "Onboarding started");
        Ok(())
    }
}

/// Answers to the pending onboarding question
pub struct OnboardingHandler;

#[async_trait::async_trait]
impl IntentHandler for OnboardingHandler {
    fn name(&self) -> &'static str {
        "onboarding"
    }

    async fn handle(
        &self,
        agent: &mut dyn ConversationAgent,
        params: &Parameters,
        services: &TurnServices<'_>,
    ) -> Result<()> {
        let Some(state) = pending_step(agent) else {
            return StartOnboardingHandler.handle(agent, params, services).await;
        };

        let answer = param_text(params, state.param_keys())
            .unwrap_or_else(|| agent.raw_query().trim().to_string());

        match state {
            OnboardingState::AwaitingConfirmation => {
                confirm(agent, &answer);
                Ok(())
            }
            _ => collect(agent, state, &answer, services).await,
        }
    }
}

fn confirm(agent: &mut dyn ConversationAgent, answer: &str) {
    if is_affirmative(answer) {
        disarm(agent, OnboardingState::AwaitingConfirmation);
        let next = OnboardingState::AwaitingConfirmation.next();
        arm(agent, next);
        agent.append_reply(next.prompt());
    } else {
        arm(agent, OnboardingState::AwaitingConfirmation);
        agent.append_reply(
            "No problem, I won't create an account for now. If you change your mind, just reply yes.",
        );
    }
}

async fn collect(
    agent: &mut dyn ConversationAgent,
    state: OnboardingState,
    answer: &str,
    services: &TurnServices<'_>,
) -> Result<()> {
    let Some(rule) = state.rule() else {
        return Ok(());
    };

    let value = match rule.validate(answer) {
        Ok(value) => value,
        Err(e) => {
            debug!(user_id = %services.user_id, field = rule.field(), "Onboarding answer rejected");
            arm(agent, state);
            agent.append_reply(&e.user_message());
            return Ok(());
        }
    };

    let mut update = Parameters::new();
    update.insert(rule.field().to_string(), value);
    disarm(agent, state);

    let next = state.next();
    if next != OnboardingState::AccountCreated {
        agent.write_context(USER_DETAILS, update, DETAILS_LIFESPAN);
        arm(agent, next);
        agent.append_reply(next.prompt());
        return Ok(());
    }

    // Final answer: everything collected so far plus this one
    let mut details = agent
        .read_context(USER_DETAILS)
        .map(|ctx| ctx.parameters.clone())
        .unwrap_or_default();
    details.extend(update);

    let profile = AccountProfile {
        name: details.get("name").and_then(Value::as_str).map(str::to_string),
        mobile: details.get("mobile").and_then(Value::as_str).map(str::to_string),
        age: details
            .get("age")
            .and_then(Value::as_u64)
            .and_then(|a| u32::try_from(a).ok()),
        email: details.get("email").and_then(Value::as_str).map(str::to_string),
    };

    let account = services
        .ledger
        .create_account(services.user_id, services.initial_balance, Some(profile.clone()))
        .await?;
    agent.clear_context(USER_DETAILS);

    info!(user_id = %services.user_id, "Onboarding complete, account created");

    let greeting = profile.name.map(|n| format!(", {}", n)).unwrap_or_default();
    agent.append_reply(&format!(
        "Your account has been created successfully{}! Your starting balance is ${:.2}. You can now check your balance, explore funds, or make a purchase.",
        greeting, account.cash_balance
    ));
    Ok(())
}
