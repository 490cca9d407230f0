//! Stateless conversational intents: greeting, fallback and FAQs

use crate::agent::ConversationAgent;
use crate::intents::{IntentHandler, TurnServices};
use crate::models::Parameters;
use crate::Result;

/// Keyword → answer, checked in order against the lowercased query
const FAQ_ANSWERS: &[(&str, &str)] = &[
    (
        "what are mutual funds",
        "Mutual funds are investment vehicles that pool money from multiple investors to purchase a diversified portfolio of stocks, bonds, or other securities.",
    ),
    (
        "how do i invest",
        "To invest in mutual funds, you can start by selecting a fund, specifying an investment amount, and completing the purchase through our platform.",
    ),
    (
        "what is nav",
        "NAV (Net Asset Value) is the per-unit value of a mutual fund, calculated by dividing the total value of the fund's assets by the number of units outstanding.",
    ),
];

const FAQ_DEFAULT: &str =
    "I can answer questions about mutual funds, investing, or NAV. Please ask your question again or try something specific!";

pub fn faq_answer(query: &str) -> &'static str {
    let query = query.to_lowercase();
    FAQ_ANSWERS
        .iter()
        .find(|(keyword, _)| query.contains(keyword))
        .map(|(_, answer)| *answer)
        .unwrap_or(FAQ_DEFAULT)
}

pub struct WelcomeHandler;

#[async_trait::async_trait]
impl IntentHandler for WelcomeHandler {
    fn name(&self) -> &'static str {
        "welcome"
    }

    async fn handle(
        &self,
        agent: &mut dyn ConversationAgent,
        _params: &Parameters,
        _services: &TurnServices<'_>,
    ) -> Result<()> {
        agent.append_reply(
            "Welcome to FundBot! How can I assist you with your mutual fund investments today? You can ask about your account balance, fund details, purchases, redemptions, or general FAQs.",
        );
        Ok(())
    }
}

pub struct FallbackHandler;

#[async_trait::async_trait]
impl IntentHandler for FallbackHandler {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn handle(
        &self,
        agent: &mut dyn ConversationAgent,
        _params: &Parameters,
        _services: &TurnServices<'_>,
    ) -> Result<()> {
        agent.append_reply(
            "I'm sorry, I didn't understand that. Could you please rephrase or ask about account balance, fund details, purchases, redemptions, or FAQs?",
        );
        Ok(())
    }
}

pub struct FaqHandler;

#[async_trait::async_trait]
impl IntentHandler for FaqHandler {
    fn name(&self) -> &'static str {
        "faq"
    }

    async fn handle(
        &self,
        agent: &mut dyn ConversationAgent,
        _params: &Parameters,
        _services: &TurnServices<'_>,
    ) -> Result<()> {
        let answer = faq_answer(agent.raw_query());
        agent.append_reply(answer);
        Ok(())
    }
}
