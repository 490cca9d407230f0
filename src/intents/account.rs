//! Ledger-backed intents: balance, fund details, purchase and redemption

use crate::agent::ConversationAgent;
use crate::error::AssistantError;
use crate::intents::{amount_param, fund_name_param, IntentHandler, TurnServices};
use crate::ledger::value_account;
use crate::models::{Fund, Parameters};
use crate::Result;
use tracing::info;

const NO_ACCOUNT_REPLY: &str =
    "You'll need an account before you can trade. Say \"create account\" and I'll set one up for you.";

fn ask_for_fund(agent: &mut dyn ConversationAgent, services: &TurnServices<'_>, verb: &str) {
    let names: Vec<&str> = services.catalog.names().collect();
    agent.append_reply(&format!(
        "Which fund would you like to {}? Available funds: {}.",
        verb,
        names.join(", ")
    ));
}

fn lookup_fund<'a>(services: &'a TurnServices<'_>, name: &str) -> Result<&'a Fund> {
    services
        .catalog
        .get(name)
        .ok_or_else(|| AssistantError::FundNotFound(name.to_string()))
}

/// Purchases and redemptions need an account; say so instead of failing
async fn has_account(agent: &mut dyn ConversationAgent, services: &TurnServices<'_>) -> Result<bool> {
    if services.ledger.find_account(services.user_id).await?.is_some() {
        return Ok(true);
    }
    agent.append_reply(NO_ACCOUNT_REPLY);
    Ok(false)
}

pub struct CheckBalanceHandler;

#[async_trait::async_trait]
impl IntentHandler for CheckBalanceHandler {
    fn name(&self) -> &'static str {
        "check_balance"
    }

    async fn handle(
        &self,
        agent: &mut dyn ConversationAgent,
        _params: &Parameters,
        services: &TurnServices<'_>,
    ) -> Result<()> {
        let account = services.ledger.get_account(services.user_id).await?;
        let value = value_account(&account, services.catalog);

        let mut reply = format!(
            "Your cash balance is ${:.2}. Your investments are worth ${:.2}, for a total of ${:.2}.",
            value.cash_balance, value.investment_value, value.total_balance
        );

        for position in &account.investments {
            reply.push_str(&format!(
                "\n- {}: {} units",
                position.fund_name,
                position.units.normalize()
            ));
        }

        if !value.missing_funds.is_empty() {
            reply.push_str(&format!(
                "\nNote: current prices are unavailable for {}, so they are not included in the total.",
                value.missing_funds.join(", ")
            ));
        }

        reply.push_str("\nWould you like to explore investment options?");
        agent.append_reply(&reply);
        Ok(())
    }
}

pub struct FundDetailsHandler;

#[async_trait::async_trait]
impl IntentHandler for FundDetailsHandler {
    fn name(&self) -> &'static str {
        "fund_details"
    }

    async fn handle(
        &self,
        agent: &mut dyn ConversationAgent,
        params: &Parameters,
        services: &TurnServices<'_>,
    ) -> Result<()> {
        let Some(name) = fund_name_param(params) else {
            ask_for_fund(agent, services, "know more about");
            return Ok(());
        };

        let fund = lookup_fund(services, &name)?;
        agent.append_reply(&format!(
            "Details for {}:\n- Current NAV: ${:.2}\n- Performance: {}\n- Minimum Investment: ${:.2}\nWould you like to invest in this fund?",
            fund.name, fund.nav, fund.performance, fund.min_investment
        ));
        Ok(())
    }
}

pub struct PurchaseFundHandler;

#[async_trait::async_trait]
impl IntentHandler for PurchaseFundHandler {
    fn name(&self) -> &'static str {
        "purchase_fund"
    }

    async fn handle(
        &self,
        agent: &mut dyn ConversationAgent,
        params: &Parameters,
        services: &TurnServices<'_>,
    ) -> Result<()> {
        if !has_account(agent, services).await? {
            return Ok(());
        }

        let Some(name) = fund_name_param(params) else {
            ask_for_fund(agent, services, "invest in");
            return Ok(());
        };
        let fund = lookup_fund(services, &name)?;
        let amount = amount_param(params)?;

        if amount < fund.min_investment {
            agent.append_reply(&format!(
                "The minimum investment for {} is ${:.2}. Please specify a higher amount.",
                fund.name, fund.min_investment
            ));
            return Ok(());
        }

        let receipt = services
            .ledger
            .invest(services.user_id, &fund.name, amount, fund.nav)
            .await?;

        info!(user_id = %services.user_id, fund = %fund.name, "Purchase completed");
        agent.append_reply(&format!(
            "Your purchase of ${:.2} in {} has been processed: {} units at a NAV of ${:.2}. Your remaining cash balance is ${:.2}.",
            amount,
            fund.name,
            receipt.units_purchased.normalize(),
            receipt.nav,
            receipt.remaining_balance
        ));
        Ok(())
    }
}

pub struct RedeemFundHandler;

#[async_trait::async_trait]
impl IntentHandler for RedeemFundHandler {
    fn name(&self) -> &'static str {
        "redeem_fund"
    }

    async fn handle(
        &self,
        agent: &mut dyn ConversationAgent,
        params: &Parameters,
        services: &TurnServices<'_>,
    ) -> Result<()> {
        if !has_account(agent, services).await? {
            return Ok(());
        }

        let Some(name) = fund_name_param(params) else {
            ask_for_fund(agent, services, "redeem from");
            return Ok(());
        };
        let fund = lookup_fund(services, &name)?;
        let amount = amount_param(params)?;

        let receipt = services
            .ledger
            .redeem(services.user_id, &fund.name, amount, fund.nav)
            .await?;

        info!(user_id = %services.user_id, fund = %fund.name, "Redemption completed");
        let mut reply = format!(
            "Your redemption of ${:.2} from {} has been processed: {} units at a NAV of ${:.2}. Your cash balance is now ${:.2}.",
            amount,
            fund.name,
            receipt.units_redeemed.normalize(),
            receipt.nav,
            receipt.new_balance
        );
        if receipt.remaining_units.is_zero() {
            reply.push_str(&format!(" You no longer hold any units of {}.", fund.name));
        }
        agent.append_reply(&reply);
        Ok(())
    }
}
