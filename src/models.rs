//! Core data models for the fund assistant

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Slot values and intent parameters, as delivered by the NLU layer
pub type Parameters = serde_json::Map<String, Value>;

//
// ================= Ledger =================
//

/// One holding of fund units. At most one per fund per account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub fund_name: String,
    pub units: Decimal,
    /// Unit-weighted average NAV paid across all purchases of this fund
    pub purchase_nav: Decimal,
    /// Date of the first purchase
    pub purchase_date: NaiveDate,
}

/// Details collected during onboarding, stored alongside the account
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountProfile {
    pub name: Option<String>,
    pub mobile: Option<String>,
    pub age: Option<u32>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub user_id: String,
    #[serde(rename = "balance")]
    pub cash_balance: Decimal,
    /// Insertion order is purchase order
    #[serde(default)]
    pub investments: Vec<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<AccountProfile>,
    /// Id of the last ledger operation written to this account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transaction_id: Option<Uuid>,
}

impl Account {
    pub fn new(user_id: impl Into<String>, initial_balance: Decimal) -> Self {
        Self {
            user_id: user_id.into(),
            cash_balance: initial_balance,
            investments: Vec::new(),
            profile: None,
            last_transaction_id: None,
        }
    }

    pub fn position(&self, fund_name: &str) -> Option<&Position> {
        self.investments.iter().find(|p| p.fund_name == fund_name)
    }

    pub fn position_mut(&mut self, fund_name: &str) -> Option<&mut Position> {
        self.investments.iter_mut().find(|p| p.fund_name == fund_name)
    }
}

/// At-rest document for whole-file ledger storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerDocument {
    #[serde(default)]
    pub users: Vec<Account>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestmentReceipt {
    pub transaction_id: Uuid,
    pub fund_name: String,
    pub nav: Decimal,
    pub units_purchased: Decimal,
    pub remaining_balance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionReceipt {
    pub transaction_id: Uuid,
    pub fund_name: String,
    pub nav: Decimal,
    pub units_redeemed: Decimal,
    /// Units still held after the redemption; zero means the position was closed
    pub remaining_units: Decimal,
    pub new_balance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioValuation {
    pub cash_balance: Decimal,
    pub investment_value: Decimal,
    pub total_balance: Decimal,
    /// Held funds that the catalog no longer lists; excluded from the value
    pub missing_funds: Vec<String>,
}

//
// ================= Fund Catalog =================
//

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fund {
    #[serde(default)]
    pub name: String,
    pub nav: Decimal,
    pub min_investment: Decimal,
    pub performance: String,
}

//
// ================= Turn I/O =================
//

/// A context the caller reports as active for this session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveContext {
    pub name: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub lifespan: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub session_id: String,
    /// Account identity; the session id is used when absent
    #[serde(default)]
    pub user_id: Option<String>,
    pub intent_name: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub raw_query_text: String,
    #[serde(default)]
    pub contexts: Vec<ActiveContext>,
}

impl TurnRequest {
    pub fn new(session_id: impl Into<String>, intent_name: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: None,
            intent_name: intent_name.into(),
            parameters: Parameters::new(),
            raw_query_text: String::new(),
            contexts: Vec::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn with_query(mut self, text: impl Into<String>) -> Self {
        self.raw_query_text = text.into();
        self
    }

    pub fn user_id(&self) -> &str {
        self.user_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or(&self.session_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMutation {
    pub name: String,
    pub parameters: Parameters,
    /// Zero clears the context
    pub lifespan: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResponse {
    pub reply_text: String,
    pub context_mutations: Vec<ContextMutation>,
}
