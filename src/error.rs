//! Error types for the fund assistant

use rust_decimal::Decimal;
use thiserror::Error;

/// Result type alias for assistant operations
pub type Result<T> = std::result::Result<T, AssistantError>;

#[derive(Error, Debug)]
pub enum AssistantError {

    // =============================
    // Ledger Errors
    // =============================

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Account already exists: {0}")]
    AccountAlreadyExists(String),

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        requested: Decimal,
        available: Decimal,
    },

    #[error("Insufficient units in {fund_name}: requested {requested}, held {held}")]
    InsufficientUnits {
        fund_name: String,
        requested: Decimal,
        held: Decimal,
    },

    #[error("Fund not found: {0}")]
    FundNotFound(String),

    #[error("No position found in {0}")]
    PositionNotFound(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    // =============================
    // Dialogue Errors
    // =============================

    #[error("Validation error: {0}")]
    ValidationError(String),

    // =============================
    // Storage Errors
    // =============================

    #[error("Storage I/O error: {0}")]
    StorageIo(String),

    #[error("Storage conflict: {0}")]
    StorageConflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<sqlx::Error> for AssistantError {
    fn from(e: sqlx::Error) -> Self {
        AssistantError::StorageIo(format!("database: {}", e))
    }
}

impl AssistantError {
    /// Storage failures that the ledger re-runs before giving up
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AssistantError::StorageIo(_)
                | AssistantError::StorageConflict(_)
                | AssistantError::IoError(_)
        )
    }

    /// Reply text shown to the end user: what went wrong and what to do next.
    pub fn user_message(&self) -> String {
        match self {
            AssistantError::UserNotFound(_) => {
                "I couldn't find an account for you. Say \"create account\" to open one with a starting balance.".to_string()
            }
            AssistantError::AccountAlreadyExists(_) => {
                "You already have an account with us. You can check your balance or invest in a fund.".to_string()
            }
            AssistantError::InsufficientBalance { requested, available } => format!(
                "You don't have enough cash for that. You asked for ${:.2} but your available balance is ${:.2}. Please try a smaller amount.",
                requested, available
            ),
            AssistantError::InsufficientUnits { fund_name, requested, held } => format!(
                "You only hold {} units of {}, but that redemption needs {} units. Please try a smaller amount.",
                held.normalize(),
                fund_name,
                requested.normalize()
            ),
            AssistantError::FundNotFound(name) => format!(
                "Sorry, I couldn't find {}. Please check the fund name and try again.",
                name
            ),
            AssistantError::PositionNotFound(name) => format!(
                "You don't have any investment in {}. Ask for your balance to see your holdings.",
                name
            ),
            AssistantError::InvalidAmount(detail) => format!(
                "That amount doesn't look right ({}). Please give a positive amount, for example \"500\".",
                detail
            ),
            AssistantError::ValidationError(detail) => detail.clone(),
            AssistantError::StorageConflict(_) => {
                "Your account was being updated by another request. Please try again.".to_string()
            }
            _ => "Something went wrong on our side. Please try again in a moment.".to_string(),
        }
    }
}
