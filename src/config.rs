//! Runtime configuration from the environment (and `.env`)

use crate::agent::Assistant;
use crate::catalog::FundCatalog;
use crate::error::AssistantError;
use crate::intents::shared_registry;
use crate::ledger::{
    InMemoryLedgerStore, JsonFileLedgerStore, LedgerStore, PortfolioLedger, PostgresLedgerStore,
    RetryPolicy,
};
use crate::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_LEDGER_PATH: &str = "/tmp/portfolio_db.json";
pub const DEFAULT_CATALOG_PATH: &str = "data/fund_data.json";
pub const DEFAULT_INITIAL_BALANCE: Decimal = dec!(10000.00);

const POSTGRES_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerBackend {
    Memory,
    File,
    Postgres,
}

impl FromStr for LedgerBackend {
    type Err = AssistantError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "in-memory" => Ok(LedgerBackend::Memory),
            "file" | "json" => Ok(LedgerBackend::File),
            "postgres" | "postgresql" => Ok(LedgerBackend::Postgres),
            other => Err(AssistantError::Config(format!(
                "LEDGER_BACKEND must be memory, file or postgres, got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssistantConfig {
    pub port: u16,
    pub ledger_backend: LedgerBackend,
    pub ledger_path: PathBuf,
    pub database_url: Option<String>,
    pub fund_catalog_path: PathBuf,
    pub initial_balance: Decimal,
    pub retry: RetryPolicy,
}

impl AssistantConfig {
    /// Read the process environment after loading `.env`, if present
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset and blank keys take their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match get("PORT").or_else(|| get("API_PORT")) {
            Some(raw) => parse_var("PORT", &raw)?,
            None => DEFAULT_PORT,
        };

        let database_url = get("DATABASE_URL").or_else(|| get("POSTGRES_URL"));

        let ledger_backend = match get("LEDGER_BACKEND") {
            Some(raw) => raw.parse()?,
            None if database_url.is_some() => LedgerBackend::Postgres,
            None => LedgerBackend::File,
        };

        if ledger_backend == LedgerBackend::Postgres && database_url.is_none() {
            return Err(AssistantError::Config(
                "LEDGER_BACKEND=postgres needs DATABASE_URL or POSTGRES_URL".to_string(),
            ));
        }

        let initial_balance: Decimal = match get("INITIAL_BALANCE") {
            Some(raw) => parse_var("INITIAL_BALANCE", &raw)?,
            None => DEFAULT_INITIAL_BALANCE,
        };
        if initial_balance < Decimal::ZERO {
            return Err(AssistantError::Config(format!(
                "INITIAL_BALANCE must not be negative, got {}",
                initial_balance
            )));
        }

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_io_retries: match get("STORAGE_MAX_RETRIES") {
                Some(raw) => parse_var("STORAGE_MAX_RETRIES", &raw)?,
                None => defaults.max_io_retries,
            },
            backoff: match get("STORAGE_RETRY_BACKOFF_MS") {
                Some(raw) => Duration::from_millis(parse_var("STORAGE_RETRY_BACKOFF_MS", &raw)?),
                None => defaults.backoff,
            },
            max_conflict_retries: defaults.max_conflict_retries,
        };

        Ok(Self {
            port,
            ledger_backend,
            ledger_path: get("LEDGER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LEDGER_PATH)),
            database_url,
            fund_catalog_path: get("FUND_CATALOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG_PATH)),
            initial_balance,
            retry,
        })
    }

    pub fn build_ledger(&self) -> Result<PortfolioLedger> {
        let store: Arc<dyn LedgerStore> = match self.ledger_backend {
            LedgerBackend::Memory => Arc::new(InMemoryLedgerStore::new()),
            LedgerBackend::File => Arc::new(JsonFileLedgerStore::new(&self.ledger_path)),
            LedgerBackend::Postgres => {
                let url = self.database_url.as_deref().ok_or_else(|| {
                    AssistantError::Config("DATABASE_URL is not set".to_string())
                })?;
                Arc::new(PostgresLedgerStore::connect_lazy(url, POSTGRES_MAX_CONNECTIONS)?)
            }
        };
        Ok(PortfolioLedger::with_retry_policy(store, self.retry.clone()))
    }

    pub fn load_catalog(&self) -> Result<FundCatalog> {
        FundCatalog::from_file(&self.fund_catalog_path)
    }

    /// Wire the ledger, catalog and shared intent registry together
    pub fn build_assistant(&self) -> Result<Assistant> {
        let ledger = self.build_ledger()?;
        let catalog = self.load_catalog()?;

        info!(
            backend = ?self.ledger_backend,
            funds = catalog.len(),
            initial_balance = %self.initial_balance,
            "Assistant configured"
        );

        Ok(Assistant::new(
            shared_registry(),
            Arc::new(ledger),
            Arc::new(catalog),
            self.initial_balance,
        ))
    }
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| AssistantError::Config(format!("{} has an invalid value: '{}'", key, raw)))
}
