//! Ledger persistence
//!
//! Stores are keyed by user id and versioned: every save names the version
//! it read, and a store refuses the write when someone else got there first.

use crate::error::AssistantError;
use crate::models::Account;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// An account together with the version it was read at
#[derive(Debug, Clone)]
pub struct StoredAccount {
    pub account: Account,
    pub version: u64,
}

/// Trait for ledger persistence
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    async fn load(&self, user_id: &str) -> Result<Option<StoredAccount>>;

    /// Persist `account`. `expected_version` is `None` for a first insert and
    /// otherwise the version returned by `load`. Returns the new version, or
    /// `StorageConflict` if the stored version moved.
    async fn save(&self, account: &Account, expected_version: Option<u64>) -> Result<u64>;

    fn backend_name(&self) -> &'static str;
}

pub(crate) fn conflict(user_id: &str, expected: Option<u64>, found: Option<u64>) -> AssistantError {
    AssistantError::StorageConflict(format!(
        "account {} expected version {:?}, found {:?}",
        user_id, expected, found
    ))
}

/// In-memory ledger store for development and tests
pub struct InMemoryLedgerStore {
    accounts: Arc<RwLock<HashMap<String, StoredAccount>>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            accounts: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn load(&self, user_id: &str) -> Result<Option<StoredAccount>> {
        let accounts = self.accounts.read().await;
        Ok(accounts.get(user_id).cloned())
    }

    async fn save(&self, account: &Account, expected_version: Option<u64>) -> Result<u64> {
        let mut accounts = self.accounts.write().await;
        let current = accounts.get(&account.user_id).map(|stored| stored.version);

        if current != expected_version {
            return Err(conflict(&account.user_id, expected_version, current));
        }

        let version = current.unwrap_or(0) + 1;
        accounts.insert(
            account.user_id.clone(),
            StoredAccount {
                account: account.clone(),
                version,
            },
        );

        Ok(version)
    }

    fn backend_name(&self) -> &'static str {
        "in-memory"
    }
}
