//! Whole-file JSON ledger
//!
//! Keeps the `{ "users": [...] }` layout on disk. Every operation reads and
//! rewrites the full document under one async mutex, so this backend is
//! only suitable for a single process at small scale.

use crate::error::AssistantError;
use crate::ledger::store::{conflict, LedgerStore, StoredAccount};
use crate::models::{Account, LedgerDocument};
use crate::Result;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct JsonFileLedgerStore {
    path: PathBuf,
    /// Versions handed out by this process, keyed by user id.
    /// Accounts present on disk but never saved here are at version 0.
    versions: Mutex<HashMap<String, u64>>,
}

impl JsonFileLedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            versions: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<LedgerDocument> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(LedgerDocument::default()),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                AssistantError::StorageIo(format!(
                    "Failed to parse ledger {}: {}",
                    self.path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "Ledger file missing, initialising empty ledger");
                let empty = LedgerDocument::default();
                self.write_document(&empty).await?;
                Ok(empty)
            }
            Err(e) => Err(AssistantError::StorageIo(format!(
                "Failed to read ledger {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    /// Write to a sibling temp file, then rename it into place
    async fn write_document(&self, doc: &LedgerDocument) -> Result<()> {
        let body = serde_json::to_string_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AssistantError::StorageIo(format!("Failed to create ledger dir: {}", e)))?;
        }

        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| AssistantError::StorageIo(format!("Failed to write ledger: {}", e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| AssistantError::StorageIo(format!("Failed to replace ledger: {}", e)))?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl LedgerStore for JsonFileLedgerStore {
    async fn load(&self, user_id: &str) -> Result<Option<StoredAccount>> {
        let versions = self.versions.lock().await;
        let doc = self.read_document().await?;

        Ok(doc
            .users
            .into_iter()
            .find(|account| account.user_id == user_id)
            .map(|account| StoredAccount {
                version: versions.get(user_id).copied().unwrap_or(0),
                account,
            }))
    }

    async fn save(&self, account: &Account, expected_version: Option<u64>) -> Result<u64> {
        let mut versions = self.versions.lock().await;
        let mut doc = self.read_document().await?;

        let index = doc.users.iter().position(|a| a.user_id == account.user_id);
        let current = index.map(|_| versions.get(&account.user_id).copied().unwrap_or(0));

        if current != expected_version {
            return Err(conflict(&account.user_id, expected_version, current));
        }

        match index {
            Some(i) => doc.users[i] = account.clone(),
            None => doc.users.push(account.clone()),
        }
        self.write_document(&doc).await?;

        let version = current.map(|v| v + 1).unwrap_or(1);
        versions.insert(account.user_id.clone(), version);

        debug!(user_id = %account.user_id, version, "Ledger file rewritten");
        Ok(version)
    }

    fn backend_name(&self) -> &'static str {
        "json-file"
    }
}
