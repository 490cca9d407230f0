//! Postgres-backed ledger store
//!
//! One row per account. The account body is stored as the same JSON
//! document the file backend uses; `version` drives compare-and-swap.

use crate::error::AssistantError;
use crate::ledger::store::{conflict, LedgerStore, StoredAccount};
use crate::models::Account;
use crate::Result;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

pub struct PostgresLedgerStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    /// Build a lazily-connecting pool for `url`
    pub fn connect_lazy(url: &str, max_connections: u32) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)?;

        info!("Ledger backend: postgres");
        Ok(Self::new(pool))
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS ledger_accounts (
                      user_id TEXT PRIMARY KEY,
                      version BIGINT NOT NULL,
                      document TEXT NOT NULL,
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                AssistantError::StorageIo(format!("Failed to initialize ledger schema: {}", e))
            })?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn load(&self, user_id: &str) -> Result<Option<StoredAccount>> {
        self.ensure_schema().await?;

        let row = sqlx::query("SELECT version, document FROM ledger_accounts WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let version: i64 = row.try_get("version")?;
        let document: String = row.try_get("document")?;
        let account: Account = serde_json::from_str(&document).map_err(|e| {
            AssistantError::StorageIo(format!("Corrupt ledger row for {}: {}", user_id, e))
        })?;

        Ok(Some(StoredAccount {
            account,
            version: version.max(0) as u64,
        }))
    }

    async fn save(&self, account: &Account, expected_version: Option<u64>) -> Result<u64> {
        self.ensure_schema().await?;

        let document = serde_json::to_string(account)?;

        let affected = match expected_version {
            None => sqlx::query(
                r#"
                INSERT INTO ledger_accounts (user_id, version, document)
                VALUES ($1, 1, $2)
                ON CONFLICT (user_id) DO NOTHING
                "#,
            )
            .bind(&account.user_id)
            .bind(&document)
            .execute(&self.pool)
            .await?
            .rows_affected(),
            Some(version) => sqlx::query(
                r#"
                UPDATE ledger_accounts
                SET version = version + 1, document = $2, updated_at = NOW()
                WHERE user_id = $1 AND version = $3
                "#,
            )
            .bind(&account.user_id)
            .bind(&document)
            .bind(version as i64)
            .execute(&self.pool)
            .await?
            .rows_affected(),
        };

        if affected == 0 {
            return Err(conflict(&account.user_id, expected_version, None));
        }

        Ok(expected_version.map(|v| v + 1).unwrap_or(1))
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
