//! Portfolio ledger
//!
//! Per-user cash and fund positions. Every mutation is a
//! read → validate → mutate → persist cycle run under that user's lock,
//! so two turns for the same user never interleave. Different users
//! never wait on each other.

pub mod file;
pub mod postgres;
pub mod store;

pub use file::JsonFileLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use store::{InMemoryLedgerStore, LedgerStore, StoredAccount};

use crate::catalog::FundCatalog;
use crate::error::AssistantError;
use crate::models::{
    Account, AccountProfile, InvestmentReceipt, PortfolioValuation, Position, RedemptionReceipt,
};
use crate::Result;
use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Decimal places kept on unit quantities and average NAV
pub const UNIT_SCALE: u32 = 6;

/// How hard the ledger tries before surfacing a storage failure
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_io_retries: u32,
    pub backoff: Duration,
    pub max_conflict_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_io_retries: 3,
            backoff: Duration::from_millis(50),
            max_conflict_retries: 2,
        }
    }
}

/// Outcome of the mutation closure inside a ledger transaction
enum Change<T> {
    Write(Account, T),
    Keep(T),
}

pub struct PortfolioLedger {
    store: Arc<dyn LedgerStore>,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    retry: RetryPolicy,
}

impl PortfolioLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self::with_retry_policy(store, RetryPolicy::default())
    }

    pub fn with_retry_policy(store: Arc<dyn LedgerStore>, retry: RetryPolicy) -> Self {
        info!(backend = store.backend_name(), "Portfolio ledger initialized");
        Self {
            store,
            user_locks: Mutex::new(HashMap::new()),
            retry,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryLedgerStore::new()))
    }

    // =============================
    // Queries
    // =============================

    pub async fn find_account(&self, user_id: &str) -> Result<Option<Account>> {
        let stored = self.load_with_retry(user_id).await?;
        Ok(stored.map(|s| s.account))
    }

    pub async fn get_account(&self, user_id: &str) -> Result<Account> {
        self.find_account(user_id)
            .await?
            .ok_or_else(|| AssistantError::UserNotFound(user_id.to_string()))
    }

    /// Cash plus the catalog value of every position; see [`value_account`]
    pub async fn portfolio_value(
        &self,
        user_id: &str,
        catalog: &FundCatalog,
    ) -> Result<PortfolioValuation> {
        let account = self.get_account(user_id).await?;
        Ok(value_account(&account, catalog))
    }

    // =============================
    // Mutations
    // =============================

    /// Open an account, or return the existing one untouched.
    ///
    /// Retried onboarding turns land here twice; the second call is a no-op.
    pub async fn create_account(
        &self,
        user_id: &str,
        initial_balance: Decimal,
        profile: Option<AccountProfile>,
    ) -> Result<Account> {
        if initial_balance < Decimal::ZERO {
            return Err(AssistantError::InvalidAmount(format!(
                "initial balance {} is negative",
                initial_balance
            )));
        }

        self.transact(user_id, "create_account", |existing, _| match existing {
            Some(account) => {
                info!(user_id = %user_id, "Account already exists, keeping it");
                Ok(Change::Keep(account))
            }
            None => {
                let mut account = Account::new(user_id, initial_balance);
                account.profile = profile.clone();
                Ok(Change::Write(account.clone(), account))
            }
        })
        .await
    }

    /// Open an account, failing with `AccountAlreadyExists` if one is there
    pub async fn open_account(&self, user_id: &str, initial_balance: Decimal) -> Result<Account> {
        self.transact(user_id, "open_account", |existing, _| match existing {
            Some(_) => Err(AssistantError::AccountAlreadyExists(user_id.to_string())),
            None => {
                let account = Account::new(user_id, initial_balance);
                Ok(Change::Write(account.clone(), account))
            }
        })
        .await
    }

    /// Buy `amount` of cash worth of `fund_name` at `nav`.
    ///
    /// Units are rounded toward zero, so a purchase never yields more units
    /// than the cash pays for. A repeat purchase adds to the existing
    /// position and moves its `purchase_nav` to the unit-weighted average.
    pub async fn invest(
        &self,
        user_id: &str,
        fund_name: &str,
        amount: Decimal,
        nav: Decimal,
    ) -> Result<InvestmentReceipt> {
        ensure_positive("amount", amount)?;
        ensure_positive("NAV", nav)?;
        let units = units_for(amount, nav, RoundingStrategy::ToZero)?;

        let receipt = self
            .transact(user_id, "invest", |existing, transaction_id| {
                let mut account =
                    existing.ok_or_else(|| AssistantError::UserNotFound(user_id.to_string()))?;

                if amount > account.cash_balance {
                    return Err(AssistantError::InsufficientBalance {
                        requested: amount,
                        available: account.cash_balance,
                    });
                }

                account.cash_balance -= amount;

                match account.position_mut(fund_name) {
                    Some(position) => {
                        let total_units = position.units + units;
                        let cost = position.units * position.purchase_nav + amount;
                        position.purchase_nav = (cost / total_units).round_dp(UNIT_SCALE);
                        position.units = total_units;
                    }
                    None => account.investments.push(Position {
                        fund_name: fund_name.to_string(),
                        units,
                        purchase_nav: nav,
                        purchase_date: Utc::now().date_naive(),
                    }),
                }

                let receipt = InvestmentReceipt {
                    transaction_id,
                    fund_name: fund_name.to_string(),
                    nav,
                    units_purchased: units,
                    remaining_balance: account.cash_balance,
                };
                Ok(Change::Write(account, receipt))
            })
            .await?;

        info!(
            user_id = %user_id,
            fund = %fund_name,
            %amount,
            units = %receipt.units_purchased,
            balance = %receipt.remaining_balance,
            transaction_id = %receipt.transaction_id,
            "Investment recorded"
        );

        Ok(receipt)
    }

    /// Sell `amount` of cash worth of `fund_name` at `nav`.
    ///
    /// Units are rounded away from zero, so the units given up are always
    /// worth at least the cash paid out. The position is removed once its
    /// units reach exactly zero.
    pub async fn redeem(
        &self,
        user_id: &str,
        fund_name: &str,
        amount: Decimal,
        nav: Decimal,
    ) -> Result<RedemptionReceipt> {
        ensure_positive("amount", amount)?;
        ensure_positive("NAV", nav)?;
        let units = units_for(amount, nav, RoundingStrategy::AwayFromZero)?;

        let receipt = self
            .transact(user_id, "redeem", |existing, transaction_id| {
                let mut account =
                    existing.ok_or_else(|| AssistantError::UserNotFound(user_id.to_string()))?;

                let position = account
                    .position_mut(fund_name)
                    .ok_or_else(|| AssistantError::PositionNotFound(fund_name.to_string()))?;

                if units > position.units {
                    return Err(AssistantError::InsufficientUnits {
                        fund_name: fund_name.to_string(),
                        requested: units,
                        held: position.units,
                    });
                }

                position.units -= units;
                let remaining_units = position.units;

                if remaining_units.is_zero() {
                    account.investments.retain(|p| p.fund_name != fund_name);
                }
                account.cash_balance += amount;

                let receipt = RedemptionReceipt {
                    transaction_id,
                    fund_name: fund_name.to_string(),
                    nav,
                    units_redeemed: units,
                    remaining_units,
                    new_balance: account.cash_balance,
                };
                Ok(Change::Write(account, receipt))
            })
            .await?;

        info!(
            user_id = %user_id,
            fund = %fund_name,
            %amount,
            units = %receipt.units_redeemed,
            balance = %receipt.new_balance,
            transaction_id = %receipt.transaction_id,
            "Redemption recorded"
        );

        Ok(receipt)
    }

    // =============================
    // Transaction plumbing
    // =============================

    async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget a user's lock once nobody holds or waits on it
    async fn release_user_lock(&self, user_id: &str) {
        let mut locks = self.user_locks.lock().await;
        // Handles are only cloned under the map lock, so a count of one
        // means the map holds the last reference.
        if locks
            .get(user_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(user_id);
        }
    }

    /// Run one read-modify-write for `user_id` under that user's lock.
    ///
    /// `apply` receives the stored account and the operation id; the id is
    /// written into the account so a commit whose response was lost can be
    /// recognised instead of applied twice.
    async fn transact<T, F>(&self, user_id: &str, op: &'static str, apply: F) -> Result<T>
    where
        F: FnMut(Option<Account>, Uuid) -> Result<Change<T>>,
    {
        let lock = self.user_lock(user_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.transact_locked(user_id, op, apply).await
        };
        drop(lock);
        self.release_user_lock(user_id).await;
        result
    }

    /// A `StorageConflict` from the store (another process wrote first)
    /// re-runs the cycle on fresh state, up to `max_conflict_retries` times.
    async fn transact_locked<T, F>(&self, user_id: &str, op: &'static str, mut apply: F) -> Result<T>
    where
        F: FnMut(Option<Account>, Uuid) -> Result<Change<T>>,
    {
        let transaction_id = Uuid::new_v4();
        let mut conflicts = 0;
        loop {
            let stored = self.load_with_retry(user_id).await?;
            let version = stored.as_ref().map(|s| s.version);

            let (mut account, output) = match apply(stored.map(|s| s.account), transaction_id)? {
                Change::Keep(output) => return Ok(output),
                Change::Write(account, output) => (account, output),
            };
            account.last_transaction_id = Some(transaction_id);

            match self.commit(&account, version, op).await {
                Ok(new_version) => {
                    debug!(user_id = %user_id, op, version = new_version, %transaction_id, "Ledger write committed");
                    return Ok(output);
                }
                Err(AssistantError::StorageConflict(detail))
                    if conflicts < self.retry.max_conflict_retries =>
                {
                    conflicts += 1;
                    warn!(user_id = %user_id, op, attempt = conflicts, %detail, "Ledger write conflict, re-running");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Save with I/O retries.
    ///
    /// After a failed attempt the write may still have landed. A conflict
    /// on the retry is then checked against the stored operation id before
    /// it is reported.
    async fn commit(&self, account: &Account, version: Option<u64>, op: &str) -> Result<u64> {
        let mut attempt = 0;
        loop {
            match self.store.save(account, version).await {
                Ok(new_version) => return Ok(new_version),
                Err(e @ (AssistantError::StorageIo(_) | AssistantError::IoError(_)))
                    if attempt < self.retry.max_io_retries =>
                {
                    attempt += 1;
                    warn!(op, attempt, error = %e, "Ledger save failed, retrying");
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                }
                Err(AssistantError::StorageConflict(detail)) if attempt > 0 => {
                    if let Some(landed) = self.committed_version(account).await? {
                        info!(user_id = %account.user_id, op, version = landed, "Earlier save had committed");
                        return Ok(landed);
                    }
                    return Err(AssistantError::StorageConflict(detail));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stored version if the store already holds exactly this operation
    async fn committed_version(&self, account: &Account) -> Result<Option<u64>> {
        let stored = self.load_with_retry(&account.user_id).await?;
        Ok(stored
            .filter(|s| {
                s.account.last_transaction_id.is_some()
                    && s.account.last_transaction_id == account.last_transaction_id
            })
            .map(|s| s.version))
    }

    async fn load_with_retry(&self, user_id: &str) -> Result<Option<StoredAccount>> {
        self.with_io_retry("load", || self.store.load(user_id)).await
    }

    /// Re-run `call` on I/O failures with linear backoff
    async fn with_io_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(e @ (AssistantError::StorageIo(_) | AssistantError::IoError(_)))
                    if attempt < self.retry.max_io_retries =>
                {
                    attempt += 1;
                    warn!(op, attempt, error = %e, "Ledger storage I/O failed, retrying");
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                }
                other => return other,
            }
        }
    }
}

/// Cash plus the catalog value of every position in `account`.
///
/// Positions in funds the catalog no longer lists are left out of
/// `investment_value` and named in `missing_funds`.
pub fn value_account(account: &Account, catalog: &FundCatalog) -> PortfolioValuation {
    let mut investment_value = Decimal::ZERO;
    let mut missing_funds = Vec::new();

    for position in &account.investments {
        match catalog.get(&position.fund_name) {
            Some(fund) => investment_value += position.units * fund.nav,
            None => missing_funds.push(position.fund_name.clone()),
        }
    }

    if !missing_funds.is_empty() {
        warn!(
            user_id = %account.user_id,
            ?missing_funds,
            "Positions held in funds missing from catalog"
        );
    }

    PortfolioValuation {
        cash_balance: account.cash_balance,
        investment_value,
        total_balance: account.cash_balance + investment_value,
        missing_funds,
    }
}

fn ensure_positive(label: &str, value: Decimal) -> Result<()> {
    if value <= Decimal::ZERO {
        return Err(AssistantError::InvalidAmount(format!(
            "{} must be positive, got {}",
            label, value
        )));
    }
    Ok(())
}

/// `amount / nav`, rounded to `UNIT_SCALE` with `strategy`
fn units_for(amount: Decimal, nav: Decimal, strategy: RoundingStrategy) -> Result<Decimal> {
    let units = amount
        .checked_div(nav)
        .ok_or_else(|| AssistantError::InvalidAmount(format!("{} / {} overflows", amount, nav)))?
        .round_dp_with_strategy(UNIT_SCALE, strategy);

    if units.is_zero() {
        return Err(AssistantError::InvalidAmount(format!(
            "{} is too small to buy or sell any units at NAV {}",
            amount, nav
        )));
    }
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Fund;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use super::store::conflict;

    async fn ledger_with_account(balance: Decimal) -> PortfolioLedger {
        let ledger = PortfolioLedger::in_memory();
        ledger.create_account("u1", balance, None).await.unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_invest_debits_cash_and_credits_units() {
        let ledger = ledger_with_account(dec!(10000)).await;

        let receipt = ledger.invest("u1", "Growth Fund", dec!(2000), dec!(20)).await.unwrap();
        assert_eq!(receipt.units_purchased, dec!(100));
        assert_eq!(receipt.remaining_balance, dec!(8000));

        let account = ledger.get_account("u1").await.unwrap();
        assert_eq!(account.cash_balance, dec!(8000));
        assert_eq!(account.position("Growth Fund").unwrap().units, dec!(100));
    }

    #[tokio::test]
    async fn test_repeat_purchase_averages_cost() {
        let ledger = ledger_with_account(dec!(10000)).await;

        ledger.invest("u1", "Growth Fund", dec!(1000), dec!(10)).await.unwrap();
        ledger.invest("u1", "Growth Fund", dec!(2000), dec!(20)).await.unwrap();

        let account = ledger.get_account("u1").await.unwrap();
        assert_eq!(account.investments.len(), 1);
        let position = account.position("Growth Fund").unwrap();
        assert_eq!(position.units, dec!(200));
        assert_eq!(position.purchase_nav, dec!(15));
    }

    #[tokio::test]
    async fn test_invest_rejects_overdraft() {
        let ledger = ledger_with_account(dec!(100)).await;

        let err = ledger.invest("u1", "Growth Fund", dec!(150), dec!(10)).await.unwrap_err();
        assert!(matches!(err, AssistantError::InsufficientBalance { .. }));
        assert_eq!(ledger.get_account("u1").await.unwrap().cash_balance, dec!(100));
    }

    #[tokio::test]
    async fn test_invest_rejects_non_positive_amount() {
        let ledger = ledger_with_account(dec!(100)).await;

        for amount in [dec!(0), dec!(-5)] {
            let err = ledger.invest("u1", "Growth Fund", amount, dec!(10)).await.unwrap_err();
            assert!(matches!(err, AssistantError::InvalidAmount(_)));
        }
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let ledger = PortfolioLedger::in_memory();

        let err = ledger.invest("ghost", "Growth Fund", dec!(10), dec!(10)).await.unwrap_err();
        assert!(matches!(err, AssistantError::UserNotFound(_)));

        let err = ledger.redeem("ghost", "Growth Fund", dec!(10), dec!(10)).await.unwrap_err();
        assert!(matches!(err, AssistantError::UserNotFound(_)));
    }

    #[tokio::test]
    async fn test_redeem_without_position() {
        let ledger = ledger_with_account(dec!(100)).await;

        let err = ledger.redeem("u1", "Growth Fund", dec!(10), dec!(10)).await.unwrap_err();
        assert!(matches!(err, AssistantError::PositionNotFound(_)));
    }

    #[tokio::test]
    async fn test_redeem_everything_closes_position() {
        let ledger = ledger_with_account(dec!(1000)).await;
        ledger.invest("u1", "Bond Fund", dec!(300), dec!(3)).await.unwrap();

        let receipt = ledger.redeem("u1", "Bond Fund", dec!(300), dec!(3)).await.unwrap();
        assert_eq!(receipt.remaining_units, Decimal::ZERO);
        assert_eq!(receipt.new_balance, dec!(1000));

        let account = ledger.get_account("u1").await.unwrap();
        assert!(account.investments.is_empty());
    }

    #[tokio::test]
    async fn test_over_redeem_leaves_account_unchanged() {
        let ledger = ledger_with_account(dec!(1000)).await;
        ledger.invest("u1", "Growth Fund", dec!(200), dec!(20)).await.unwrap();
        let before = ledger.get_account("u1").await.unwrap();

        let err = ledger.redeem("u1", "Growth Fund", dec!(300), dec!(20)).await.unwrap_err();
        match err {
            AssistantError::InsufficientUnits { requested, held, .. } => {
                assert_eq!(requested, dec!(15));
                assert_eq!(held, dec!(10));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(ledger.get_account("u1").await.unwrap(), before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_purchases_never_overdraw() {
        let ledger = Arc::new(ledger_with_account(dec!(100)).await);

        let handles: Vec<_> = [dec!(60), dec!(60)]
            .into_iter()
            .map(|amount| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.invest("u1", "Growth Fund", amount, dec!(10)).await })
            })
            .collect();

        let mut ok = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(AssistantError::InsufficientBalance { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!((ok, rejected), (1, 1));
        assert_eq!(ledger.get_account("u1").await.unwrap().cash_balance, dec!(40));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_purchases_spending_exact_balance() {
        let ledger = Arc::new(ledger_with_account(dec!(100)).await);

        let a = tokio::spawn({
            let ledger = ledger.clone();
            async move { ledger.invest("u1", "Growth Fund", dec!(40), dec!(10)).await }
        });
        let b = tokio::spawn({
            let ledger = ledger.clone();
            async move { ledger.invest("u1", "Growth Fund", dec!(60), dec!(10)).await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let account = ledger.get_account("u1").await.unwrap();
        assert!(account.cash_balance.is_zero());
        assert!(!account.cash_balance.is_sign_negative());
        assert_eq!(account.position("Growth Fund").unwrap().units, dec!(10));
    }

    #[tokio::test]
    async fn test_create_account_is_idempotent() {
        let ledger = ledger_with_account(dec!(10000)).await;
        ledger.invest("u1", "Growth Fund", dec!(500), dec!(10)).await.unwrap();

        let again = ledger.create_account("u1", dec!(10000), None).await.unwrap();
        assert_eq!(again.cash_balance, dec!(9500));
    }

    #[tokio::test]
    async fn test_open_account_is_strict() {
        let ledger = PortfolioLedger::in_memory();
        ledger.open_account("u1", dec!(50)).await.unwrap();

        let err = ledger.open_account("u1", dec!(50)).await.unwrap_err();
        assert!(matches!(err, AssistantError::AccountAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_valuation_reports_missing_funds() {
        let ledger = ledger_with_account(dec!(1000)).await;
        ledger.invest("u1", "Growth Fund", dec!(200), dec!(20)).await.unwrap();
        ledger.invest("u1", "Closed Fund", dec!(100), dec!(10)).await.unwrap();

        let catalog = FundCatalog::new(vec![Fund {
            name: "Growth Fund".to_string(),
            nav: dec!(25),
            min_investment: dec!(0),
            performance: String::new(),
        }])
        .unwrap();

        let value = ledger.portfolio_value("u1", &catalog).await.unwrap();
        assert_eq!(value.cash_balance, dec!(700));
        assert_eq!(value.investment_value, dec!(250));
        assert_eq!(value.total_balance, dec!(950));
        assert_eq!(value.missing_funds, vec!["Closed Fund".to_string()]);
    }

    /// Fails the first N calls of each kind with a storage error
    struct FlakyStore {
        inner: InMemoryLedgerStore,
        failures_left: AtomicU32,
    }

    #[async_trait::async_trait]
    impl LedgerStore for FlakyStore {
        async fn load(&self, user_id: &str) -> Result<Option<StoredAccount>> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AssistantError::StorageIo("transient".into()));
            }
            self.inner.load(user_id).await
        }

        async fn save(&self, account: &Account, expected: Option<u64>) -> Result<u64> {
            self.inner.save(account, expected).await
        }

        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_transient_io_is_retried() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryLedgerStore::new(),
            failures_left: AtomicU32::new(2),
        });
        let policy = RetryPolicy {
            backoff: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let ledger = PortfolioLedger::with_retry_policy(store, policy);

        let account = ledger.create_account("u1", dec!(10), None).await.unwrap();
        assert_eq!(account.cash_balance, dec!(10));
    }

    #[tokio::test]
    async fn test_persistent_io_surfaces() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryLedgerStore::new(),
            failures_left: AtomicU32::new(100),
        });
        let policy = RetryPolicy {
            max_io_retries: 2,
            backoff: Duration::from_millis(1),
            max_conflict_retries: 2,
        };
        let ledger = PortfolioLedger::with_retry_policy(store, policy);

        let err = ledger.find_account("u1").await.unwrap_err();
        assert!(matches!(err, AssistantError::StorageIo(_)));
    }

    #[test]
    fn test_units_are_rounded() {
        assert_eq!(
            units_for(dec!(100), dec!(3), RoundingStrategy::ToZero).unwrap(),
            dec!(33.333333)
        );
        assert_eq!(
            units_for(dec!(100), dec!(3), RoundingStrategy::AwayFromZero).unwrap(),
            dec!(33.333334)
        );
        assert!(units_for(dec!(0.0000001), dec!(1000), RoundingStrategy::ToZero).is_err());
    }

    #[tokio::test]
    async fn test_tiny_purchase_buys_no_partial_unit() {
        let ledger = ledger_with_account(dec!(1)).await;

        // 0.00000051 units rounds toward zero, so nothing can be bought
        let err = ledger.invest("u1", "Growth Fund", dec!(0.00051), dec!(1000)).await.unwrap_err();
        assert!(matches!(err, AssistantError::InvalidAmount(_)));
        assert_eq!(ledger.get_account("u1").await.unwrap().cash_balance, dec!(1));
    }

    #[tokio::test]
    async fn test_redeem_cannot_round_down_to_holding() {
        let ledger = ledger_with_account(dec!(1)).await;
        let receipt = ledger.invest("u1", "Growth Fund", dec!(0.001), dec!(1000)).await.unwrap();
        assert_eq!(receipt.units_purchased, dec!(0.000001));

        // Needs 0.0000014999 units against 0.000001 held
        let err = ledger.redeem("u1", "Growth Fund", dec!(0.0014999), dec!(1000)).await.unwrap_err();
        assert!(matches!(err, AssistantError::InsufficientUnits { .. }));

        let account = ledger.get_account("u1").await.unwrap();
        assert_eq!(account.cash_balance, dec!(0.999));
        assert_eq!(account.position("Growth Fund").unwrap().units, dec!(0.000001));
    }

    #[tokio::test]
    async fn test_purchase_never_credits_more_than_paid_for() {
        let ledger = ledger_with_account(dec!(100)).await;
        ledger.invest("u1", "Bond Fund", dec!(100), dec!(3)).await.unwrap();

        let account = ledger.get_account("u1").await.unwrap();
        let position = account.position("Bond Fund").unwrap();
        assert_eq!(position.units, dec!(33.333333));
        assert!(position.units * dec!(3) <= dec!(100));

        let err = ledger.redeem("u1", "Bond Fund", dec!(100), dec!(3)).await.unwrap_err();
        assert!(matches!(err, AssistantError::InsufficientUnits { .. }));
        let receipt = ledger.redeem("u1", "Bond Fund", dec!(99.999999), dec!(3)).await.unwrap();
        assert_eq!(receipt.remaining_units, Decimal::ZERO);
    }

    /// Commits every save but reports the first N as failed
    struct LostAckStore {
        inner: InMemoryLedgerStore,
        lost_acks: AtomicU32,
    }

    #[async_trait::async_trait]
    impl LedgerStore for LostAckStore {
        async fn load(&self, user_id: &str) -> Result<Option<StoredAccount>> {
            self.inner.load(user_id).await
        }

        async fn save(&self, account: &Account, expected: Option<u64>) -> Result<u64> {
            let version = self.inner.save(account, expected).await?;
            if self
                .lost_acks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AssistantError::StorageIo("connection reset".into()));
            }
            Ok(version)
        }

        fn backend_name(&self) -> &'static str {
            "lost-ack"
        }
    }

    #[tokio::test]
    async fn test_lost_commit_acknowledgement_is_not_applied_twice() {
        let store = Arc::new(LostAckStore {
            inner: InMemoryLedgerStore::new(),
            lost_acks: AtomicU32::new(0),
        });
        let policy = RetryPolicy {
            backoff: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let ledger = PortfolioLedger::with_retry_policy(store.clone(), policy);
        ledger.create_account("u1", dec!(10000), None).await.unwrap();

        store.lost_acks.store(1, Ordering::SeqCst);
        let receipt = ledger.invest("u1", "Growth Fund", dec!(2000), dec!(20)).await.unwrap();
        assert_eq!(receipt.units_purchased, dec!(100));

        let account = ledger.get_account("u1").await.unwrap();
        assert_eq!(account.cash_balance, dec!(8000));
        assert_eq!(account.position("Growth Fund").unwrap().units, dec!(100));
        assert_eq!(account.last_transaction_id, Some(receipt.transaction_id));
    }

    /// Rejects the first N saves as if another writer got there first
    struct ContendedStore {
        inner: InMemoryLedgerStore,
        conflicts_left: AtomicU32,
        saves: AtomicU32,
    }

    #[async_trait::async_trait]
    impl LedgerStore for ContendedStore {
        async fn load(&self, user_id: &str) -> Result<Option<StoredAccount>> {
            self.inner.load(user_id).await
        }

        async fn save(&self, account: &Account, expected: Option<u64>) -> Result<u64> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if self
                .conflicts_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(conflict(&account.user_id, expected, None));
            }
            self.inner.save(account, expected).await
        }

        fn backend_name(&self) -> &'static str {
            "contended"
        }
    }

    async fn contended_ledger(conflicts: u32) -> (Arc<ContendedStore>, PortfolioLedger) {
        let store = Arc::new(ContendedStore {
            inner: InMemoryLedgerStore::new(),
            conflicts_left: AtomicU32::new(0),
            saves: AtomicU32::new(0),
        });
        let ledger = PortfolioLedger::new(store.clone());
        ledger.create_account("u1", dec!(1000), None).await.unwrap();
        store.conflicts_left.store(conflicts, Ordering::SeqCst);
        store.saves.store(0, Ordering::SeqCst);
        (store, ledger)
    }

    #[tokio::test]
    async fn test_conflict_reruns_on_fresh_state() {
        let (store, ledger) = contended_ledger(1).await;

        ledger.invest("u1", "Growth Fund", dec!(200), dec!(20)).await.unwrap();

        assert_eq!(store.saves.load(Ordering::SeqCst), 2);
        let account = ledger.get_account("u1").await.unwrap();
        assert_eq!(account.cash_balance, dec!(800));
        assert_eq!(account.position("Growth Fund").unwrap().units, dec!(10));
    }

    #[tokio::test]
    async fn test_persistent_conflict_surfaces() {
        let (store, ledger) = contended_ledger(3).await;

        let err = ledger.invest("u1", "Growth Fund", dec!(200), dec!(20)).await.unwrap_err();
        assert!(matches!(err, AssistantError::StorageConflict(_)));
        assert_eq!(store.saves.load(Ordering::SeqCst), 3);
        assert_eq!(ledger.get_account("u1").await.unwrap().cash_balance, dec!(1000));
    }

    #[tokio::test]
    async fn test_user_locks_are_released() {
        let ledger = PortfolioLedger::in_memory();

        for i in 0..100 {
            let user = format!("ghost-{}", i);
            let err = ledger.invest(&user, "Growth Fund", dec!(10), dec!(10)).await.unwrap_err();
            assert!(matches!(err, AssistantError::UserNotFound(_)));
        }
        ledger.create_account("u1", dec!(10), None).await.unwrap();

        assert!(ledger.user_locks.lock().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_user_locks_released_after_concurrent_use() {
        let ledger = Arc::new(ledger_with_account(dec!(1000)).await);

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.invest("u1", "Growth Fund", dec!(10), dec!(10)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(ledger.get_account("u1").await.unwrap().cash_balance, dec!(800));
        assert!(ledger.user_locks.lock().await.is_empty());
    }
}
