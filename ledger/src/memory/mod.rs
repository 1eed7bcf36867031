//! In-memory ledger store.
//!
//! Committed state lives in a single set of tables behind one
//! `parking_lot::RwLock`, so a commit publishes all of its changes in one
//! critical section and readers always see a point-in-time snapshot. Units of
//! work serialize on per-account row locks and stage their changes privately
//! until commit.

mod locks;

pub use locks::{RowGuard, RowLocks};

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use paywallet_common::{
    checked_balance, AccountId, AccountNumber, Reference, Result, TransactionId, UserId, WalletError,
};

use crate::account::{Account, AccountType, User};
use crate::store::{Directory, LedgerStore, UnitOfWork};
use crate::transaction::{NewTransaction, Transaction, TransactionStatus};

/// In-memory store configuration.
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Maximum time a unit of work waits for an account row.
    pub lock_timeout: Duration,
    /// First account number handed out by `open_account`.
    pub first_account_number: i64,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            first_account_number: 1_000_000_001,
        }
    }
}

impl MemoryStoreConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(ms) = std::env::var("PAYWALLET_LOCK_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                config.lock_timeout = Duration::from_millis(ms);
            }
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout.is_zero() {
            return Err(WalletError::Configuration(
                "Lock timeout cannot be 0".to_string(),
            ));
        }

        if self.first_account_number <= 0 {
            return Err(WalletError::Configuration(
                "Account numbers must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Injected storage faults, consumed one per commit or reference lookup.
#[derive(Default)]
pub struct FaultInjector {
    commit_failures: Mutex<VecDeque<WalletError>>,
    lookup_failures: Mutex<VecDeque<WalletError>>,
    commit_delay: Mutex<Option<Duration>>,
}

impl FaultInjector {
    /// Make the next commit fail with `error` without writing anything.
    pub fn fail_next_commit(&self, error: WalletError) {
        self.commit_failures.lock().push_back(error);
    }

    /// Make the next store-level reference lookup fail with `error`.
    pub fn fail_next_lookup(&self, error: WalletError) {
        self.lookup_failures.lock().push_back(error);
    }

    /// Delay every commit, while still holding row locks.
    pub fn set_commit_delay(&self, delay: Option<Duration>) {
        *self.commit_delay.lock() = delay;
    }

    /// Drop every pending fault.
    pub fn clear(&self) {
        self.commit_failures.lock().clear();
        self.lookup_failures.lock().clear();
        *self.commit_delay.lock() = None;
    }

    pub fn pending_failures(&self) -> usize {
        self.commit_failures.lock().len() + self.lookup_failures.lock().len()
    }

    fn before_lookup(&self) -> Result<()> {
        match self.lookup_failures.lock().pop_front() {
            Some(error) => {
                warn!(error = %error, "Injected lookup failure");
                Err(error)
            }
            None => Ok(()),
        }
    }

    async fn before_commit(&self) -> Result<()> {
        let delay = *self.commit_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.commit_failures.lock().pop_front();
        match failure {
            Some(error) => {
                warn!(error = %error, "Injected commit failure");
                Err(error)
            }
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct Tables {
    users: BTreeMap<UserId, User>,
    accounts: BTreeMap<AccountNumber, Account>,
    account_numbers: HashMap<AccountId, AccountNumber>,
    transactions: BTreeMap<TransactionId, Transaction>,
    by_reference: HashMap<Reference, TransactionId>,
    by_account: HashMap<AccountNumber, Vec<TransactionId>>,
}

impl Tables {
    fn transactions_for(&self, account_number: AccountNumber) -> Vec<Transaction> {
        let mut transactions: Vec<Transaction> = self
            .by_account
            .get(&account_number)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.transactions.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        transactions.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        transactions
    }
}

struct Shared {
    tables: RwLock<Tables>,
    row_locks: RowLocks,
    faults: FaultInjector,
    next_user_id: AtomicI64,
    next_account_id: AtomicI64,
    next_account_number: AtomicI64,
    next_transaction_id: AtomicI64,
}

/// Ledger store kept entirely in process memory.
///
/// Cloning is cheap and every clone shares the same tables.
#[derive(Clone)]
pub struct InMemoryLedgerStore {
    shared: Arc<Shared>,
}

impl InMemoryLedgerStore {
    /// Create a store with default configuration.
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: RwLock::new(Tables::default()),
                row_locks: RowLocks::new(config.lock_timeout),
                faults: FaultInjector::default(),
                next_user_id: AtomicI64::new(1),
                next_account_id: AtomicI64::new(1),
                next_account_number: AtomicI64::new(config.first_account_number),
                next_transaction_id: AtomicI64::new(1),
            }),
        }
    }

    /// Fault injection hooks.
    pub fn faults(&self) -> &FaultInjector {
        &self.shared.faults
    }

    /// Row lock manager, exposed for inspection.
    pub fn row_locks(&self) -> &RowLocks {
        &self.shared.row_locks
    }

    /// Register a user.
    pub fn create_user(&self, username: impl Into<String>, email: impl Into<String>) -> User {
        let id = UserId::new(self.shared.next_user_id.fetch_add(1, Ordering::SeqCst));
        let user = User::new(id, username, email);
        self.shared.tables.write().users.insert(id, user.clone());
        info!(user_id = %id, "User created");
        user
    }

    /// Open an account for a user: zero balance, pending activation.
    pub fn open_account(&self, user_id: UserId, account_type: AccountType) -> Result<Account> {
        let mut tables = self.shared.tables.write();
        if !tables.users.contains_key(&user_id) {
            return Err(WalletError::UserNotFound(user_id));
        }

        let id = AccountId::new(self.shared.next_account_id.fetch_add(1, Ordering::SeqCst));
        let number = AccountNumber::new(
            self.shared
                .next_account_number
                .fetch_add(1, Ordering::SeqCst),
        );
        let account = Account::new(id, number, user_id, account_type);

        tables.accounts.insert(number, account.clone());
        tables.account_numbers.insert(id, number);
        self.shared.row_locks.register(number);

        info!(account = %number, user_id = %user_id, "Account opened");
        Ok(account)
    }

    /// Confirm an account so it can transact.
    pub async fn activate_account(&self, account_number: AccountNumber) -> Result<Account> {
        self.update_account(account_number, Account::activate).await
    }

    /// Soft-delete an account. Waits for any unit holding the row.
    pub async fn deactivate_account(&self, account_number: AccountNumber) -> Result<Account> {
        self.update_account(account_number, Account::deactivate).await
    }

    /// Snapshot of every account, ascending by account number.
    pub fn accounts(&self) -> Vec<Account> {
        self.shared.tables.read().accounts.values().cloned().collect()
    }

    /// Sum of all balances.
    pub fn total_balance(&self) -> Decimal {
        self.shared
            .tables
            .read()
            .accounts
            .values()
            .map(|a| a.balance)
            .sum()
    }

    /// Number of committed transactions.
    pub fn transaction_count(&self) -> usize {
        self.shared.tables.read().transactions.len()
    }

    async fn update_account(
        &self,
        account_number: AccountNumber,
        change: impl FnOnce(&mut Account),
    ) -> Result<Account> {
        let _row = self.shared.row_locks.acquire(account_number).await?.ok_or(
            WalletError::AccountNotFound {
                account_number,
                side: paywallet_common::AccountSide::Account,
            },
        )?;

        let mut tables = self.shared.tables.write();
        let account = tables
            .accounts
            .get_mut(&account_number)
            .ok_or(WalletError::AccountNotFound {
                account_number,
                side: paywallet_common::AccountSide::Account,
            })?;
        change(account);
        info!(account = %account_number, status = %account.status, "Account status changed");
        Ok(account.clone())
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    type Unit = MemoryUnit;

    async fn begin(&self) -> Result<MemoryUnit> {
        Ok(MemoryUnit {
            shared: self.shared.clone(),
            rows: BTreeMap::new(),
            staged_transactions: Vec::new(),
            staged_reversals: Vec::new(),
            finished: false,
        })
    }

    async fn account(&self, account_number: AccountNumber) -> Result<Option<Account>> {
        Ok(self.shared.tables.read().accounts.get(&account_number).cloned())
    }

    async fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
        Ok(self.shared.tables.read().transactions.get(&id).cloned())
    }

    async fn transaction_by_reference(
        &self,
        reference: &Reference,
    ) -> Result<Option<Transaction>> {
        self.shared.faults.before_lookup()?;
        let tables = self.shared.tables.read();
        Ok(tables
            .by_reference
            .get(reference)
            .and_then(|id| tables.transactions.get(id))
            .cloned())
    }

    async fn transactions_for_account(
        &self,
        account_number: AccountNumber,
    ) -> Result<Vec<Transaction>> {
        Ok(self.shared.tables.read().transactions_for(account_number))
    }
}

#[async_trait]
impl Directory for InMemoryLedgerStore {
    async fn user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.shared.tables.read().users.get(&id).cloned())
    }

    async fn accounts_for_user(&self, id: UserId) -> Result<Vec<Account>> {
        Ok(self
            .shared
            .tables
            .read()
            .accounts
            .values()
            .filter(|a| a.user_id == id)
            .cloned()
            .collect())
    }
}

struct LockedRow {
    _guard: RowGuard,
    /// Staged copy of the account; authoritative while the guard is held.
    account: Account,
    dirty: bool,
}

/// Unit of work over an [`InMemoryLedgerStore`].
pub struct MemoryUnit {
    shared: Arc<Shared>,
    rows: BTreeMap<AccountNumber, LockedRow>,
    staged_transactions: Vec<Transaction>,
    staged_reversals: Vec<TransactionId>,
    finished: bool,
}

impl MemoryUnit {
    fn row_by_id(&mut self, account_id: AccountId) -> Option<&mut LockedRow> {
        self.rows.values_mut().find(|row| row.account.id == account_id)
    }

    fn staged_transaction(&self, id: TransactionId) -> Option<Transaction> {
        self.staged_transactions.iter().find(|t| t.id == id).cloned()
    }

    /// Publish staged changes in one critical section. Validates everything
    /// before writing anything.
    fn publish(&mut self) -> Result<()> {
        let mut tables = self.shared.tables.write();

        for tx in &self.staged_transactions {
            if tables.by_reference.contains_key(&tx.reference) {
                return Err(WalletError::DuplicateReference(tx.reference.clone()));
            }
        }
        for id in &self.staged_reversals {
            if let Some(original) = tables.transactions.get(id) {
                if !original.status.can_transition_to(TransactionStatus::Reversed) {
                    return Err(WalletError::InvalidTransition {
                        transaction_id: *id,
                        from: original.status.to_string(),
                        to: TransactionStatus::Reversed.to_string(),
                    });
                }
            }
        }

        for (number, row) in &self.rows {
            if !row.dirty {
                continue;
            }
            // Only the balance is owned by the unit; status may have been
            // changed by provisioning meanwhile.
            let account = tables.accounts.get_mut(number).ok_or_else(|| {
                WalletError::Internal(format!("locked account {number} vanished"))
            })?;
            account.balance = row.account.balance;
            account.updated_at = row.account.updated_at;
        }

        for id in &self.staged_reversals {
            if let Some(original) = tables.transactions.get_mut(id) {
                original.status = TransactionStatus::Reversed;
            }
        }

        for tx in self.staged_transactions.drain(..) {
            tables.by_reference.insert(tx.reference.clone(), tx.id);
            for account in [tx.sender_account, tx.receiver_account].into_iter().flatten() {
                tables.by_account.entry(account).or_default().push(tx.id);
            }
            tables.transactions.insert(tx.id, tx);
        }
        self.staged_reversals.clear();

        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnit {
    async fn get_account_for_update(
        &mut self,
        account_number: AccountNumber,
    ) -> Result<Option<Account>> {
        if let Some(row) = self.rows.get(&account_number) {
            return Ok(Some(row.account.clone()));
        }

        let guard = match self.shared.row_locks.acquire(account_number).await? {
            Some(guard) => guard,
            None => return Ok(None),
        };

        // Read after locking so the staged copy is never stale.
        let account = self.shared.tables.read().accounts.get(&account_number).cloned();
        let account = match account {
            Some(account) => account,
            None => return Ok(None),
        };

        self.rows.insert(
            account_number,
            LockedRow {
                _guard: guard,
                account: account.clone(),
                dirty: false,
            },
        );
        Ok(Some(account))
    }

    async fn apply_balance_delta(
        &mut self,
        account_id: AccountId,
        delta: Decimal,
    ) -> Result<Decimal> {
        let row = self.row_by_id(account_id).ok_or_else(|| {
            WalletError::Internal(format!("account {account_id} is not locked by this unit"))
        })?;

        let new_balance = checked_balance(row.account.balance, delta)?;
        if new_balance < Decimal::ZERO {
            return Err(WalletError::InsufficientFunds {
                account_number: row.account.account_number,
                required: -delta,
                available: row.account.balance,
            });
        }

        row.account.balance = new_balance;
        row.account.updated_at = chrono::Utc::now();
        row.dirty = true;
        Ok(new_balance)
    }

    async fn transaction_by_reference(
        &mut self,
        reference: &Reference,
    ) -> Result<Option<Transaction>> {
        if let Some(tx) = self
            .staged_transactions
            .iter()
            .find(|t| &t.reference == reference)
        {
            return Ok(Some(tx.clone()));
        }

        let tables = self.shared.tables.read();
        Ok(tables
            .by_reference
            .get(reference)
            .and_then(|id| tables.transactions.get(id))
            .cloned())
    }

    async fn transaction_for_update(&mut self, id: TransactionId) -> Result<Option<Transaction>> {
        if let Some(tx) = self.staged_transaction(id) {
            return Ok(Some(tx));
        }

        let mut tx = self.shared.tables.read().transactions.get(&id).cloned();
        if let Some(tx) = tx.as_mut() {
            if self.staged_reversals.contains(&id) {
                tx.status = TransactionStatus::Reversed;
            }
        }
        Ok(tx)
    }

    async fn mark_reversed(&mut self, id: TransactionId) -> Result<Transaction> {
        let mut tx = self
            .transaction_for_update(id)
            .await?
            .ok_or_else(|| WalletError::NotFound(id.to_string()))?;

        tx.transition_to(TransactionStatus::Reversed)?;
        self.staged_reversals.push(id);
        Ok(tx)
    }

    async fn insert_transaction(&mut self, record: NewTransaction) -> Result<Transaction> {
        let duplicate = self
            .staged_transactions
            .iter()
            .any(|t| t.reference == record.reference)
            || self
                .shared
                .tables
                .read()
                .by_reference
                .contains_key(&record.reference);
        if duplicate {
            return Err(WalletError::DuplicateReference(record.reference));
        }

        let id = TransactionId::new(
            self.shared
                .next_transaction_id
                .fetch_add(1, Ordering::SeqCst),
        );
        let tx = record.with_id(id);
        self.staged_transactions.push(tx.clone());
        Ok(tx)
    }

    async fn commit(mut self) -> Result<()> {
        self.shared.faults.before_commit().await?;
        self.publish()?;
        self.finished = true;

        debug!(rows = self.rows.len(), "Unit of work committed");
        Ok(())
    }

    async fn rollback(mut self) -> Result<()> {
        self.finished = true;
        debug!(
            rows = self.rows.len(),
            staged = self.staged_transactions.len(),
            "Unit of work rolled back"
        );
        Ok(())
    }
}

impl Drop for MemoryUnit {
    fn drop(&mut self) {
        if !self.finished && (!self.staged_transactions.is_empty() || !self.rows.is_empty()) {
            debug!(
                rows = self.rows.len(),
                staged = self.staged_transactions.len(),
                "Unit of work dropped without commit, discarding changes"
            );
        }
    }
}
