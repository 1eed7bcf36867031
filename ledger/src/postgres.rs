//! PostgreSQL ledger store.
//!
//! Row exclusivity comes from `SELECT ... FOR UPDATE`; the non-negative
//! balance rule is re-checked by the conditional update itself, so a unit
//! can never publish a negative balance even if the caller skipped its own
//! check.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Executor, Postgres, Row};
use tracing::{debug, info, warn};

use paywallet_common::{
    AccountId, AccountNumber, AccountSide, AmountError, Reference, Result, TransactionId, UserId,
    WalletError,
};

use crate::account::{Account, AccountType, User};
use crate::store::{Directory, LedgerStore, UnitOfWork};
use crate::transaction::{NewTransaction, Transaction, TransactionStatus};

/// Table definitions, applied by [`PgLedgerStore::migrate`].
pub const SCHEMA: &str = include_str!("../sql/schema.sql");

const ACCOUNT_COLUMNS: &str =
    "id, account_number, user_id, account_type, balance, status, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, reference, kind, amount, description, payment_method, \
     status, sender_account, receiver_account, reverses, created_at, completed_at";

/// PostgreSQL store configuration.
#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    /// Connection string.
    pub database_url: String,
    /// Maximum pool size.
    pub max_connections: u32,
    /// Maximum time to wait for a pooled connection.
    pub acquire_timeout: Duration,
    /// Maximum time a unit waits for a row lock (`SET LOCAL lock_timeout`).
    pub lock_timeout: Duration,
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/paywallet".to_string(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(3),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

impl PgStoreConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }

        if let Ok(max) = std::env::var("PAYWALLET_PG_MAX_CONNECTIONS") {
            if let Ok(max) = max.parse() {
                config.max_connections = max;
            }
        }

        if let Ok(ms) = std::env::var("PAYWALLET_PG_ACQUIRE_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                config.acquire_timeout = Duration::from_millis(ms);
            }
        }

        if let Ok(ms) = std::env::var("PAYWALLET_LOCK_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                config.lock_timeout = Duration::from_millis(ms);
            }
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            return Err(WalletError::Configuration(
                "Database URL cannot be empty".to_string(),
            ));
        }

        if self.max_connections == 0 {
            return Err(WalletError::Configuration(
                "Max connections must be at least 1".to_string(),
            ));
        }

        if self.lock_timeout.is_zero() {
            return Err(WalletError::Configuration(
                "Lock timeout cannot be 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// How a PostgreSQL error code affects the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlStateClass {
    /// 23505: a unique constraint rejected the write.
    UniqueViolation,
    /// Serialization failure, deadlock or lock timeout. Safe to retry.
    Conflict,
    /// Connection-level failure or server shutdown.
    Unavailable,
    /// 22003: a value left the column's numeric range.
    NumericOverflow,
    Other,
}

/// Classify a SQLSTATE code.
pub fn classify_sqlstate(code: &str) -> SqlStateClass {
    match code {
        "23505" => SqlStateClass::UniqueViolation,
        "22003" => SqlStateClass::NumericOverflow,
        "40001" | "40P01" | "55P03" => SqlStateClass::Conflict,
        "57P01" | "57P02" | "57P03" | "53300" => SqlStateClass::Unavailable,
        c if c.starts_with("08") => SqlStateClass::Unavailable,
        _ => SqlStateClass::Other,
    }
}

/// Convert a driver error into the ledger taxonomy.
pub fn map_sqlx_error(err: sqlx::Error) -> WalletError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            match classify_sqlstate(&code) {
                SqlStateClass::Conflict => {
                    WalletError::StorageConflict(format!("{} ({code})", db.message()))
                }
                SqlStateClass::Unavailable => {
                    WalletError::StorageUnavailable(format!("{} ({code})", db.message()))
                }
                SqlStateClass::NumericOverflow => {
                    WalletError::InvalidAmount(AmountError::Overflow(db.message().to_string()))
                }
                SqlStateClass::UniqueViolation | SqlStateClass::Other => {
                    WalletError::Internal(format!("database error {code}: {}", db.message()))
                }
            }
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => WalletError::StorageUnavailable(err.to_string()),
        _ => WalletError::Internal(err.to_string()),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .map(|c| classify_sqlstate(&c) == SqlStateClass::UniqueViolation)
            .unwrap_or(false),
        _ => false,
    }
}

fn account_from_row(row: &PgRow) -> std::result::Result<Account, WalletError> {
    let account_type: String = row.try_get("account_type").map_err(map_sqlx_error)?;
    let status: String = row.try_get("status").map_err(map_sqlx_error)?;

    Ok(Account {
        id: AccountId::new(row.try_get("id").map_err(map_sqlx_error)?),
        account_number: AccountNumber::new(row.try_get("account_number").map_err(map_sqlx_error)?),
        user_id: UserId::new(row.try_get("user_id").map_err(map_sqlx_error)?),
        account_type: account_type.parse()?,
        balance: row.try_get("balance").map_err(map_sqlx_error)?,
        status: status.parse()?,
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx_error)?,
    })
}

fn transaction_from_row(row: &PgRow) -> std::result::Result<Transaction, WalletError> {
    let reference: String = row.try_get("reference").map_err(map_sqlx_error)?;
    let kind: String = row.try_get("kind").map_err(map_sqlx_error)?;
    let status: String = row.try_get("status").map_err(map_sqlx_error)?;
    let sender: Option<i64> = row.try_get("sender_account").map_err(map_sqlx_error)?;
    let receiver: Option<i64> = row.try_get("receiver_account").map_err(map_sqlx_error)?;
    let reverses: Option<i64> = row.try_get("reverses").map_err(map_sqlx_error)?;

    Ok(Transaction {
        id: TransactionId::new(row.try_get("id").map_err(map_sqlx_error)?),
        reference: Reference::parse(reference)
            .map_err(|e| WalletError::Internal(format!("stored reference is invalid: {e}")))?,
        kind: kind.parse()?,
        amount: row.try_get("amount").map_err(map_sqlx_error)?,
        description: row.try_get("description").map_err(map_sqlx_error)?,
        payment_method: row.try_get("payment_method").map_err(map_sqlx_error)?,
        status: status.parse()?,
        sender_account: sender.map(AccountNumber::new),
        receiver_account: receiver.map(AccountNumber::new),
        reverses: reverses.map(TransactionId::new),
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
        completed_at: row.try_get("completed_at").map_err(map_sqlx_error)?,
    })
}

fn user_from_row(row: &PgRow) -> std::result::Result<User, WalletError> {
    Ok(User {
        id: UserId::new(row.try_get("id").map_err(map_sqlx_error)?),
        username: row.try_get("username").map_err(map_sqlx_error)?,
        email: row.try_get("email").map_err(map_sqlx_error)?,
        is_active: row.try_get("is_active").map_err(map_sqlx_error)?,
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
    })
}

/// Ledger store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgLedgerStore {
    /// Connect a pool using the given configuration.
    pub async fn connect(config: &PgStoreConfig) -> Result<Self> {
        config.validate()?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(map_sqlx_error)?;

        info!(
            max_connections = config.max_connections,
            "Connected to PostgreSQL ledger"
        );

        Ok(Self::from_pool(pool, config.lock_timeout))
    }

    pub fn from_pool(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the ledger tables if they are missing.
    pub async fn migrate(&self) -> Result<()> {
        (&self.pool).execute(SCHEMA).await.map_err(map_sqlx_error)?;
        info!("Ledger schema applied");
        Ok(())
    }

    /// Register a user.
    pub async fn create_user(&self, username: &str, email: &str) -> Result<User> {
        let row = sqlx::query(
            "INSERT INTO users (username, email) VALUES ($1, $2) \
             RETURNING id, username, email, is_active, created_at",
        )
        .bind(username)
        .bind(email)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        user_from_row(&row)
    }

    /// Open an account: zero balance, pending activation.
    pub async fn open_account(&self, user_id: UserId, account_type: AccountType) -> Result<Account> {
        let sql = format!(
            "INSERT INTO accounts (user_id, account_type) VALUES ($1, $2) RETURNING {ACCOUNT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(user_id.value())
            .bind(account_type.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.code().as_deref() == Some("23503") => {
                    WalletError::UserNotFound(user_id)
                }
                _ => map_sqlx_error(e),
            })?;

        account_from_row(&row)
    }

    /// Confirm an account so it can transact.
    pub async fn activate_account(&self, account_number: AccountNumber) -> Result<Account> {
        self.set_account_status(account_number, "active").await
    }

    /// Soft-delete an account.
    pub async fn deactivate_account(&self, account_number: AccountNumber) -> Result<Account> {
        self.set_account_status(account_number, "deactivated").await
    }

    async fn set_account_status(
        &self,
        account_number: AccountNumber,
        status: &str,
    ) -> Result<Account> {
        let sql = format!(
            "UPDATE accounts SET status = $2, updated_at = now() \
             WHERE account_number = $1 RETURNING {ACCOUNT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(account_number.value())
            .bind(status)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .ok_or(WalletError::AccountNotFound {
                account_number,
                side: AccountSide::Account,
            })?;

        account_from_row(&row)
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    type Unit = PgUnitOfWork;

    async fn begin(&self) -> Result<PgUnitOfWork> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        // SET does not take bind parameters.
        let sql = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis());
        sqlx::query(&sql)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        Ok(PgUnitOfWork { tx })
    }

    async fn account(&self, account_number: AccountNumber) -> Result<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE account_number = $1");
        let row = sqlx::query(&sql)
            .bind(account_number.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn transaction_by_reference(
        &self,
        reference: &Reference,
    ) -> Result<Option<Transaction>> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE reference = $1");
        let row = sqlx::query(&sql)
            .bind(reference.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn transactions_for_account(
        &self,
        account_number: AccountNumber,
    ) -> Result<Vec<Transaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE sender_account = $1 OR receiver_account = $1 \
             ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(account_number.value())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(transaction_from_row).collect()
    }
}

#[async_trait]
impl Directory for PgLedgerStore {
    async fn user(&self, id: UserId) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, username, email, is_active, created_at FROM users WHERE id = $1")
            .bind(id.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn accounts_for_user(&self, id: UserId) -> Result<Vec<Account>> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE user_id = $1 ORDER BY account_number"
        );
        let rows = sqlx::query(&sql)
            .bind(id.value())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(account_from_row).collect()
    }
}

/// Unit of work over one PostgreSQL transaction. Dropping it without
/// committing rolls the transaction back.
pub struct PgUnitOfWork {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn get_account_for_update(
        &mut self,
        account_number: AccountNumber,
    ) -> Result<Option<Account>> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE account_number = $1 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(account_number.value())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        debug!(account = %account_number, found = row.is_some(), "Row locked");
        row.as_ref().map(account_from_row).transpose()
    }

    async fn apply_balance_delta(
        &mut self,
        account_id: AccountId,
        delta: Decimal,
    ) -> Result<Decimal> {
        let updated = sqlx::query(
            "UPDATE accounts SET balance = balance + $2, updated_at = now() \
             WHERE id = $1 AND balance + $2 >= 0 RETURNING balance",
        )
        .bind(account_id.value())
        .bind(delta)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;

        if let Some(row) = updated {
            return row.try_get("balance").map_err(map_sqlx_error);
        }

        // Nothing updated: either the row is gone or the balance is short.
        let current = sqlx::query("SELECT account_number, balance FROM accounts WHERE id = $1")
            .bind(account_id.value())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| WalletError::Internal(format!("account {account_id} vanished")))?;

        let account_number: i64 = current.try_get("account_number").map_err(map_sqlx_error)?;
        Err(WalletError::InsufficientFunds {
            account_number: AccountNumber::new(account_number),
            required: -delta,
            available: current.try_get("balance").map_err(map_sqlx_error)?,
        })
    }

    async fn transaction_by_reference(
        &mut self,
        reference: &Reference,
    ) -> Result<Option<Transaction>> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE reference = $1");
        let row = sqlx::query(&sql)
            .bind(reference.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn transaction_for_update(&mut self, id: TransactionId) -> Result<Option<Transaction>> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.value())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn mark_reversed(&mut self, id: TransactionId) -> Result<Transaction> {
        let mut current = self
            .transaction_for_update(id)
            .await?
            .ok_or_else(|| WalletError::NotFound(id.to_string()))?;
        current.transition_to(TransactionStatus::Reversed)?;

        sqlx::query("UPDATE transactions SET status = $2 WHERE id = $1")
            .bind(id.value())
            .bind(TransactionStatus::Reversed.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        Ok(current)
    }

    async fn insert_transaction(&mut self, record: NewTransaction) -> Result<Transaction> {
        let row = sqlx::query(
            "INSERT INTO transactions (reference, kind, amount, description, payment_method, \
             status, sender_account, receiver_account, reverses, created_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) RETURNING id",
        )
        .bind(record.reference.as_str())
        .bind(record.kind.as_str())
        .bind(record.amount)
        .bind(&record.description)
        .bind(&record.payment_method)
        .bind(record.status.as_str())
        .bind(record.sender_account.map(|a| a.value()))
        .bind(record.receiver_account.map(|a| a.value()))
        .bind(record.reverses.map(|t| t.value()))
        .bind(record.created_at)
        .bind(record.completed_at)
        .fetch_one(&mut *self.tx)
        .await;

        let row = match row {
            Ok(row) => row,
            Err(e) if is_unique_violation(&e) => {
                return Err(WalletError::DuplicateReference(record.reference));
            }
            Err(e) => return Err(map_sqlx_error(e)),
        };

        let id: i64 = row.try_get("id").map_err(map_sqlx_error)?;
        Ok(record.with_id(TransactionId::new(id)))
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(|e| {
            warn!(error = %e, "Commit failed");
            map_sqlx_error(e)
        })
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(map_sqlx_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_sqlstate() {
        assert_eq!(classify_sqlstate("23505"), SqlStateClass::UniqueViolation);
        assert_eq!(classify_sqlstate("40001"), SqlStateClass::Conflict);
        assert_eq!(classify_sqlstate("40P01"), SqlStateClass::Conflict);
        assert_eq!(classify_sqlstate("55P03"), SqlStateClass::Conflict);
        assert_eq!(classify_sqlstate("08006"), SqlStateClass::Unavailable);
        assert_eq!(classify_sqlstate("57P01"), SqlStateClass::Unavailable);
        assert_eq!(classify_sqlstate("22003"), SqlStateClass::NumericOverflow);
        assert_eq!(classify_sqlstate("23503"), SqlStateClass::Other);
    }

    #[test]
    fn test_pool_errors_are_transient() {
        let err = map_sqlx_error(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, WalletError::StorageUnavailable(_)));
        assert!(err.is_transient());

        let err = map_sqlx_error(sqlx::Error::RowNotFound);
        assert!(matches!(err, WalletError::Internal(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_config_validation() {
        assert!(PgStoreConfig::default().validate().is_ok());

        let config = PgStoreConfig {
            max_connections: 0,
            ..PgStoreConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(WalletError::Configuration(_))
        ));
    }

    #[test]
    fn test_schema_declares_constraints() {
        assert!(SCHEMA.contains("reference         VARCHAR(64)   NOT NULL UNIQUE"));
        assert!(SCHEMA.contains("CHECK (balance >= 0)"));
    }
}
