//! Storage contracts for the ledger.
//!
//! A [`LedgerStore`] owns accounts and transaction records. All mutation goes
//! through a [`UnitOfWork`]: row locks taken inside a unit are held until it
//! commits, rolls back or is dropped, and nothing a unit writes is visible to
//! other readers before commit. Dropping a unit without committing is a
//! rollback, so cancellation at any await point leaves no partial state.

use async_trait::async_trait;
use paywallet_common::{AccountId, AccountNumber, Reference, Result, TransactionId, UserId};
use rust_decimal::Decimal;

use crate::account::{Account, User};
use crate::transaction::{NewTransaction, Transaction};

/// Durable storage of accounts and transactions.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Unit of work type produced by [`LedgerStore::begin`].
    type Unit: UnitOfWork;

    /// Open a new unit of work.
    async fn begin(&self) -> Result<Self::Unit>;

    /// Committed state of an account.
    async fn account(&self, account_number: AccountNumber) -> Result<Option<Account>>;

    /// Transaction by store id.
    async fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>>;

    /// Transaction by reference.
    async fn transaction_by_reference(&self, reference: &Reference)
        -> Result<Option<Transaction>>;

    /// Every transaction touching an account, oldest first.
    async fn transactions_for_account(
        &self,
        account_number: AccountNumber,
    ) -> Result<Vec<Transaction>>;
}

/// Atomic group of ledger mutations.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Lock an account row for the rest of the unit and return its current
    /// state. Returns `None` if the account number does not resolve.
    ///
    /// Callers locking several accounts must do so in ascending account
    /// number order.
    async fn get_account_for_update(
        &mut self,
        account_number: AccountNumber,
    ) -> Result<Option<Account>>;

    /// Apply a signed delta to a locked account and return the new balance.
    ///
    /// Fails with `InsufficientFunds` if the balance would become negative.
    async fn apply_balance_delta(&mut self, account_id: AccountId, delta: Decimal)
        -> Result<Decimal>;

    /// Look up a reference, including records inserted by this unit.
    async fn transaction_by_reference(&mut self, reference: &Reference)
        -> Result<Option<Transaction>>;

    /// Read a transaction for a status change. The caller must already hold
    /// the locks of every account the transaction involves.
    async fn transaction_for_update(&mut self, id: TransactionId) -> Result<Option<Transaction>>;

    /// Move a completed transaction to reversed.
    async fn mark_reversed(&mut self, id: TransactionId) -> Result<Transaction>;

    /// Insert a record. Fails with `DuplicateReference` if the reference
    /// already exists.
    async fn insert_transaction(&mut self, record: NewTransaction) -> Result<Transaction>;

    /// Publish every change of the unit atomically and release its locks.
    async fn commit(self) -> Result<()>;

    /// Discard every change of the unit and release its locks.
    async fn rollback(self) -> Result<()>;
}

/// Account/user directory consumed by the query side.
#[async_trait]
pub trait Directory: Send + Sync {
    /// User by id.
    async fn user(&self, id: UserId) -> Result<Option<User>>;

    /// Accounts owned by a user, ascending by account number.
    async fn accounts_for_user(&self, id: UserId) -> Result<Vec<Account>>;
}
