//! Read-only lookups over the ledger.

use std::sync::Arc;

use serde::Serialize;
use tracing::instrument;

use paywallet_common::{AccountNumber, AccountSide, Reference, Result, TransactionId, UserId, WalletError};
use paywallet_ledger::{Account, Directory, LedgerStore, Transaction, User};

/// A transaction with the account it is reported under.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountTransaction {
    pub account: Account,
    pub transaction: Transaction,
}

/// A transaction with its account and the account's owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionDetails {
    pub user: User,
    pub account: Account,
    pub transaction: Transaction,
}

/// Query service. Never mutates the store.
pub struct QueryService<S> {
    store: Arc<S>,
}

impl<S> Clone for QueryService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: LedgerStore + Directory> QueryService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Transaction by id.
    pub async fn transaction(&self, id: TransactionId) -> Result<Transaction> {
        self.store
            .transaction(id)
            .await?
            .ok_or_else(|| WalletError::NotFound(id.to_string()))
    }

    /// Transaction by reference.
    pub async fn transaction_by_reference(&self, reference: &str) -> Result<Transaction> {
        let reference = Reference::parse(reference)?;
        self.store
            .transaction_by_reference(&reference)
            .await?
            .ok_or_else(|| WalletError::NotFound(reference.to_string()))
    }

    /// Every transaction touching an account, ordered by creation time then
    /// id.
    #[instrument(skip(self))]
    pub async fn transactions_for_account(&self, account_number: i64) -> Result<Vec<Transaction>> {
        let account = self.account(account_number).await?;
        let mut transactions = self
            .store
            .transactions_for_account(account.account_number)
            .await?;
        transactions.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(transactions)
    }

    /// Account by number.
    pub async fn account(&self, account_number: i64) -> Result<Account> {
        let account_number = AccountNumber::new(account_number);
        self.store
            .account(account_number)
            .await?
            .ok_or(WalletError::AccountNotFound {
                account_number,
                side: AccountSide::Account,
            })
    }

    /// Accounts owned by a user.
    pub async fn accounts_for_user(&self, user_id: i64) -> Result<Vec<Account>> {
        let user = self.user(UserId::new(user_id)).await?;
        self.store.accounts_for_user(user.id).await
    }

    /// Owner of an account.
    pub async fn user_for_account(&self, account_number: i64) -> Result<User> {
        let account = self.account(account_number).await?;
        self.user(account.user_id).await
    }

    /// A transaction with the account it is reported under: the sender when
    /// there is one, otherwise the receiver.
    pub async fn account_and_transaction(&self, id: TransactionId) -> Result<AccountTransaction> {
        let transaction = self.transaction(id).await?;
        let account = self.primary_account(&transaction).await?;
        Ok(AccountTransaction {
            account,
            transaction,
        })
    }

    /// A transaction with its account and that account's owner.
    #[instrument(skip(self))]
    pub async fn transaction_details(&self, id: TransactionId) -> Result<TransactionDetails> {
        let AccountTransaction {
            account,
            transaction,
        } = self.account_and_transaction(id).await?;
        let user = self.user(account.user_id).await?;
        Ok(TransactionDetails {
            user,
            account,
            transaction,
        })
    }

    async fn user(&self, id: UserId) -> Result<User> {
        self.store
            .user(id)
            .await?
            .ok_or(WalletError::UserNotFound(id))
    }

    async fn primary_account(&self, transaction: &Transaction) -> Result<Account> {
        let account_number = transaction.primary_account().ok_or_else(|| {
            WalletError::Internal(format!("transaction {} has no accounts", transaction.id))
        })?;
        self.store
            .account(account_number)
            .await?
            .ok_or(WalletError::AccountNotFound {
                account_number,
                side: AccountSide::Account,
            })
    }
}
