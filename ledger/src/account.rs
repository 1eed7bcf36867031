//! Account and user records.

use chrono::{DateTime, Utc};
use paywallet_common::{AccountId, AccountNumber, UserId, WalletError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Account status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Opened but not yet confirmed; cannot transact.
    PendingActivation,
    /// Account is active and can transact.
    Active,
    /// Soft-deleted. Kept for history, never transacts again.
    Deactivated,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::PendingActivation => "pending_activation",
            AccountStatus::Active => "active",
            AccountStatus::Deactivated => "deactivated",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_activation" => Ok(AccountStatus::PendingActivation),
            "active" => Ok(AccountStatus::Active),
            "deactivated" => Ok(AccountStatus::Deactivated),
            other => Err(WalletError::Internal(format!("unknown account status {other:?}"))),
        }
    }
}

/// Account type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Checking,
    Savings,
    Wallet,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Checking => "checking",
            AccountType::Savings => "savings",
            AccountType::Wallet => "wallet",
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checking" => Ok(AccountType::Checking),
            "savings" => Ok(AccountType::Savings),
            "wallet" => Ok(AccountType::Wallet),
            other => Err(WalletError::invalid_field(
                "account_type",
                format!("unknown account type {other:?}"),
            )),
        }
    }
}

/// A ledger account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Store-assigned identifier.
    pub id: AccountId,
    /// External account number.
    pub account_number: AccountNumber,
    /// Owning user (a lookup relation, the user owns the account).
    pub user_id: UserId,
    /// Account type.
    pub account_type: AccountType,
    /// Current balance. Only the store writes this.
    pub balance: Decimal,
    /// Account status.
    pub status: AccountStatus,
    /// When the account was created.
    pub created_at: DateTime<Utc>,
    /// When the account was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Create a new account with zero balance, pending activation.
    pub fn new(
        id: AccountId,
        account_number: AccountNumber,
        user_id: UserId,
        account_type: AccountType,
    ) -> Self {
        let now = Utc::now();

        Self {
            id,
            account_number,
            user_id,
            account_type,
            balance: Decimal::ZERO,
            status: AccountStatus::PendingActivation,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if account can transact.
    pub fn can_transact(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Check if account has sufficient funds for a debit.
    pub fn has_sufficient_funds(&self, amount: Decimal) -> bool {
        self.balance >= amount
    }

    /// Confirm the account.
    pub fn activate(&mut self) {
        self.status = AccountStatus::Active;
        self.updated_at = Utc::now();
    }

    /// Soft-delete the account.
    pub fn deactivate(&mut self) {
        self.status = AccountStatus::Deactivated;
        self.updated_at = Utc::now();
    }

    /// Fail unless the account is active.
    pub fn ensure_active(&self) -> paywallet_common::Result<()> {
        if self.can_transact() {
            Ok(())
        } else {
            Err(WalletError::AccountInactive(self.account_number))
        }
    }
}

/// A wallet user, as seen by the ledger. Credentials live elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: UserId, username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            email: email.into(),
            is_active: true,
            created_at: Utc::now(),
        }
    }
}
