//! Ledger entries: the balance effects of a transaction.

use paywallet_common::{AccountNumber, AmountError, MAX_AMOUNT};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Direction of a balance effect, from the account holder's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Funds leave the account.
    Debit,
    /// Funds arrive at the account.
    Credit,
}

/// A single balance effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Account affected.
    pub account_number: AccountNumber,
    /// Entry type (debit or credit).
    pub entry_type: EntryType,
    /// Unsigned amount.
    pub amount: Decimal,
}

impl LedgerEntry {
    pub fn new(account_number: AccountNumber, entry_type: EntryType, amount: Decimal) -> Self {
        Self {
            account_number,
            entry_type,
            amount,
        }
    }

    /// Signed change to the account balance.
    pub fn delta(&self) -> Decimal {
        match self.entry_type {
            EntryType::Debit => -self.amount,
            EntryType::Credit => self.amount,
        }
    }
}

/// Entries that must be applied together, folded per account.
///
/// Accounts iterate in ascending account-number order, which is the order
/// units of work must lock them in.
#[derive(Debug, Clone, Default)]
pub struct EntryBatch {
    entries: Vec<LedgerEntry>,
    deltas: BTreeMap<AccountNumber, Decimal>,
}

impl EntryBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a batch from entries, failing if an account's folded delta
    /// overflows.
    pub fn from_entries(
        entries: impl IntoIterator<Item = LedgerEntry>,
    ) -> Result<Self, AmountError> {
        let mut batch = EntryBatch::new();
        for entry in entries {
            batch.add_entry(entry)?;
        }
        Ok(batch)
    }

    /// Add an entry to the batch.
    pub fn add_entry(&mut self, entry: LedgerEntry) -> Result<(), AmountError> {
        let current = self
            .deltas
            .get(&entry.account_number)
            .copied()
            .unwrap_or(Decimal::ZERO);
        let folded = current
            .checked_add(entry.delta())
            .filter(|next| next.abs() <= MAX_AMOUNT)
            .ok_or_else(|| {
                AmountError::Overflow(format!("delta for account {}", entry.account_number))
            })?;
        self.deltas.insert(entry.account_number, folded);
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Net signed change per account, ascending by account number.
    pub fn account_deltas(&self) -> impl Iterator<Item = (AccountNumber, Decimal)> + '_ {
        self.deltas.iter().map(|(account, delta)| (*account, *delta))
    }

    /// Accounts touched, ascending by account number.
    pub fn accounts(&self) -> Vec<AccountNumber> {
        self.deltas.keys().copied().collect()
    }

    /// Sum of all deltas.
    pub fn net(&self) -> Decimal {
        self.deltas.values().copied().sum()
    }

    /// Verify the batch moves money without creating or destroying it.
    pub fn is_balanced(&self) -> bool {
        self.net() == Decimal::ZERO
    }

    /// Get total debits.
    pub fn total_debits(&self) -> Decimal {
        self.entries
            .iter()
            .filter(|e| e.entry_type == EntryType::Debit)
            .map(|e| e.amount)
            .sum()
    }

    /// Get total credits.
    pub fn total_credits(&self) -> Decimal {
        self.entries
            .iter()
            .filter(|e| e.entry_type == EntryType::Credit)
            .map(|e| e.amount)
            .sum()
    }
}
