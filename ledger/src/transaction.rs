//! Transaction records and their status machine.

use chrono::{DateTime, Utc};
use paywallet_common::{AccountNumber, Reference, TransactionId, WalletError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::journal::{EntryType, LedgerEntry};

/// Kind of money movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Funds arrive at a single account.
    Credit,
    /// Funds leave a single account.
    Debit,
    /// Funds move between two accounts.
    Transfer,
    /// Undoes the balance effects of an earlier transaction.
    Reversal,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Credit => "credit",
            TransactionKind::Debit => "debit",
            TransactionKind::Transfer => "transfer",
            TransactionKind::Reversal => "reversal",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit" => Ok(TransactionKind::Credit),
            "debit" => Ok(TransactionKind::Debit),
            "transfer" => Ok(TransactionKind::Transfer),
            "reversal" => Ok(TransactionKind::Reversal),
            other => Err(WalletError::Internal(format!(
                "unknown transaction kind {other:?}"
            ))),
        }
    }
}

/// Transaction status representing the lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Built, balance effects not yet applied.
    Pending,
    /// Balance effects committed.
    Completed,
    /// Aborted without balance effects.
    Failed,
    /// Undone by a later reversal transaction.
    Reversed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Reversed => "reversed",
        }
    }

    /// Check if this is a final state.
    pub fn is_final(&self) -> bool {
        matches!(self, TransactionStatus::Failed | TransactionStatus::Reversed)
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[TransactionStatus] {
        match self {
            TransactionStatus::Pending => {
                &[TransactionStatus::Completed, TransactionStatus::Failed]
            }
            TransactionStatus::Completed => &[TransactionStatus::Reversed],
            TransactionStatus::Failed => &[],
            TransactionStatus::Reversed => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            "reversed" => Ok(TransactionStatus::Reversed),
            other => Err(WalletError::Internal(format!(
                "unknown transaction status {other:?}"
            ))),
        }
    }
}

/// A transaction record before the store assigns its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub reference: Reference,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub description: String,
    pub payment_method: String,
    pub status: TransactionStatus,
    /// Account debited, if any.
    pub sender_account: Option<AccountNumber>,
    /// Account credited, if any.
    pub receiver_account: Option<AccountNumber>,
    /// Transaction undone by this one (reversals only).
    pub reverses: Option<TransactionId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NewTransaction {
    /// Start a pending record.
    #[allow(clippy::too_many_arguments)]
    pub fn pending(
        reference: Reference,
        kind: TransactionKind,
        amount: Decimal,
        description: impl Into<String>,
        payment_method: impl Into<String>,
        sender_account: Option<AccountNumber>,
        receiver_account: Option<AccountNumber>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            reference,
            kind,
            amount,
            description: description.into(),
            payment_method: payment_method.into(),
            status: TransactionStatus::Pending,
            sender_account,
            receiver_account,
            reverses: None,
            created_at,
            completed_at: None,
        }
    }

    /// Link this record to the transaction it reverses.
    pub fn reversing(mut self, original: TransactionId) -> Self {
        self.reverses = Some(original);
        self
    }

    /// Mark the record completed.
    pub fn complete(mut self, at: DateTime<Utc>) -> Result<Self, WalletError> {
        if !self.status.can_transition_to(TransactionStatus::Completed) {
            return Err(WalletError::Internal(format!(
                "record {} cannot complete from {}",
                self.reference, self.status
            )));
        }
        self.status = TransactionStatus::Completed;
        self.completed_at = Some(at);
        Ok(self)
    }

    /// Assign the store id.
    pub fn with_id(self, id: TransactionId) -> Transaction {
        Transaction {
            id,
            reference: self.reference,
            kind: self.kind,
            amount: self.amount,
            description: self.description,
            payment_method: self.payment_method,
            status: self.status,
            sender_account: self.sender_account,
            receiver_account: self.receiver_account,
            reverses: self.reverses,
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }

    /// Balance effects of this record.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        entries_for(self.sender_account, self.receiver_account, self.amount)
    }
}

/// A persisted transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub reference: Reference,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub description: String,
    pub payment_method: String,
    pub status: TransactionStatus,
    pub sender_account: Option<AccountNumber>,
    pub receiver_account: Option<AccountNumber>,
    pub reverses: Option<TransactionId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Balance effects of this transaction.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        entries_for(self.sender_account, self.receiver_account, self.amount)
    }

    /// Whether the transaction touches the given account.
    pub fn involves(&self, account: AccountNumber) -> bool {
        self.sender_account == Some(account) || self.receiver_account == Some(account)
    }

    /// The account a single-account lookup reports for this transaction:
    /// the sender when there is one, the receiver otherwise.
    pub fn primary_account(&self) -> Option<AccountNumber> {
        self.sender_account.or(self.receiver_account)
    }

    /// Transition the status, enforcing the lifecycle.
    pub fn transition_to(&mut self, next: TransactionStatus) -> Result<(), WalletError> {
        if !self.status.can_transition_to(next) {
            return Err(WalletError::InvalidTransition {
                transaction_id: self.id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

fn entries_for(
    sender: Option<AccountNumber>,
    receiver: Option<AccountNumber>,
    amount: Decimal,
) -> Vec<LedgerEntry> {
    let mut entries = Vec::with_capacity(2);
    if let Some(account) = sender {
        entries.push(LedgerEntry::new(account, EntryType::Debit, amount));
    }
    if let Some(account) = receiver {
        entries.push(LedgerEntry::new(account, EntryType::Credit, amount));
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn transfer() -> NewTransaction {
        NewTransaction::pending(
            Reference::parse("ref-1").unwrap(),
            TransactionKind::Transfer,
            dec!(40.00),
            "rent",
            "wallet",
            Some(AccountNumber::new(1)),
            Some(AccountNumber::new(2)),
            Utc::now(),
        )
    }

    #[test]
    fn test_valid_transitions() {
        assert!(TransactionStatus::Pending.can_transition_to(TransactionStatus::Completed));
        assert!(TransactionStatus::Pending.can_transition_to(TransactionStatus::Failed));
        assert!(TransactionStatus::Completed.can_transition_to(TransactionStatus::Reversed));
        assert!(!TransactionStatus::Completed.can_transition_to(TransactionStatus::Failed));
        assert!(!TransactionStatus::Reversed.can_transition_to(TransactionStatus::Completed));
        assert!(TransactionStatus::Reversed.is_final());
    }

    #[test]
    fn test_complete_and_assign_id() {
        let record = transfer().complete(Utc::now()).unwrap();
        assert_eq!(record.status, TransactionStatus::Completed);
        assert!(record.completed_at.is_some());

        let mut tx = record.with_id(TransactionId::new(9));
        assert_eq!(tx.id, TransactionId::new(9));
        assert!(tx.involves(AccountNumber::new(2)));
        assert_eq!(tx.primary_account(), Some(AccountNumber::new(1)));

        tx.transition_to(TransactionStatus::Reversed).unwrap();
        assert!(matches!(
            tx.transition_to(TransactionStatus::Reversed),
            Err(WalletError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_transfer_entries_balance() {
        let entries = transfer().entries();
        assert_eq!(entries.len(), 2);
        let net: Decimal = entries.iter().map(|e| e.delta()).sum();
        assert_eq!(net, Decimal::ZERO);
    }

    #[test]
    fn test_serialized_shape() {
        let tx = transfer().with_id(TransactionId::new(1));
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["kind"], "transfer");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["reference"], "ref-1");
        assert_eq!(json["sender_account"], 1);
    }
}
