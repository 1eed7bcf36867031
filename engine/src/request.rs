//! Typed operation requests.
//!
//! Requests carry primitive values as received from callers. `validate`
//! turns them into a [`Posting`] before any storage is touched.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use paywallet_common::{
    AccountNumber, AccountSide, Amount, Deadline, Reference, Result, TransactionId, WalletError,
};
use paywallet_ledger::{
    EntryBatch, EntryType, LedgerEntry, NewTransaction, Transaction, TransactionKind,
};

use crate::config::EngineConfig;

/// Credit funds to one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditRequest {
    pub account_number: i64,
    pub amount: Decimal,
    pub description: String,
    pub payment_method: String,
    /// Idempotency key. Generated when absent.
    pub reference: Option<String>,
    #[serde(skip)]
    pub deadline: Option<Deadline>,
}

impl CreditRequest {
    pub fn new(
        account_number: i64,
        amount: Decimal,
        description: impl Into<String>,
        payment_method: impl Into<String>,
    ) -> Self {
        Self {
            account_number,
            amount,
            description: description.into(),
            payment_method: payment_method.into(),
            reference: None,
            deadline: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub(crate) fn validate(&self, config: &EngineConfig) -> Result<Posting> {
        Posting::build(
            TransactionKind::Credit,
            self.amount,
            None,
            Some(account(self.account_number, AccountSide::Account)?),
            &self.description,
            &self.payment_method,
            self.reference.as_deref(),
            config,
        )
    }
}

/// Debit funds from one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebitRequest {
    pub account_number: i64,
    pub amount: Decimal,
    pub description: String,
    pub payment_method: String,
    pub reference: Option<String>,
    #[serde(skip)]
    pub deadline: Option<Deadline>,
}

impl DebitRequest {
    pub fn new(
        account_number: i64,
        amount: Decimal,
        description: impl Into<String>,
        payment_method: impl Into<String>,
    ) -> Self {
        Self {
            account_number,
            amount,
            description: description.into(),
            payment_method: payment_method.into(),
            reference: None,
            deadline: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub(crate) fn validate(&self, config: &EngineConfig) -> Result<Posting> {
        Posting::build(
            TransactionKind::Debit,
            self.amount,
            Some(account(self.account_number, AccountSide::Account)?),
            None,
            &self.description,
            &self.payment_method,
            self.reference.as_deref(),
            config,
        )
    }
}

/// Move funds between two accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub sender: i64,
    pub receiver: i64,
    pub amount: Decimal,
    pub description: String,
    pub payment_method: String,
    pub reference: Option<String>,
    #[serde(skip)]
    pub deadline: Option<Deadline>,
}

impl TransferRequest {
    pub fn new(
        sender: i64,
        receiver: i64,
        amount: Decimal,
        description: impl Into<String>,
        payment_method: impl Into<String>,
    ) -> Self {
        Self {
            sender,
            receiver,
            amount,
            description: description.into(),
            payment_method: payment_method.into(),
            reference: None,
            deadline: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub(crate) fn validate(&self, config: &EngineConfig) -> Result<Posting> {
        let sender = account(self.sender, AccountSide::Sender)?;
        let receiver = account(self.receiver, AccountSide::Receiver)?;
        // Reported ahead of amount errors.
        if sender == receiver {
            return Err(WalletError::SameAccountTransfer(sender));
        }

        Posting::build(
            TransactionKind::Transfer,
            self.amount,
            Some(sender),
            Some(receiver),
            &self.description,
            &self.payment_method,
            self.reference.as_deref(),
            config,
        )
    }
}

/// Undo a completed transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReversalRequest {
    pub original: TransactionId,
    pub description: String,
    pub reference: Option<String>,
    #[serde(skip)]
    pub deadline: Option<Deadline>,
}

impl ReversalRequest {
    pub fn new(original: TransactionId, description: impl Into<String>) -> Self {
        Self {
            original,
            description: description.into(),
            reference: None,
            deadline: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Build the posting that undoes `original`: the receiver pays back the
    /// sender.
    pub(crate) fn validate(&self, original: &Transaction, config: &EngineConfig) -> Result<Posting> {
        if original.kind == TransactionKind::Reversal {
            return Err(WalletError::invalid_field(
                "original",
                format!("transaction {} is itself a reversal", original.id),
            ));
        }

        let mut posting = Posting::build(
            TransactionKind::Reversal,
            original.amount,
            original.receiver_account,
            original.sender_account,
            &self.description,
            &original.payment_method,
            self.reference.as_deref(),
            config,
        )?;
        posting.reverses = Some(original.id);
        Ok(posting)
    }
}

fn account(number: i64, side: AccountSide) -> Result<AccountNumber> {
    let account_number = AccountNumber::new(number);
    if !account_number.is_valid() {
        return Err(WalletError::AccountNotFound {
            account_number,
            side,
        });
    }
    Ok(account_number)
}

/// A validated money movement, ready to run in a unit of work.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Posting {
    pub kind: TransactionKind,
    pub amount: Amount,
    pub sender: Option<AccountNumber>,
    pub receiver: Option<AccountNumber>,
    pub description: String,
    pub payment_method: String,
    /// Caller-supplied reference.
    pub reference: Option<Reference>,
    pub reverses: Option<TransactionId>,
}

impl Posting {
    #[allow(clippy::too_many_arguments)]
    fn build(
        kind: TransactionKind,
        amount: Decimal,
        sender: Option<AccountNumber>,
        receiver: Option<AccountNumber>,
        description: &str,
        payment_method: &str,
        reference: Option<&str>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let amount = Amount::new(amount)?;

        let description = description.trim();
        if description.chars().count() > config.max_description_len {
            return Err(WalletError::invalid_field(
                "description",
                format!(
                    "description exceeds {} characters",
                    config.max_description_len
                ),
            ));
        }
        if description.chars().any(char::is_control) {
            return Err(WalletError::invalid_field(
                "description",
                "description contains control characters",
            ));
        }

        let payment_method = payment_method.trim();
        if payment_method.is_empty() {
            return Err(WalletError::invalid_field(
                "payment_method",
                "payment method is required",
            ));
        }
        if payment_method.chars().count() > config.max_payment_method_len
            || !payment_method
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(WalletError::invalid_field(
                "payment_method",
                format!("invalid payment method {payment_method:?}"),
            ));
        }

        let reference = reference.map(Reference::parse).transpose()?;

        Ok(Self {
            kind,
            amount,
            sender,
            receiver,
            description: description.to_string(),
            payment_method: payment_method.to_string(),
            reference,
            reverses: None,
        })
    }

    /// Accounts to lock, ascending by account number, with the side each
    /// plays in the request.
    pub fn lock_order(&self) -> Vec<(AccountNumber, AccountSide)> {
        let (side_of_sender, side_of_receiver) = match (self.sender, self.receiver) {
            (Some(_), Some(_)) => (AccountSide::Sender, AccountSide::Receiver),
            _ => (AccountSide::Account, AccountSide::Account),
        };

        let mut accounts: Vec<_> = self
            .sender
            .map(|a| (a, side_of_sender))
            .into_iter()
            .chain(self.receiver.map(|a| (a, side_of_receiver)))
            .collect();
        accounts.sort_by_key(|(number, _)| *number);
        accounts.dedup_by_key(|(number, _)| *number);
        accounts
    }

    /// Balance effects, folded per account.
    pub fn entries(&self) -> Result<EntryBatch> {
        let amount = self.amount.value();
        let entries = self
            .sender
            .map(|a| LedgerEntry::new(a, EntryType::Debit, amount))
            .into_iter()
            .chain(
                self.receiver
                    .map(|a| LedgerEntry::new(a, EntryType::Credit, amount)),
            );
        Ok(EntryBatch::from_entries(entries)?)
    }

    /// Build the completed record for this posting.
    pub fn record_at(
        &self,
        reference: Reference,
        at: chrono::DateTime<chrono::Utc>,
    ) -> NewTransaction {
        let mut record = NewTransaction::pending(
            reference,
            self.kind,
            self.amount.value(),
            self.description.clone(),
            self.payment_method.clone(),
            self.sender,
            self.receiver,
            at,
        );
        if let Some(original) = self.reverses {
            record = record.reversing(original);
        }
        record
    }

    /// Whether an existing record describes this same operation.
    pub fn matches(&self, existing: &Transaction) -> bool {
        existing.kind == self.kind
            && existing.amount == self.amount.value()
            && existing.sender_account == self.sender
            && existing.receiver_account == self.receiver
            && existing.reverses == self.reverses
    }
}
