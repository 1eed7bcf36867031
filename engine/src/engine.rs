//! Transaction engine.
//!
//! Every operation runs as one unit of work: lock the involved accounts in
//! ascending account-number order, check them, apply the balance deltas,
//! insert the completed record and commit. Any error (or the caller's
//! future being dropped) discards the unit, so no partial state is ever
//! published.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use paywallet_common::{
    Clock, Deadline, Reference, ReferenceGenerator, Result, SystemClock, TransactionId,
    WalletError,
};
use paywallet_ledger::{LedgerStore, Transaction, UnitOfWork};

use crate::config::EngineConfig;
use crate::metrics::{EngineMetrics, SharedMetrics};
use crate::request::{CreditRequest, DebitRequest, Posting, ReversalRequest, TransferRequest};
use crate::retry::RetryPolicy;

enum Outcome {
    /// The unit committed a new record.
    Applied(Transaction),
    /// The reference already named this same operation.
    Replayed(Transaction),
}

/// Orchestrates money movement on top of a [`LedgerStore`].
///
/// The engine holds no balances itself; it can be shared freely between
/// tasks behind an `Arc`.
pub struct TransactionEngine<S: LedgerStore> {
    store: Arc<S>,
    config: EngineConfig,
    retry: RetryPolicy,
    references: ReferenceGenerator,
    clock: Arc<dyn Clock>,
    metrics: SharedMetrics,
}

impl<S: LedgerStore> TransactionEngine<S> {
    /// Create an engine over `store`.
    pub fn new(store: Arc<S>, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            references: config.reference_generator()?,
            retry: RetryPolicy::new(&config.retry),
            store,
            config,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(EngineMetrics::new()),
        })
    }

    /// Replace the clock used for record timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Credit an account.
    #[instrument(
        skip(self, request),
        fields(account = request.account_number, amount = %request.amount, reference = ?request.reference)
    )]
    pub async fn credit(&self, request: CreditRequest) -> Result<Transaction> {
        let posting = request.validate(&self.config);
        self.run(posting, request.deadline).await
    }

    /// Debit an account. Fails with `InsufficientFunds` rather than letting
    /// the balance go negative.
    #[instrument(
        skip(self, request),
        fields(account = request.account_number, amount = %request.amount, reference = ?request.reference)
    )]
    pub async fn debit(&self, request: DebitRequest) -> Result<Transaction> {
        let posting = request.validate(&self.config);
        self.run(posting, request.deadline).await
    }

    /// Move funds from `sender` to `receiver` as one record.
    #[instrument(
        skip(self, request),
        fields(
            sender = request.sender,
            receiver = request.receiver,
            amount = %request.amount,
            reference = ?request.reference
        )
    )]
    pub async fn transfer(&self, request: TransferRequest) -> Result<Transaction> {
        let posting = request.validate(&self.config);
        self.run(posting, request.deadline).await
    }

    /// Undo a completed transaction with a new reversal record and mark the
    /// original reversed, in one unit.
    #[instrument(
        skip(self, request),
        fields(original = %request.original, reference = ?request.reference)
    )]
    pub async fn reverse(&self, request: ReversalRequest) -> Result<Transaction> {
        let posting = match self.store.transaction(request.original).await {
            Ok(Some(original)) => request.validate(&original, &self.config),
            Ok(None) => Err(WalletError::NotFound(request.original.to_string())),
            Err(e) => Err(e),
        };
        self.run(posting, request.deadline).await
    }

    async fn run(&self, posting: Result<Posting>, deadline: Option<Deadline>) -> Result<Transaction> {
        let _in_flight = self.metrics.operation_started();

        let outcome = match posting {
            Ok(posting) => self.execute(&posting, deadline).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(Outcome::Applied(tx)) => {
                self.metrics.completed(tx.kind);
                info!(
                    transaction_id = %tx.id,
                    reference = %tx.reference,
                    kind = %tx.kind,
                    amount = %tx.amount,
                    "Transaction completed"
                );
                Ok(tx)
            }
            Ok(Outcome::Replayed(tx)) => {
                self.metrics.replayed();
                debug!(
                    transaction_id = %tx.id,
                    reference = %tx.reference,
                    "Returning existing transaction for reference"
                );
                Ok(tx)
            }
            Err(e) => {
                if matches!(e, WalletError::Canceled(_)) {
                    self.metrics.canceled();
                } else {
                    self.metrics.failed();
                }
                if e.is_retryable() {
                    warn!(error = %e, code = e.error_code(), "Transaction failed");
                } else {
                    info!(error = %e, code = e.error_code(), "Transaction rejected");
                }
                Err(e)
            }
        }
    }

    async fn execute(&self, posting: &Posting, deadline: Option<Deadline>) -> Result<Outcome> {
        let default = Deadline::after(self.config.operation_timeout);
        let deadline = deadline.map_or(default, |d| d.min(default));
        if deadline.is_exceeded() {
            return Err(WalletError::Canceled(
                "deadline exceeded before start".to_string(),
            ));
        }

        // Retries reuse the reference, so an attempt whose commit succeeded
        // but was reported as failed is recognised as a replay.
        let reference = match &posting.reference {
            Some(reference) => reference.clone(),
            None => self.references.next_reference(),
        };

        let until = tokio::time::Instant::from_std(deadline.instant());
        match tokio::time::timeout_at(until, self.execute_with_retry(posting, &reference)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(reference = %reference, "Deadline exceeded, unit of work discarded");
                Err(WalletError::Canceled(format!(
                    "deadline exceeded for {reference}"
                )))
            }
        }
    }

    async fn execute_with_retry(&self, posting: &Posting, reference: &Reference) -> Result<Outcome> {
        self.retry
            .run(
                posting.kind.as_str(),
                |_, _| self.metrics.storage_retry(),
                |attempt| self.attempt(posting, reference, attempt),
            )
            .await
    }

    async fn attempt(&self, posting: &Posting, reference: &Reference, attempt: u32) -> Result<Outcome> {
        // Replays of a caller reference skip the unit entirely.
        if posting.reference.is_some() {
            if let Some(existing) = self.store.transaction_by_reference(reference).await? {
                return replay_or_conflict(posting, existing).map(Outcome::Replayed);
            }
        }

        let mut unit = self.store.begin().await?;

        let result = match self.apply(&mut unit, posting, reference).await {
            Ok(Outcome::Applied(tx)) => unit.commit().await.map(|()| Outcome::Applied(tx)),
            Ok(replayed) => {
                unit.rollback().await?;
                Ok(replayed)
            }
            Err(e) => {
                if let Err(rollback_err) = unit.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                debug!(attempt, error = %e, "Unit of work rolled back");
                Err(e)
            }
        };

        match result {
            // A concurrent request with the same reference got there first.
            Err(WalletError::DuplicateReference(_)) => {
                match self.store.transaction_by_reference(reference).await? {
                    Some(existing) => replay_or_conflict(posting, existing).map(Outcome::Replayed),
                    None => Err(WalletError::DuplicateReference(reference.clone())),
                }
            }
            other => other,
        }
    }

    async fn apply(
        &self,
        unit: &mut S::Unit,
        posting: &Posting,
        reference: &Reference,
    ) -> Result<Outcome> {
        let mut locked = BTreeMap::new();
        for (account_number, side) in posting.lock_order() {
            let account = unit
                .get_account_for_update(account_number)
                .await?
                .ok_or(WalletError::AccountNotFound {
                    account_number,
                    side,
                })?;
            account.ensure_active()?;
            locked.insert(account_number, account);
        }

        // Checked under the row locks: a concurrent request with the same
        // reference has either committed by now or not touched these rows.
        if let Some(existing) = unit.transaction_by_reference(reference).await? {
            return replay_or_conflict(posting, existing).map(Outcome::Replayed);
        }

        if let Some(original) = posting.reverses {
            self.reverse_original(unit, original).await?;
        }

        for (account_number, delta) in posting.entries()?.account_deltas() {
            let account = locked.get(&account_number).ok_or_else(|| {
                WalletError::Internal(format!("account {account_number} was not locked"))
            })?;
            let balance = unit.apply_balance_delta(account.id, delta).await?;
            debug!(account = %account_number, %delta, %balance, "Balance updated");
        }

        let now = self.clock.now();
        let record = posting.record_at(reference.clone(), now).complete(now)?;
        let tx = unit.insert_transaction(record).await?;
        Ok(Outcome::Applied(tx))
    }

    async fn reverse_original(&self, unit: &mut S::Unit, original: TransactionId) -> Result<()> {
        let current = unit
            .transaction_for_update(original)
            .await?
            .ok_or_else(|| WalletError::NotFound(original.to_string()))?;
        debug!(original = %original, status = %current.status, "Reversing transaction");

        unit.mark_reversed(original).await?;
        Ok(())
    }
}

fn replay_or_conflict(posting: &Posting, existing: Transaction) -> Result<Transaction> {
    if posting.matches(&existing) {
        Ok(existing)
    } else {
        Err(WalletError::DuplicateReference(existing.reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paywallet_common::{AccountNumber, AccountSide, ManualClock};
    use paywallet_ledger::{AccountType, InMemoryLedgerStore, TransactionKind, TransactionStatus};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<InMemoryLedgerStore>,
        engine: TransactionEngine<InMemoryLedgerStore>,
        a: i64,
        b: i64,
    }

    async fn create_test_engine() -> Fixture {
        let store = Arc::new(InMemoryLedgerStore::new());
        let user = store.create_user("alice", "alice@example.com");
        let a = store.open_account(user.id, AccountType::Wallet).unwrap();
        let b = store.open_account(user.id, AccountType::Savings).unwrap();
        store.activate_account(a.account_number).await.unwrap();
        store.activate_account(b.account_number).await.unwrap();

        let engine = TransactionEngine::new(store.clone(), EngineConfig::default()).unwrap();
        engine
            .credit(CreditRequest::new(a.account_number.value(), dec!(100.00), "seed", "cash"))
            .await
            .unwrap();

        Fixture {
            store,
            engine,
            a: a.account_number.value(),
            b: b.account_number.value(),
        }
    }

    async fn balance(store: &InMemoryLedgerStore, number: i64) -> Decimal {
        store
            .account(AccountNumber::new(number))
            .await
            .unwrap()
            .unwrap()
            .balance
    }

    #[tokio::test]
    async fn test_overdraft_rejected() {
        let f = create_test_engine().await;

        let err = f
            .engine
            .debit(DebitRequest::new(f.a, dec!(150.00), "too much", "card"))
            .await
            .unwrap_err();

        assert!(matches!(err, WalletError::InsufficientFunds { .. }));
        assert_eq!(balance(&f.store, f.a).await, dec!(100.00));
        assert_eq!(f.store.transaction_count(), 1);
    }

    #[tokio::test]
    async fn test_transfer_moves_funds() {
        let f = create_test_engine().await;

        let tx = f
            .engine
            .transfer(TransferRequest::new(f.a, f.b, dec!(40.00), "rent", "wallet"))
            .await
            .unwrap();

        assert_eq!(tx.kind, TransactionKind::Transfer);
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(tx.amount, dec!(40.00));
        assert_eq!(tx.sender_account, Some(AccountNumber::new(f.a)));
        assert_eq!(tx.receiver_account, Some(AccountNumber::new(f.b)));
        assert!(tx.completed_at.is_some());
        assert!(tx.reference.as_str().starts_with("TXN-"));

        assert_eq!(balance(&f.store, f.a).await, dec!(60.00));
        assert_eq!(balance(&f.store, f.b).await, dec!(40.00));
    }

    #[tokio::test]
    async fn test_credit_replay() {
        let f = create_test_engine().await;
        let request = CreditRequest::new(f.b, dec!(25.00), "refund", "card").with_reference("ref-42");

        let first = f.engine.credit(request.clone()).await.unwrap();
        let second = f.engine.credit(request).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(balance(&f.store, f.b).await, dec!(25.00));
        assert_eq!(f.engine.metrics().snapshot().replays, 1);
    }

    #[tokio::test]
    async fn test_reference_reused_for_different_operation() {
        let f = create_test_engine().await;
        f.engine
            .credit(CreditRequest::new(f.b, dec!(5.00), "x", "card").with_reference("ref-1"))
            .await
            .unwrap();

        let err = f
            .engine
            .debit(DebitRequest::new(f.a, dec!(5.00), "x", "card").with_reference("ref-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::DuplicateReference(_)));
        assert_eq!(balance(&f.store, f.a).await, dec!(100.00));
    }

    #[tokio::test]
    async fn test_missing_and_inactive_accounts() {
        let f = create_test_engine().await;

        let err = f
            .engine
            .transfer(TransferRequest::new(f.a, 9_999_999_999, dec!(1), "x", "wallet"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            WalletError::AccountNotFound {
                account_number: AccountNumber::new(9_999_999_999),
                side: AccountSide::Receiver,
            }
        );

        f.store.deactivate_account(AccountNumber::new(f.b)).await.unwrap();
        let err = f
            .engine
            .transfer(TransferRequest::new(f.a, f.b, dec!(1), "x", "wallet"))
            .await
            .unwrap_err();
        assert_eq!(err, WalletError::AccountInactive(AccountNumber::new(f.b)));
        assert_eq!(balance(&f.store, f.a).await, dec!(100.00));
    }

    #[tokio::test]
    async fn test_reverse_transfer() {
        let f = create_test_engine().await;
        let original = f
            .engine
            .transfer(TransferRequest::new(f.a, f.b, dec!(30.00), "oops", "wallet"))
            .await
            .unwrap();

        let reversal = f
            .engine
            .reverse(ReversalRequest::new(original.id, "undo"))
            .await
            .unwrap();

        assert_eq!(reversal.kind, TransactionKind::Reversal);
        assert_eq!(reversal.reverses, Some(original.id));
        assert_eq!(reversal.sender_account, original.receiver_account);
        assert_eq!(balance(&f.store, f.a).await, dec!(100.00));
        assert_eq!(balance(&f.store, f.b).await, Decimal::ZERO);

        let stored = f.store.transaction(original.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Reversed);

        let err = f
            .engine
            .reverse(ReversalRequest::new(original.id, "again"))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InvalidTransition { .. }));

        let err = f
            .engine
            .reverse(ReversalRequest::new(reversal.id, "undo the undo"))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_reverse_spent_credit() {
        let f = create_test_engine().await;
        let credit = f
            .engine
            .credit(CreditRequest::new(f.b, dec!(10.00), "gift", "card"))
            .await
            .unwrap();
        f.engine
            .debit(DebitRequest::new(f.b, dec!(10.00), "spent", "card"))
            .await
            .unwrap();

        let err = f
            .engine
            .reverse(ReversalRequest::new(credit.id, "chargeback"))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { .. }));

        let stored = f.store.transaction(credit.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn test_reverse_unknown_transaction() {
        let f = create_test_engine().await;
        let err = f
            .engine
            .reverse(ReversalRequest::new(TransactionId::new(404), "?"))
            .await
            .unwrap_err();
        assert_eq!(err, WalletError::NotFound("404".to_string()));
    }

    #[tokio::test]
    async fn test_record_timestamps_use_clock() {
        let f = create_test_engine().await;
        let start = chrono::Utc::now() - chrono::Duration::days(1);
        let clock = Arc::new(ManualClock::new(start));
        let engine = TransactionEngine::new(f.store.clone(), EngineConfig::default())
            .unwrap()
            .with_clock(clock.clone());

        let tx = engine
            .credit(CreditRequest::new(f.a, dec!(1.00), "x", "cash"))
            .await
            .unwrap();
        assert_eq!(tx.created_at, start);
        assert_eq!(tx.completed_at, Some(start));

        clock.advance(chrono::Duration::minutes(5));
        let later = engine
            .credit(CreditRequest::new(f.a, dec!(1.00), "y", "cash"))
            .await
            .unwrap();
        assert_eq!(later.created_at, start + chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn test_validation_happens_before_storage() {
        let f = create_test_engine().await;
        f.store
            .faults()
            .fail_next_commit(WalletError::Internal("must not be reached".into()));

        let err = f
            .engine
            .credit(CreditRequest::new(f.a, dec!(1.005), "x", "cash"))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InvalidAmount(_)));
        assert_eq!(f.store.faults().pending_failures(), 1);
    }

    #[tokio::test]
    async fn test_transient_commit_failure_is_retried() {
        let f = create_test_engine().await;
        f.store
            .faults()
            .fail_next_commit(WalletError::StorageConflict("serialization".into()));

        f.engine
            .credit(CreditRequest::new(f.b, dec!(7.00), "x", "cash"))
            .await
            .unwrap();

        assert_eq!(balance(&f.store, f.b).await, dec!(7.00));
        assert_eq!(f.engine.metrics().snapshot().storage_retries, 1);
    }

    #[tokio::test]
    async fn test_transient_replay_lookup_is_retried() {
        let f = create_test_engine().await;
        let request = DebitRequest::new(f.a, dec!(10.00), "x", "card").with_reference("ref-lookup");
        let first = f.engine.debit(request.clone()).await.unwrap();

        f.store
            .faults()
            .fail_next_lookup(WalletError::StorageUnavailable("replica".into()));
        let second = f.engine.debit(request).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(balance(&f.store, f.a).await, dec!(90.00));
        let snapshot = f.engine.metrics().snapshot();
        assert_eq!(snapshot.storage_retries, 1);
        assert_eq!(snapshot.replays, 1);
        assert_eq!(f.store.faults().pending_failures(), 0);
    }

    #[tokio::test]
    async fn test_expired_deadline_cancels() {
        let f = create_test_engine().await;
        let err = f
            .engine
            .debit(
                DebitRequest::new(f.a, dec!(1.00), "x", "card")
                    .with_deadline(Deadline::at(std::time::Instant::now())),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, WalletError::Canceled(_)));
        assert_eq!(err.status_code(), 504);
        assert_eq!(balance(&f.store, f.a).await, dec!(100.00));
    }
}
