//! PostgreSQL store against a live database.
//!
//! Ignored by default. Point `DATABASE_URL` at a scratch database and run:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/paywallet_test \
//!     cargo test -p paywallet-ledger --test postgres -- --ignored
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use paywallet_common::{AccountNumber, AmountError, Reference, WalletError};
use paywallet_ledger::{
    Account, AccountType, LedgerStore, NewTransaction, PgLedgerStore, PgStoreConfig,
    TransactionKind, UnitOfWork,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::OnceCell;

static MIGRATED: OnceCell<()> = OnceCell::const_new();
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Connect and apply the schema once per test binary. `None` when no
/// database is configured.
async fn connect(lock_timeout: Duration) -> Option<PgLedgerStore> {
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    }

    let config = PgStoreConfig {
        lock_timeout,
        ..PgStoreConfig::from_env()
    };
    let store = PgLedgerStore::connect(&config).await.unwrap();
    MIGRATED
        .get_or_try_init(|| store.migrate())
        .await
        .unwrap();
    Some(store)
}

fn unique(tag: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{tag}-{nanos}-{}", SEQUENCE.fetch_add(1, Ordering::Relaxed))
}

async fn active_account(store: &PgLedgerStore) -> Account {
    let name = unique("pg");
    let user = store
        .create_user(&name, &format!("{name}@example.com"))
        .await
        .unwrap();
    let account = store
        .open_account(user.id, AccountType::Wallet)
        .await
        .unwrap();
    store.activate_account(account.account_number).await.unwrap()
}

fn record(reference: &Reference, receiver: AccountNumber, amount: Decimal) -> NewTransaction {
    NewTransaction::pending(
        reference.clone(),
        TransactionKind::Credit,
        amount,
        "top up",
        "card",
        None,
        Some(receiver),
        Utc::now(),
    )
    .complete(Utc::now())
    .unwrap()
}

async fn credit(store: &PgLedgerStore, account: &Account, amount: Decimal) -> Reference {
    let reference = Reference::parse(unique("credit")).unwrap();
    let mut unit = store.begin().await.unwrap();
    unit.get_account_for_update(account.account_number)
        .await
        .unwrap()
        .unwrap();
    unit.apply_balance_delta(account.id, amount).await.unwrap();
    unit.insert_transaction(record(&reference, account.account_number, amount))
        .await
        .unwrap();
    unit.commit().await.unwrap();
    reference
}

async fn balance(store: &PgLedgerStore, account: &Account) -> Decimal {
    store
        .account(account.account_number)
        .await
        .unwrap()
        .unwrap()
        .balance
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn overdraft_is_refused_by_the_conditional_update() {
    let Some(store) = connect(Duration::from_secs(5)).await else {
        return;
    };
    let account = active_account(&store).await;
    credit(&store, &account, dec!(10.00)).await;

    let mut unit = store.begin().await.unwrap();
    unit.get_account_for_update(account.account_number)
        .await
        .unwrap()
        .unwrap();
    let err = unit
        .apply_balance_delta(account.id, dec!(-25.00))
        .await
        .unwrap_err();
    unit.rollback().await.unwrap();

    assert_eq!(
        err,
        WalletError::InsufficientFunds {
            account_number: account.account_number,
            required: dec!(25.00),
            available: dec!(10.00),
        }
    );
    assert_eq!(balance(&store, &account).await, dec!(10.00));
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn duplicate_reference_is_a_typed_error() {
    let Some(store) = connect(Duration::from_secs(5)).await else {
        return;
    };
    let account = active_account(&store).await;
    let reference = credit(&store, &account, dec!(5.00)).await;

    let mut unit = store.begin().await.unwrap();
    unit.get_account_for_update(account.account_number)
        .await
        .unwrap()
        .unwrap();
    unit.apply_balance_delta(account.id, dec!(5.00)).await.unwrap();
    let err = unit
        .insert_transaction(record(&reference, account.account_number, dec!(5.00)))
        .await
        .unwrap_err();
    drop(unit);

    assert_eq!(err, WalletError::DuplicateReference(reference.clone()));
    assert_eq!(balance(&store, &account).await, dec!(5.00));
    let stored = store.transaction_by_reference(&reference).await.unwrap();
    assert_eq!(stored.map(|t| t.amount), Some(dec!(5.00)));
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn dropped_unit_rolls_back() {
    let Some(store) = connect(Duration::from_secs(5)).await else {
        return;
    };
    let account = active_account(&store).await;
    let reference = Reference::parse(unique("abandoned")).unwrap();

    {
        let mut unit = store.begin().await.unwrap();
        unit.get_account_for_update(account.account_number)
            .await
            .unwrap()
            .unwrap();
        unit.apply_balance_delta(account.id, dec!(40.00)).await.unwrap();
        unit.insert_transaction(record(&reference, account.account_number, dec!(40.00)))
            .await
            .unwrap();
    }

    assert_eq!(balance(&store, &account).await, Decimal::ZERO);
    assert!(store
        .transaction_by_reference(&reference)
        .await
        .unwrap()
        .is_none());

    // The row lock went with the transaction.
    let mut unit = store.begin().await.unwrap();
    assert!(unit
        .get_account_for_update(account.account_number)
        .await
        .unwrap()
        .is_some());
    unit.rollback().await.unwrap();
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn row_lock_wait_is_bounded() {
    let Some(store) = connect(Duration::from_millis(100)).await else {
        return;
    };
    let account = active_account(&store).await;

    let mut holder = store.begin().await.unwrap();
    holder
        .get_account_for_update(account.account_number)
        .await
        .unwrap()
        .unwrap();

    let mut waiter = store.begin().await.unwrap();
    let err = waiter
        .get_account_for_update(account.account_number)
        .await
        .unwrap_err();
    assert!(matches!(err, WalletError::StorageConflict(_)), "{err:?}");
    assert!(err.is_transient());
    drop(waiter);

    holder.commit().await.unwrap();
    let mut unit = store.begin().await.unwrap();
    assert!(unit
        .get_account_for_update(account.account_number)
        .await
        .unwrap()
        .is_some());
    unit.rollback().await.unwrap();
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn balance_past_the_column_range_is_an_amount_error() {
    let Some(store) = connect(Duration::from_secs(5)).await else {
        return;
    };
    let account = active_account(&store).await;

    let mut unit = store.begin().await.unwrap();
    unit.get_account_for_update(account.account_number)
        .await
        .unwrap()
        .unwrap();
    let err = unit
        .apply_balance_delta(account.id, dec!(1000000000000000000.00))
        .await
        .unwrap_err();
    drop(unit);

    assert!(
        matches!(err, WalletError::InvalidAmount(AmountError::Overflow(_))),
        "{err:?}"
    );
    assert_eq!(balance(&store, &account).await, Decimal::ZERO);
}
