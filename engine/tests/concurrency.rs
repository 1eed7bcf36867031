mod common;

use std::time::Duration;

use common::Bank;
use futures::future::join_all;
use paywallet_common::WalletError;
use paywallet_engine::{CreditRequest, DebitRequest, EngineConfig, RetryConfig, TransferRequest};
use paywallet_ledger::MemoryStoreConfig;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_debits_never_overdraw() {
    let bank = Bank::open(&[dec!(100.00)]).await;
    let a = bank.accounts[0];
    let amount = dec!(15.00);

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let engine = bank.engine.clone();
            tokio::spawn(async move {
                engine
                    .debit(DebitRequest::new(a, amount, format!("coffee {i}"), "card"))
                    .await
            })
        })
        .collect();

    let mut succeeded = 0;
    for handle in join_all(handles).await {
        match handle.unwrap() {
            Ok(_) => succeeded += 1,
            Err(WalletError::InsufficientFunds { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    // floor(100 / 15)
    assert_eq!(succeeded, 6);
    assert_eq!(bank.balance(a).await, dec!(10.00));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn opposite_transfers_do_not_deadlock() {
    let bank = Bank::open(&[dec!(1000), dec!(1000)]).await;
    let (a, b) = (bank.accounts[0], bank.accounts[1]);

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let engine = bank.engine.clone();
            let (from, to) = if i % 2 == 0 { (a, b) } else { (b, a) };
            tokio::spawn(async move {
                engine
                    .transfer(TransferRequest::new(from, to, dec!(3.00), "ping", "wallet"))
                    .await
            })
        })
        .collect();

    let results = tokio::time::timeout(Duration::from_secs(10), join_all(handles))
        .await
        .expect("transfers deadlocked");
    for result in results {
        result.unwrap().unwrap();
    }

    assert_eq!(bank.balance(a).await, dec!(1000));
    assert_eq!(bank.balance(b).await, dec!(1000));
    assert_eq!(bank.engine.metrics().snapshot().transfers, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_with_one_reference_apply_once() {
    let bank = Bank::open(&[dec!(0)]).await;
    let a = bank.accounts[0];

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let engine = bank.engine.clone();
            tokio::spawn(async move {
                engine
                    .credit(
                        CreditRequest::new(a, dec!(5.00), "bonus", "promo")
                            .with_reference("bonus-2024"),
                    )
                    .await
            })
        })
        .collect();

    let ids: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap().id)
        .collect();

    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(bank.balance(a).await, dec!(5.00));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transfers_with_one_reference_apply_once() {
    let bank = Bank::open(&[dec!(100.00), dec!(0.00)]).await;
    let (a, b) = (bank.accounts[0], bank.accounts[1]);

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let engine = bank.engine.clone();
            tokio::spawn(async move {
                engine
                    .transfer(
                        TransferRequest::new(a, b, dec!(70.00), "deposit", "wallet")
                            .with_reference("lease-deposit"),
                    )
                    .await
            })
        })
        .collect();

    let records: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert!(records.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(bank.balance(a).await, dec!(30.00));
    assert_eq!(bank.balance(b).await, dec!(70.00));
    let snapshot = bank.engine.metrics().snapshot();
    assert_eq!(snapshot.transfers, 1);
    assert_eq!(snapshot.replays, 9);
    assert_eq!(snapshot.in_flight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lock_wait_timeouts_are_retried() {
    let store_config = MemoryStoreConfig {
        lock_timeout: Duration::from_millis(20),
        ..MemoryStoreConfig::default()
    };
    let engine_config = EngineConfig {
        retry: RetryConfig {
            max_attempts: 20,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        },
        ..EngineConfig::default()
    };
    let bank = Bank::open_with(&[dec!(100)], store_config, engine_config).await;
    let a = bank.accounts[0];

    bank.store
        .faults()
        .set_commit_delay(Some(Duration::from_millis(60)));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let engine = bank.engine.clone();
            tokio::spawn(async move {
                engine
                    .debit(DebitRequest::new(a, dec!(10), "slow", "card"))
                    .await
            })
        })
        .collect();

    for result in join_all(handles).await {
        result.unwrap().unwrap();
    }

    assert_eq!(bank.balance(a).await, dec!(80));
    assert!(bank.engine.metrics().snapshot().storage_retries >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn random_transfers_conserve_funds() {
    let bank = Bank::open(&[dec!(100); 8]).await;
    let total = bank.total();

    let handles: Vec<_> = (0..200)
        .map(|i| {
            let engine = bank.engine.clone();
            let from = bank.accounts[i % 8];
            let to = bank.accounts[(i * 3 + 1) % 8];
            let amount = Decimal::new(((i * 37) % 5000 + 1) as i64, 2);
            tokio::spawn(async move {
                engine
                    .transfer(TransferRequest::new(from, to, amount, "mix", "wallet"))
                    .await
            })
        })
        .collect();

    for result in join_all(handles).await {
        match result.unwrap() {
            Ok(_)
            | Err(WalletError::InsufficientFunds { .. })
            | Err(WalletError::SameAccountTransfer(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(bank.total(), total);
    for account in &bank.accounts {
        assert!(bank.balance(*account).await >= Decimal::ZERO);
    }
}
