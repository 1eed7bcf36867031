#![allow(dead_code)]

use std::sync::Arc;

use paywallet_common::AccountNumber;
use paywallet_engine::{CreditRequest, EngineConfig, TransactionEngine};
use paywallet_ledger::{AccountType, InMemoryLedgerStore, LedgerStore, MemoryStoreConfig};
use rust_decimal::Decimal;

pub struct Bank {
    pub store: Arc<InMemoryLedgerStore>,
    pub engine: Arc<TransactionEngine<InMemoryLedgerStore>>,
    pub accounts: Vec<i64>,
}

impl Bank {
    /// One user with `balances.len()` active accounts, funded by credits.
    pub async fn open(balances: &[Decimal]) -> Self {
        Self::open_with(balances, MemoryStoreConfig::default(), EngineConfig::default()).await
    }

    pub async fn open_with(
        balances: &[Decimal],
        store_config: MemoryStoreConfig,
        engine_config: EngineConfig,
    ) -> Self {
        let store = Arc::new(InMemoryLedgerStore::with_config(store_config));
        let user = store.create_user("carol", "carol@example.com");
        let engine = Arc::new(TransactionEngine::new(store.clone(), engine_config).unwrap());

        let mut accounts = Vec::new();
        for balance in balances {
            let account = store.open_account(user.id, AccountType::Wallet).unwrap();
            store.activate_account(account.account_number).await.unwrap();
            if *balance > Decimal::ZERO {
                engine
                    .credit(CreditRequest::new(
                        account.account_number.value(),
                        *balance,
                        "opening balance",
                        "cash",
                    ))
                    .await
                    .unwrap();
            }
            accounts.push(account.account_number.value());
        }

        Self {
            store,
            engine,
            accounts,
        }
    }

    pub async fn balance(&self, account: i64) -> Decimal {
        self.store
            .account(AccountNumber::new(account))
            .await
            .unwrap()
            .unwrap()
            .balance
    }

    pub fn total(&self) -> Decimal {
        self.store.total_balance()
    }
}
