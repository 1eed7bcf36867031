//! Simulation controller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use paywallet_common::{TransactionId, WalletError};
use paywallet_engine::{
    CreditRequest, DebitRequest, EngineConfig, MetricsSnapshot, QueryService, ReversalRequest,
    TransactionEngine, TransferRequest,
};
use paywallet_ledger::{AccountType, InMemoryLedgerStore, MemoryStoreConfig};

use crate::metrics::{MetricsSummary, SimulationMetrics};
use crate::scenario::{Operation, Scenario, Workload};

const PAYMENT_METHOD: &str = "simulator";

/// Run parameters.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Wallets to provision.
    pub wallets: usize,
    /// Concurrent client tasks.
    pub concurrency: usize,
    /// Operations across all tasks.
    pub operations: usize,
    /// Opening balance of every wallet.
    pub initial_balance: Decimal,
    /// Seed for every task's generator.
    pub seed: u64,
}

/// Outcome of a verified run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub scenario: String,
    pub seed: u64,
    pub wallets: usize,
    pub elapsed_ms: u128,
    pub expected_total: Decimal,
    pub actual_total: Decimal,
    pub client: MetricsSummary,
    pub engine: MetricsSnapshot,
}

/// Controls the simulation.
pub struct SimulationController {
    config: SimulationConfig,
    store: Arc<InMemoryLedgerStore>,
    engine: Arc<TransactionEngine<InMemoryLedgerStore>>,
    /// Provisioned account numbers.
    wallets: Vec<i64>,
    /// Net funds credited into or debited out of the ledger.
    external: Arc<RwLock<Decimal>>,
    metrics: Arc<RwLock<SimulationMetrics>>,
    running: Arc<RwLock<bool>>,
}

impl SimulationController {
    /// Create a controller over a fresh in-memory ledger.
    pub fn new(
        config: SimulationConfig,
        store_config: MemoryStoreConfig,
        engine_config: EngineConfig,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(config.concurrency > 0, "concurrency must be at least 1");
        store_config.validate()?;

        let store = Arc::new(InMemoryLedgerStore::with_config(store_config));
        let engine = Arc::new(TransactionEngine::new(store.clone(), engine_config)?);

        Ok(Self {
            config,
            store,
            engine,
            wallets: Vec::new(),
            external: Arc::new(RwLock::new(Decimal::ZERO)),
            metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
            running: Arc::new(RwLock::new(false)),
        })
    }

    /// Provision one user with active, funded wallets.
    pub async fn initialize(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.config.wallets >= Scenario::MIN_WALLETS,
            "at least {} wallets are required, got {}",
            Scenario::MIN_WALLETS,
            self.config.wallets
        );
        info!("Initializing simulation with {} wallets", self.config.wallets);

        let user = self.store.create_user("simulator", "simulator@paywallet.local");
        let opening = self.config.initial_balance;

        for _ in 0..self.config.wallets {
            let account = self.store.open_account(user.id, AccountType::Wallet)?;
            self.store.activate_account(account.account_number).await?;

            if opening > Decimal::ZERO {
                self.engine
                    .credit(CreditRequest::new(
                        account.account_number.value(),
                        opening,
                        "opening balance",
                        PAYMENT_METHOD,
                    ))
                    .await?;
                *self.external.write().await += opening;
            }

            debug!(account = %account.account_number, balance = %opening, "Wallet provisioned");
            self.wallets.push(account.account_number.value());
        }

        Ok(())
    }

    pub fn wallets(&self) -> &[i64] {
        &self.wallets
    }

    pub fn engine(&self) -> &Arc<TransactionEngine<InMemoryLedgerStore>> {
        &self.engine
    }

    /// Run a scenario to completion and verify the ledger afterwards.
    pub async fn run_scenario(&self, scenario: &Scenario) -> anyhow::Result<SimulationReport> {
        anyhow::ensure!(!self.wallets.is_empty(), "simulation not initialized");
        info!("Running scenario: {} - {}", scenario.name, scenario.description);

        *self.running.write().await = true;
        let fault_driver = (scenario.workload == Workload::Faults).then(|| self.spawn_fault_driver());

        let start = Instant::now();
        let concurrency = self.config.concurrency;
        let per_task = self.config.operations / concurrency;
        let remainder = self.config.operations % concurrency;

        let handles: Vec<_> = (0..concurrency)
            .map(|task| {
                let client = Client {
                    task,
                    engine: self.engine.clone(),
                    wallets: self.wallets.clone(),
                    scenario: scenario.clone(),
                    rng: StdRng::seed_from_u64(self.config.seed.wrapping_add(task as u64)),
                    external: self.external.clone(),
                    metrics: self.metrics.clone(),
                };
                tokio::spawn(client.run(per_task + usize::from(task < remainder)))
            })
            .collect();

        for handle in join_all(handles).await {
            handle?;
        }
        let elapsed = start.elapsed();

        *self.running.write().await = false;
        if let Some(handle) = fault_driver {
            handle.await?;
        }

        let (expected_total, actual_total) = self.verify().await?;
        let client = self.metrics.read().await.summary(elapsed);
        let unexpected = client
            .failures_by_code
            .iter()
            .filter(|(code, _)| !is_expected_failure(code))
            .map(|(_, count)| count)
            .sum::<u64>();
        anyhow::ensure!(unexpected == 0, "{unexpected} operations failed unexpectedly");

        Ok(SimulationReport {
            scenario: scenario.name.clone(),
            seed: self.config.seed,
            wallets: self.wallets.len(),
            elapsed_ms: elapsed.as_millis(),
            expected_total,
            actual_total,
            client,
            engine: self.engine.metrics().snapshot(),
        })
    }

    /// Check conservation of funds, non-negative balances, and that every
    /// wallet's balance equals the sum of its recorded history.
    pub async fn verify(&self) -> anyhow::Result<(Decimal, Decimal)> {
        let expected = *self.external.read().await;
        let actual = self.store.total_balance();
        anyhow::ensure!(
            actual == expected,
            "funds not conserved: expected {expected}, ledger holds {actual}"
        );

        let query = QueryService::new(self.store.clone());
        for &wallet in &self.wallets {
            let account = query.account(wallet).await?;
            anyhow::ensure!(
                account.balance >= Decimal::ZERO,
                "wallet {wallet} is overdrawn: {}",
                account.balance
            );

            let history: Decimal = query
                .transactions_for_account(wallet)
                .await?
                .iter()
                .flat_map(|t| t.entries())
                .filter(|e| e.account_number == account.account_number)
                .map(|e| e.delta())
                .sum();
            anyhow::ensure!(
                history == account.balance,
                "wallet {wallet} holds {} but its history sums to {history}",
                account.balance
            );
        }

        info!(total = %actual, wallets = self.wallets.len(), "Ledger verified");
        Ok((expected, actual))
    }

    /// Keep transient commit failures queued and commits stalling until the
    /// run stops.
    fn spawn_fault_driver(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let running = self.running.clone();
        let mut rng = StdRng::seed_from_u64(self.config.seed ^ 0xFA17);

        tokio::spawn(async move {
            let mut injected = 0u64;
            while *running.read().await {
                let faults = store.faults();
                if faults.pending_failures() < 2 {
                    let error = if rng.gen_bool(0.5) {
                        WalletError::StorageConflict("injected conflict".into())
                    } else {
                        WalletError::StorageUnavailable("injected outage".into())
                    };
                    faults.fail_next_commit(error);
                    injected += 1;
                }

                let stall = rng.gen_bool(0.2);
                let delay = stall.then(|| Duration::from_millis(rng.gen_range(1..5)));
                faults.set_commit_delay(delay);

                tokio::time::sleep(Duration::from_millis(2)).await;
            }

            store.faults().clear();
            info!(injected, "Fault driver stopped");
        })
    }
}

/// Failures the engine reports by design under load.
fn is_expected_failure(code: &str) -> bool {
    matches!(
        code,
        "INSUFFICIENT_FUNDS" | "STORAGE_UNAVAILABLE" | "STORAGE_CONFLICT" | "CANCELED"
    )
}

/// One concurrent client issuing a scenario's operations.
struct Client {
    task: usize,
    engine: Arc<TransactionEngine<InMemoryLedgerStore>>,
    wallets: Vec<i64>,
    scenario: Scenario,
    rng: StdRng,
    external: Arc<RwLock<Decimal>>,
    metrics: Arc<RwLock<SimulationMetrics>>,
}

impl Client {
    async fn run(mut self, operations: usize) {
        let mut metrics = SimulationMetrics::new();
        let mut external = Decimal::ZERO;
        let mut last_transfer = None;

        for _ in 0..operations {
            let operation = self
                .scenario
                .next_operation(&mut self.rng, self.wallets.len(), self.task);
            // Nothing to reverse yet.
            if operation == Operation::ReverseLast && last_transfer.is_none() {
                continue;
            }

            let started = Instant::now();
            match self.execute(&operation, &mut last_transfer).await {
                Ok(delta) => {
                    external += delta;
                    metrics.record_success(started.elapsed());
                }
                Err(err) => {
                    if is_expected_failure(err.error_code()) {
                        debug!(task = self.task, error = %err, "Operation rejected");
                    } else {
                        warn!(task = self.task, ?operation, error = %err, "Unexpected failure");
                    }
                    metrics.record_failure(err.error_code(), started.elapsed());
                }
            }
        }

        *self.external.write().await += external;
        self.metrics.write().await.merge(metrics);
    }

    /// Execute one operation, returning the funds it moved into (positive)
    /// or out of (negative) the ledger.
    async fn execute(
        &self,
        operation: &Operation,
        last_transfer: &mut Option<TransactionId>,
    ) -> Result<Decimal, WalletError> {
        match *operation {
            Operation::Credit { wallet, amount } => {
                self.engine
                    .credit(CreditRequest::new(
                        self.wallets[wallet],
                        amount,
                        "simulated top-up",
                        PAYMENT_METHOD,
                    ))
                    .await?;
                Ok(amount)
            }
            Operation::Debit { wallet, amount } => {
                self.engine
                    .debit(DebitRequest::new(
                        self.wallets[wallet],
                        amount,
                        "simulated purchase",
                        PAYMENT_METHOD,
                    ))
                    .await?;
                Ok(-amount)
            }
            Operation::Transfer { from, to, amount } => {
                let transfer = self
                    .engine
                    .transfer(TransferRequest::new(
                        self.wallets[from],
                        self.wallets[to],
                        amount,
                        "simulated payment",
                        PAYMENT_METHOD,
                    ))
                    .await?;
                *last_transfer = Some(transfer.id);
                Ok(Decimal::ZERO)
            }
            Operation::ReverseLast => {
                if let Some(original) = last_transfer.take() {
                    self.engine
                        .reverse(ReversalRequest::new(original, "simulated refund"))
                        .await?;
                }
                Ok(Decimal::ZERO)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paywallet_engine::RetryConfig;
    use rust_decimal_macros::dec;

    fn config(operations: usize) -> SimulationConfig {
        SimulationConfig {
            wallets: 4,
            concurrency: 4,
            operations,
            initial_balance: dec!(100.00),
            seed: 42,
        }
    }

    async fn controller(operations: usize, engine_config: EngineConfig) -> SimulationController {
        let mut controller =
            SimulationController::new(config(operations), MemoryStoreConfig::default(), engine_config)
                .unwrap();
        controller.initialize().await.unwrap();
        controller
    }

    #[tokio::test]
    async fn test_initialize_funds_wallets() {
        let controller = controller(0, EngineConfig::default()).await;
        assert_eq!(controller.wallets().len(), 4);

        let (expected, actual) = controller.verify().await.unwrap();
        assert_eq!(expected, dec!(400.00));
        assert_eq!(actual, dec!(400.00));
        assert_eq!(controller.engine().metrics().snapshot().credits, 4);
    }

    #[tokio::test]
    async fn test_too_few_wallets() {
        let mut controller = SimulationController::new(
            SimulationConfig {
                wallets: 1,
                ..config(10)
            },
            MemoryStoreConfig::default(),
            EngineConfig::default(),
        )
        .unwrap();
        assert!(controller.initialize().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_scenarios_conserve_funds() {
        for name in ["random", "contention", "ping-pong"] {
            let controller = controller(200, EngineConfig::default()).await;
            let scenario = Scenario::load(name).unwrap();

            let report = controller.run_scenario(&scenario).await.unwrap();

            assert_eq!(report.scenario, name);
            assert_eq!(report.expected_total, report.actual_total);
            assert!(report.client.total_operations <= 200);
            assert_eq!(
                report.client.failed_operations,
                report.client.failures_by_code.values().sum::<u64>()
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_faults_scenario_recovers() {
        let engine_config = EngineConfig {
            retry: RetryConfig {
                max_attempts: 8,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
            },
            ..EngineConfig::default()
        };
        let controller = controller(120, engine_config).await;
        let scenario = Scenario::load("faults").unwrap();

        let report = controller.run_scenario(&scenario).await.unwrap();

        assert_eq!(report.expected_total, report.actual_total);
        assert!(report.engine.storage_retries > 0);
        assert!(report.client.successful_operations > 0);
    }
}
