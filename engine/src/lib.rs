//! PayWallet Transaction Engine
//!
//! Credits, debits, transfers and reversals over a [`paywallet_ledger::LedgerStore`],
//! with balance invariants, idempotency by reference, bounded retries of
//! transient storage failures and per-operation deadlines. The
//! [`QueryService`] provides the read side.

pub mod config;
pub mod engine;
pub mod metrics;
pub mod query;
pub mod request;
pub mod retry;

pub use config::{EngineConfig, RetryConfig};
pub use engine::TransactionEngine;
pub use metrics::{EngineMetrics, MetricsSnapshot, SharedMetrics};
pub use query::{AccountTransaction, QueryService, TransactionDetails};
pub use request::{CreditRequest, DebitRequest, ReversalRequest, TransferRequest};
pub use retry::RetryPolicy;
