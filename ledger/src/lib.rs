//! PayWallet Ledger
//!
//! Account and transaction records, the storage contract the transaction
//! engine runs against, and two stores implementing it: an in-memory store
//! for tests and simulation and a PostgreSQL store.

pub mod account;
pub mod journal;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod transaction;

pub use account::{Account, AccountStatus, AccountType, User};
pub use journal::{EntryBatch, EntryType, LedgerEntry};
pub use memory::{FaultInjector, InMemoryLedgerStore, MemoryStoreConfig, MemoryUnit};
pub use postgres::{PgLedgerStore, PgStoreConfig, PgUnitOfWork};
pub use store::{Directory, LedgerStore, UnitOfWork};
pub use transaction::{NewTransaction, Transaction, TransactionKind, TransactionStatus};
