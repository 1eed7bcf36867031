//! Per-account row locks.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use paywallet_common::{AccountNumber, Result, WalletError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Exclusive hold on one account row. Released on drop.
#[derive(Debug)]
pub struct RowGuard {
    account_number: AccountNumber,
    _guard: OwnedMutexGuard<()>,
}

impl RowGuard {
    pub fn account_number(&self) -> AccountNumber {
        self.account_number
    }
}

/// Manager for account row locks.
///
/// Waiting for a row is fair (tokio mutexes queue waiters FIFO) and bounded
/// by the configured timeout; an expired wait is reported as a storage
/// conflict so the engine can back off and retry.
pub struct RowLocks {
    /// One mutex per account row.
    rows: DashMap<AccountNumber, Arc<Mutex<()>>>,
    /// Maximum time to wait for a row.
    timeout: Duration,
}

impl RowLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            rows: DashMap::new(),
            timeout,
        }
    }

    /// Register a row so it can be locked.
    pub fn register(&self, account_number: AccountNumber) {
        self.rows
            .entry(account_number)
            .or_insert_with(|| Arc::new(Mutex::new(())));
    }

    /// Check if a row exists.
    pub fn contains(&self, account_number: AccountNumber) -> bool {
        self.rows.contains_key(&account_number)
    }

    /// Acquire a row. Returns `None` for unknown rows.
    pub async fn acquire(&self, account_number: AccountNumber) -> Result<Option<RowGuard>> {
        // Clone the Arc out so the map shard is not held while waiting.
        let row = match self.rows.get(&account_number) {
            Some(row) => row.clone(),
            None => return Ok(None),
        };

        match tokio::time::timeout(self.timeout, row.lock_owned()).await {
            Ok(guard) => {
                debug!(account = %account_number, "Row lock acquired");
                Ok(Some(RowGuard {
                    account_number,
                    _guard: guard,
                }))
            }
            Err(_) => {
                warn!(
                    account = %account_number,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Row lock wait timed out"
                );
                Err(WalletError::StorageConflict(format!(
                    "timed out waiting for lock on account {account_number}"
                )))
            }
        }
    }

    /// Check if a row is currently held by some unit of work.
    pub fn is_locked(&self, account_number: AccountNumber) -> bool {
        self.rows
            .get(&account_number)
            .map(|row| row.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Get count of rows currently held.
    pub fn held_count(&self) -> usize {
        self.rows.iter().filter(|row| row.try_lock().is_err()).count()
    }
}
