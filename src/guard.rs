//! Per-wallet serialization of balance mutations.
//!
//! Two layers:
//! 1. An in-process async mutex per wallet id, so mutations on one wallet
//!    queue instead of spinning on conflicts inside this instance.
//! 2. Optimistic compare-and-swap on `version` in the store, retried with
//!    exponential backoff, so other instances writing the same wallet are
//!    still serialized.
//!
//! Wallets never contend with each other: both layers are keyed by wallet id.

use crate::errors::{LedgerError, LedgerResult};
use crate::models::Wallet;
use crate::store::LedgerStore;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1` (0-based), doubling each time
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * 2u32.saturating_pow(attempt)
    }
}

pub struct BalanceGuard {
    store: Arc<dyn LedgerStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    policy: RetryPolicy,
}

impl BalanceGuard {
    pub fn new(store: Arc<dyn LedgerStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            policy,
        }
    }

    /// Run `op` against a fresh snapshot of the wallet until it commits.
    ///
    /// `op` must pass `wallet.version` to the store as the expected version.
    /// Only `VersionConflict` is retried; every other error is returned as is.
    pub async fn mutate<'a, T, F>(&self, wallet_id: &str, op: F) -> LedgerResult<T>
    where
        F: Fn(Wallet) -> BoxFuture<'a, LedgerResult<T>>,
    {
        let lock = self
            .locks
            .entry(wallet_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _held = lock.lock().await;
            self.run_with_retry(wallet_id, &op).await
        };

        drop(lock);
        self.locks
            .remove_if(wallet_id, |_, l| Arc::strong_count(l) == 1);

        result
    }

    async fn run_with_retry<'a, T, F>(&self, wallet_id: &str, op: &F) -> LedgerResult<T>
    where
        F: Fn(Wallet) -> BoxFuture<'a, LedgerResult<T>>,
    {
        let mut attempt = 0;
        loop {
            let wallet = self.store.read_wallet(wallet_id).await?;
            match op(wallet).await {
                Err(LedgerError::VersionConflict) => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        tracing::warn!(
                            wallet_id = %wallet_id,
                            attempts = attempt,
                            "Giving up on wallet mutation after repeated version conflicts"
                        );
                        return Err(LedgerError::ConcurrencyConflict);
                    }
                    let delay = self.policy.backoff(attempt - 1);
                    tracing::debug!(
                        wallet_id = %wallet_id,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Version conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    #[cfg(test)]
    fn tracked_wallets(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewTransaction, TransactionKind};
    use crate::store::MemoryLedgerStore;
    use futures::FutureExt;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn credit(wallet: &Wallet, amount: rust_decimal::Decimal) -> NewTransaction {
        NewTransaction {
            wallet_id: wallet.id.clone(),
            kind: TransactionKind::TradeCredit,
            amount,
            external_ref: None,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn concurrent_mutations_on_one_wallet_all_commit() {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
        let guard = Arc::new(BalanceGuard::new(store.clone(), RetryPolicy::default()));
        let wallet = store.create_wallet("owner-1").await.unwrap();

        let mut handles = vec![];
        for _ in 0..20 {
            let guard = guard.clone();
            let store = store.clone();
            let wallet_id = wallet.id.clone();
            handles.push(tokio::spawn(async move {
                guard
                    .mutate(&wallet_id, |w| {
                        let store = store.clone();
                        async move {
                            let entry = credit(&w, dec!(5));
                            store.append_transaction(entry, w.version).await
                        }
                        .boxed()
                    })
                    .await
            }));
        }
        for result in futures::future::join_all(handles).await {
            assert!(result.unwrap().is_ok());
        }

        let wallet = store.read_wallet(&wallet.id).await.unwrap();
        assert_eq!(wallet.total_balance, dec!(100));
        assert_eq!(wallet.version, 20);
        assert_eq!(guard.tracked_wallets(), 0);
    }

    #[tokio::test]
    async fn persistent_conflicts_surface_as_concurrency_conflict() {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
        let guard = BalanceGuard::new(
            store.clone(),
            RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_millis(1),
            },
        );
        let wallet = store.create_wallet("owner-2").await.unwrap();
        let attempts = AtomicU32::new(0);

        let result: LedgerResult<()> = guard
            .mutate(&wallet.id, |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(LedgerError::VersionConflict) }.boxed()
            })
            .await;

        assert!(matches!(result, Err(LedgerError::ConcurrencyConflict)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stale_version_is_retried_against_a_fresh_read() {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
        let guard = BalanceGuard::new(store.clone(), RetryPolicy::default());
        let wallet = store.create_wallet("owner-3").await.unwrap();
        let first = AtomicU32::new(0);

        let (updated, _) = guard
            .mutate(&wallet.id, |w| {
                let store = store.clone();
                // First attempt commits behind our back, forcing a conflict
                let interfere = first.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if interfere {
                        store
                            .append_transaction(credit(&w, dec!(1)), w.version)
                            .await?;
                    }
                    store.append_transaction(credit(&w, dec!(10)), w.version).await
                }
                .boxed()
            })
            .await
            .unwrap();

        assert_eq!(updated.total_balance, dec!(11));
        assert_eq!(first.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_millis(10),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(10));
        assert_eq!(policy.backoff(3), Duration::from_millis(80));
    }
}
