//! Ledger API used by the dashboard handlers and the trading engine.
//!
//! Owns the balance guard and both controllers; everything that mutates a
//! wallet goes through the guard, reads go straight to the store.

use crate::deposit::{DepositController, DepositSettings};
use crate::errors::{LedgerError, LedgerResult};
use crate::gateway::PaymentGateway;
use crate::guard::{BalanceGuard, RetryPolicy};
use crate::kafka::{publish_committed, EventPublisher, LedgerEvent};
use crate::ledger::{self, LedgerAudit};
use crate::models::{
    NewTransaction, Transaction, TransactionKind, TransactionPage, Wallet, WalletStats,
};
use crate::payout::PayoutRail;
use crate::store::LedgerStore;
use crate::withdrawal::{WithdrawalController, WithdrawalSettings};
use futures::FutureExt;
use rust_decimal::Decimal;
use std::sync::Arc;

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 200;

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub retry: RetryPolicy,
    pub deposit: DepositSettings,
    pub withdrawal: WithdrawalSettings,
}

pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    guard: Arc<BalanceGuard>,
    publisher: Arc<dyn EventPublisher>,
    deposits: DepositController,
    withdrawals: WithdrawalController,
}

impl Ledger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        rail: Arc<dyn PayoutRail>,
        publisher: Arc<dyn EventPublisher>,
        settings: LedgerSettings,
    ) -> Self {
        let guard = Arc::new(BalanceGuard::new(store.clone(), settings.retry));
        let deposits = DepositController::new(
            store.clone(),
            guard.clone(),
            gateway,
            publisher.clone(),
            settings.deposit,
        );
        let withdrawals = WithdrawalController::new(
            store.clone(),
            guard.clone(),
            rail,
            publisher.clone(),
            settings.withdrawal,
        );
        Self {
            store,
            guard,
            publisher,
            deposits,
            withdrawals,
        }
    }

    pub fn deposits(&self) -> &DepositController {
        &self.deposits
    }

    pub fn withdrawals(&self) -> &WithdrawalController {
        &self.withdrawals
    }

    /// Get-or-create the owner's wallet
    pub async fn open_wallet(&self, owner_id: &str) -> LedgerResult<Wallet> {
        let owner_id = owner_id.trim();
        if owner_id.is_empty() {
            return Err(LedgerError::InvalidRequest("owner_id is required".to_string()));
        }
        let wallet = self.store.create_wallet(owner_id).await?;
        tracing::debug!(wallet_id = %wallet.id, owner_id = %owner_id, "Wallet opened");
        Ok(wallet)
    }

    pub async fn wallet(&self, wallet_id: &str) -> LedgerResult<Wallet> {
        self.store.read_wallet(wallet_id).await
    }

    pub async fn wallet_for_owner(&self, owner_id: &str) -> LedgerResult<Wallet> {
        self.store
            .find_wallet_by_owner(owner_id)
            .await?
            .ok_or_else(|| LedgerError::WalletNotFound(owner_id.to_string()))
    }

    /// One page of history, newest first. Pass the returned `next_cursor` to
    /// get the following page.
    pub async fn history(
        &self,
        wallet_id: &str,
        cursor: Option<i64>,
        limit: Option<i64>,
    ) -> LedgerResult<TransactionPage> {
        self.store.read_wallet(wallet_id).await?;
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let transactions = self
            .store
            .list_transactions(wallet_id, cursor, limit)
            .await?;
        let next_cursor = if transactions.len() as i64 == limit {
            transactions.last().map(|t| t.seq)
        } else {
            None
        };
        Ok(TransactionPage {
            transactions,
            next_cursor,
        })
    }

    /// Record a trade settlement from the matching engine.
    ///
    /// `amount` is a positive magnitude; debits and fees are stored negative.
    /// Replaying the same `external_ref` returns the original transaction.
    pub async fn settle_trade(
        &self,
        wallet_id: &str,
        kind: TransactionKind,
        amount: Decimal,
        external_ref: &str,
    ) -> LedgerResult<Transaction> {
        if !kind.is_trade_settlement() {
            return Err(LedgerError::InvalidAmount(format!(
                "{} is not a trade settlement",
                kind
            )));
        }
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(
                "Amount must be positive".to_string(),
            ));
        }
        let external_ref = external_ref.trim();
        if external_ref.is_empty() {
            return Err(LedgerError::InvalidRequest(
                "external_ref is required".to_string(),
            ));
        }
        let signed = if kind.is_credit() { amount } else { -amount };

        let store = &self.store;
        let result = self
            .guard
            .mutate(wallet_id, |w| {
                let entry = NewTransaction {
                    wallet_id: w.id.clone(),
                    kind,
                    amount: signed,
                    external_ref: Some(external_ref.to_string()),
                    metadata: serde_json::json!({}),
                };
                async move { store.append_transaction(entry, w.version).await }.boxed()
            })
            .await;

        match result {
            Ok((_, txn)) => {
                tracing::info!(
                    wallet_id = %wallet_id,
                    kind = %kind,
                    amount = %signed,
                    external_ref = %external_ref,
                    balance_after = %txn.balance_after,
                    "Trade settled"
                );
                publish_committed(self.publisher.as_ref(), LedgerEvent::trade_settled(&txn))
                    .await;
                Ok(txn)
            }
            Err(LedgerError::DuplicateExternalRef(r)) => {
                let existing = self
                    .store
                    .find_transaction_by_ref(kind, external_ref)
                    .await?
                    .ok_or_else(|| LedgerError::DuplicateExternalRef(r.clone()))?;
                if existing.wallet_id != wallet_id {
                    return Err(LedgerError::DuplicateExternalRef(r));
                }
                tracing::debug!(external_ref = %external_ref, "Trade already settled");
                Ok(existing)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn wallet_stats(&self, wallet_id: &str) -> LedgerResult<WalletStats> {
        let wallet = self.store.read_wallet(wallet_id).await?;
        let transactions = self.store.replay_transactions(wallet_id).await?;

        let mut stats = WalletStats {
            total_deposits: Decimal::ZERO,
            total_withdrawals: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            trade_count: 0,
            total_balance: wallet.total_balance,
            reserved_balance: wallet.reserved_balance,
            available_balance: wallet.available_balance(),
        };
        for txn in &transactions {
            match txn.kind {
                TransactionKind::Deposit => stats.total_deposits += txn.amount,
                TransactionKind::Withdrawal => stats.total_withdrawals -= txn.amount,
                TransactionKind::WithdrawalReversal => stats.total_withdrawals -= txn.amount,
                TransactionKind::Fee => stats.total_fees -= txn.amount,
                TransactionKind::TradeDebit | TransactionKind::TradeCredit => {
                    stats.trade_count += 1
                }
            }
        }
        Ok(stats)
    }

    /// Replay the log and compare it with the cached balances
    pub async fn audit_wallet(&self, wallet_id: &str) -> LedgerResult<LedgerAudit> {
        let wallet = self.store.read_wallet(wallet_id).await?;
        let transactions = self.store.replay_transactions(wallet_id).await?;
        let audit = ledger::replay(&wallet, &transactions);
        if !audit.consistent {
            tracing::error!(
                wallet_id = %wallet_id,
                first_mismatch = ?audit.first_mismatch,
                replayed_total = %audit.replayed_total,
                recorded_total = %audit.recorded_total,
                "Ledger audit found an inconsistency"
            );
        }
        Ok(audit)
    }
}
