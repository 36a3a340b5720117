//! Ledger store - the single source of truth for wallets and their logs.
//!
//! Every mutating call is one atomic unit and takes the wallet `version` the
//! caller read. A stale version fails with `LedgerError::VersionConflict` and
//! writes nothing; the balance guard owns the retry.

mod memory;
mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

use crate::errors::LedgerResult;
use crate::models::{
    DepositIntent, IntentStatus, NewTransaction, Transaction, TransactionKind, Wallet,
    WithdrawalRequest,
};
use async_trait::async_trait;

/// Outcome of failing a withdrawal
#[derive(Debug, Clone)]
pub struct WithdrawalFailure {
    pub wallet: Wallet,
    pub request: WithdrawalRequest,
    /// Set when a debit had already been applied and was credited back
    pub reversal: Option<Transaction>,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Get-or-create the wallet for `owner_id`
    async fn create_wallet(&self, owner_id: &str) -> LedgerResult<Wallet>;

    async fn read_wallet(&self, wallet_id: &str) -> LedgerResult<Wallet>;

    async fn find_wallet_by_owner(&self, owner_id: &str) -> LedgerResult<Option<Wallet>>;

    /// Apply one entry and record it with its `balance_after`.
    ///
    /// Fails with `DuplicateExternalRef` when `(kind, external_ref)` exists.
    async fn append_transaction(
        &self,
        entry: NewTransaction,
        expected_version: i64,
    ) -> LedgerResult<(Wallet, Transaction)>;

    async fn find_transaction_by_ref(
        &self,
        kind: TransactionKind,
        external_ref: &str,
    ) -> LedgerResult<Option<Transaction>>;

    /// Newest first, strictly below `before_seq` when given
    async fn list_transactions(
        &self,
        wallet_id: &str,
        before_seq: Option<i64>,
        limit: i64,
    ) -> LedgerResult<Vec<Transaction>>;

    /// Full log, oldest first
    async fn replay_transactions(&self, wallet_id: &str) -> LedgerResult<Vec<Transaction>>;

    async fn create_deposit_intent(&self, intent: &DepositIntent) -> LedgerResult<()>;

    async fn find_deposit_intent(&self, order_id: &str) -> LedgerResult<Option<DepositIntent>>;

    /// Re-key a pending intent from our receipt id to the order id the
    /// gateway assigned; confirmations arrive under the latter.
    async fn assign_gateway_order(&self, receipt: &str, gateway_order_id: &str)
        -> LedgerResult<()>;

    /// Move a pending intent to `failed` or `expired`. Returns false if it was
    /// no longer pending.
    async fn close_deposit_intent(&self, order_id: &str, status: IntentStatus)
        -> LedgerResult<bool>;

    /// Mark the intent verified and credit its amount with
    /// `external_ref = order_id`, in one unit.
    async fn complete_deposit(
        &self,
        order_id: &str,
        payment_id: &str,
        expected_version: i64,
    ) -> LedgerResult<(Wallet, Transaction)>;

    /// Reserve `request.amount` and insert the request as pending
    async fn reserve_withdrawal(
        &self,
        request: &WithdrawalRequest,
        expected_version: i64,
    ) -> LedgerResult<Wallet>;

    async fn find_withdrawal(&self, request_id: &str) -> LedgerResult<Option<WithdrawalRequest>>;

    /// Every request for the wallet, newest first
    async fn list_withdrawals(&self, wallet_id: &str) -> LedgerResult<Vec<WithdrawalRequest>>;

    /// pending -> processing
    async fn mark_withdrawal_processing(&self, request_id: &str)
        -> LedgerResult<WithdrawalRequest>;

    async fn set_payout_ref(&self, request_id: &str, payout_ref: &str) -> LedgerResult<()>;

    /// Debit the reserved amount and complete the request
    async fn settle_withdrawal(
        &self,
        request_id: &str,
        expected_version: i64,
    ) -> LedgerResult<(Wallet, Transaction)>;

    /// Release the reservation (failed), or credit back an applied debit
    /// (reversed)
    async fn fail_withdrawal(
        &self,
        request_id: &str,
        expected_version: i64,
    ) -> LedgerResult<WithdrawalFailure>;
}
