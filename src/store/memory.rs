use super::{LedgerStore, WithdrawalFailure};
use crate::errors::{LedgerError, LedgerResult};
use crate::ledger::{self, BalanceChange};
use crate::models::{
    DepositIntent, IntentStatus, NewTransaction, Transaction, TransactionKind, Wallet,
    WithdrawalRequest, WithdrawalStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// In-process store used by tests and `LEDGER_STORE=memory`.
///
/// One mutex covers all state, so each call is trivially atomic. Version
/// checks still apply so the guard behaves the same as against Postgres.
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    wallets: HashMap<String, Wallet>,
    wallet_by_owner: HashMap<String, String>,
    transactions: Vec<Transaction>,
    refs: HashMap<(TransactionKind, String), usize>,
    intents: HashMap<String, DepositIntent>,
    withdrawals: HashMap<String, WithdrawalRequest>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> LedgerResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| LedgerError::InternalError("ledger state poisoned".to_string()))
    }
}

impl MemoryState {
    fn wallet(&self, wallet_id: &str) -> LedgerResult<&Wallet> {
        self.wallets
            .get(wallet_id)
            .ok_or_else(|| LedgerError::WalletNotFound(wallet_id.to_string()))
    }

    fn checked_wallet(&self, wallet_id: &str, expected_version: i64) -> LedgerResult<Wallet> {
        let wallet = self.wallet(wallet_id)?;
        if wallet.version != expected_version {
            return Err(LedgerError::VersionConflict);
        }
        Ok(wallet.clone())
    }

    fn withdrawal(&self, request_id: &str) -> LedgerResult<WithdrawalRequest> {
        self.withdrawals
            .get(request_id)
            .cloned()
            .ok_or_else(|| LedgerError::WithdrawalNotFound(request_id.to_string()))
    }

    fn ensure_ref_free(&self, kind: TransactionKind, external_ref: Option<&str>) -> LedgerResult<()> {
        if let Some(r) = external_ref {
            if self.refs.contains_key(&(kind, r.to_string())) {
                return Err(LedgerError::DuplicateExternalRef(r.to_string()));
            }
        }
        Ok(())
    }

    /// Write the new balances and bump the version. Callers have already
    /// validated `expected_version` within the same lock.
    fn commit_balances(&mut self, mut wallet: Wallet, change: BalanceChange) -> Wallet {
        wallet.total_balance = change.total_balance;
        wallet.reserved_balance = change.reserved_balance;
        wallet.version += 1;
        wallet.updated_at = Utc::now();
        self.wallets.insert(wallet.id.clone(), wallet.clone());
        wallet
    }

    fn append(&mut self, wallet: Wallet, entry: NewTransaction) -> LedgerResult<(Wallet, Transaction)> {
        self.ensure_ref_free(entry.kind, entry.external_ref.as_deref())?;
        let change = ledger::apply_entry(&wallet, entry.kind, entry.amount)?;
        let wallet = self.commit_balances(wallet, change);

        let txn = Transaction {
            id: Uuid::new_v4().to_string(),
            wallet_id: wallet.id.clone(),
            seq: wallet.version,
            kind: entry.kind,
            amount: entry.amount,
            balance_after: wallet.total_balance,
            external_ref: entry.external_ref,
            metadata: entry.metadata,
            created_at: Utc::now(),
        };
        if let Some(r) = &txn.external_ref {
            self.refs.insert((txn.kind, r.clone()), self.transactions.len());
        }
        self.transactions.push(txn.clone());
        Ok((wallet, txn))
    }

    fn set_withdrawal_status(
        &mut self,
        request_id: &str,
        status: WithdrawalStatus,
    ) -> LedgerResult<WithdrawalRequest> {
        let request = self
            .withdrawals
            .get_mut(request_id)
            .ok_or_else(|| LedgerError::WithdrawalNotFound(request_id.to_string()))?;
        request.status = status;
        request.updated_at = Utc::now();
        Ok(request.clone())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn create_wallet(&self, owner_id: &str) -> LedgerResult<Wallet> {
        let mut state = self.lock()?;
        if let Some(wallet_id) = state.wallet_by_owner.get(owner_id) {
            return state.wallet(wallet_id).cloned();
        }

        let now = Utc::now();
        let wallet = Wallet {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            total_balance: Decimal::ZERO,
            reserved_balance: Decimal::ZERO,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        state
            .wallet_by_owner
            .insert(owner_id.to_string(), wallet.id.clone());
        state.wallets.insert(wallet.id.clone(), wallet.clone());
        Ok(wallet)
    }

    async fn read_wallet(&self, wallet_id: &str) -> LedgerResult<Wallet> {
        self.lock()?.wallet(wallet_id).cloned()
    }

    async fn find_wallet_by_owner(&self, owner_id: &str) -> LedgerResult<Option<Wallet>> {
        let state = self.lock()?;
        Ok(state
            .wallet_by_owner
            .get(owner_id)
            .and_then(|id| state.wallets.get(id))
            .cloned())
    }

    async fn append_transaction(
        &self,
        entry: NewTransaction,
        expected_version: i64,
    ) -> LedgerResult<(Wallet, Transaction)> {
        let mut state = self.lock()?;
        let wallet = state.checked_wallet(&entry.wallet_id, expected_version)?;
        state.append(wallet, entry)
    }

    async fn find_transaction_by_ref(
        &self,
        kind: TransactionKind,
        external_ref: &str,
    ) -> LedgerResult<Option<Transaction>> {
        let state = self.lock()?;
        Ok(state
            .refs
            .get(&(kind, external_ref.to_string()))
            .map(|idx| state.transactions[*idx].clone()))
    }

    async fn list_transactions(
        &self,
        wallet_id: &str,
        before_seq: Option<i64>,
        limit: i64,
    ) -> LedgerResult<Vec<Transaction>> {
        let state = self.lock()?;
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|t| t.wallet_id == wallet_id)
            .filter(|t| before_seq.map_or(true, |cursor| t.seq < cursor))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn replay_transactions(&self, wallet_id: &str) -> LedgerResult<Vec<Transaction>> {
        let state = self.lock()?;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.wallet_id == wallet_id)
            .cloned()
            .collect())
    }

    async fn create_deposit_intent(&self, intent: &DepositIntent) -> LedgerResult<()> {
        let mut state = self.lock()?;
        state.wallet(&intent.wallet_id)?;
        if state.intents.contains_key(&intent.gateway_order_id) {
            return Err(LedgerError::DuplicateExternalRef(
                intent.gateway_order_id.clone(),
            ));
        }
        state
            .intents
            .insert(intent.gateway_order_id.clone(), intent.clone());
        Ok(())
    }

    async fn find_deposit_intent(&self, order_id: &str) -> LedgerResult<Option<DepositIntent>> {
        Ok(self.lock()?.intents.get(order_id).cloned())
    }

    async fn assign_gateway_order(
        &self,
        receipt: &str,
        gateway_order_id: &str,
    ) -> LedgerResult<()> {
        if receipt == gateway_order_id {
            return Ok(());
        }
        let mut state = self.lock()?;
        if state.intents.contains_key(gateway_order_id) {
            return Err(LedgerError::DuplicateExternalRef(gateway_order_id.to_string()));
        }
        match state.intents.get(receipt) {
            Some(intent) if intent.status == IntentStatus::Pending => {}
            Some(intent) => {
                return Err(LedgerError::InvalidState(format!(
                    "deposit intent {} is {}",
                    receipt,
                    intent.status.as_str()
                )))
            }
            None => return Err(LedgerError::UnknownIntent),
        }
        if let Some(mut intent) = state.intents.remove(receipt) {
            intent.gateway_order_id = gateway_order_id.to_string();
            state.intents.insert(gateway_order_id.to_string(), intent);
        }
        Ok(())
    }

    async fn close_deposit_intent(
        &self,
        order_id: &str,
        status: IntentStatus,
    ) -> LedgerResult<bool> {
        let mut state = self.lock()?;
        match state.intents.get_mut(order_id) {
            Some(intent) if intent.status == IntentStatus::Pending => {
                intent.status = status;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(LedgerError::UnknownIntent),
        }
    }

    async fn complete_deposit(
        &self,
        order_id: &str,
        payment_id: &str,
        expected_version: i64,
    ) -> LedgerResult<(Wallet, Transaction)> {
        let mut state = self.lock()?;
        let intent = state
            .intents
            .get(order_id)
            .cloned()
            .ok_or(LedgerError::UnknownIntent)?;
        match intent.status {
            IntentStatus::Pending => {}
            IntentStatus::Verified => {
                return Err(LedgerError::DuplicateExternalRef(order_id.to_string()))
            }
            IntentStatus::Expired => return Err(LedgerError::IntentExpired),
            IntentStatus::Failed => return Err(LedgerError::PaymentVerification),
        }

        let wallet = state.checked_wallet(&intent.wallet_id, expected_version)?;
        let result = state.append(
            wallet,
            NewTransaction {
                wallet_id: intent.wallet_id.clone(),
                kind: TransactionKind::Deposit,
                amount: intent.requested_amount,
                external_ref: Some(order_id.to_string()),
                metadata: serde_json::json!({ "payment_id": payment_id }),
            },
        )?;
        if let Some(intent) = state.intents.get_mut(order_id) {
            intent.status = IntentStatus::Verified;
        }
        Ok(result)
    }

    async fn reserve_withdrawal(
        &self,
        request: &WithdrawalRequest,
        expected_version: i64,
    ) -> LedgerResult<Wallet> {
        let mut state = self.lock()?;
        let wallet = state.checked_wallet(&request.wallet_id, expected_version)?;
        if state.withdrawals.contains_key(&request.id) {
            return Err(LedgerError::DuplicateExternalRef(request.id.clone()));
        }
        let change = ledger::apply_reservation(&wallet, request.amount)?;
        let wallet = state.commit_balances(wallet, change);

        let mut request = request.clone();
        request.status = WithdrawalStatus::Pending;
        state.withdrawals.insert(request.id.clone(), request);
        Ok(wallet)
    }

    async fn find_withdrawal(&self, request_id: &str) -> LedgerResult<Option<WithdrawalRequest>> {
        Ok(self.lock()?.withdrawals.get(request_id).cloned())
    }

    async fn list_withdrawals(&self, wallet_id: &str) -> LedgerResult<Vec<WithdrawalRequest>> {
        let state = self.lock()?;
        let mut requests: Vec<_> = state
            .withdrawals
            .values()
            .filter(|r| r.wallet_id == wallet_id)
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    async fn mark_withdrawal_processing(
        &self,
        request_id: &str,
    ) -> LedgerResult<WithdrawalRequest> {
        let mut state = self.lock()?;
        let request = state.withdrawal(request_id)?;
        if request.status != WithdrawalStatus::Pending {
            return Err(LedgerError::InvalidState(format!(
                "withdrawal {} is {}, expected pending",
                request_id,
                request.status.as_str()
            )));
        }
        state.set_withdrawal_status(request_id, WithdrawalStatus::Processing)
    }

    async fn set_payout_ref(&self, request_id: &str, payout_ref: &str) -> LedgerResult<()> {
        let mut state = self.lock()?;
        let request = state
            .withdrawals
            .get_mut(request_id)
            .ok_or_else(|| LedgerError::WithdrawalNotFound(request_id.to_string()))?;
        request.payout_ref = Some(payout_ref.to_string());
        Ok(())
    }

    async fn settle_withdrawal(
        &self,
        request_id: &str,
        expected_version: i64,
    ) -> LedgerResult<(Wallet, Transaction)> {
        let mut state = self.lock()?;
        let request = state.withdrawal(request_id)?;
        match request.status {
            WithdrawalStatus::Processing => {}
            WithdrawalStatus::Completed => {
                return Err(LedgerError::DuplicateExternalRef(request_id.to_string()))
            }
            other => {
                return Err(LedgerError::InvalidState(format!(
                    "cannot settle withdrawal {} in status {}",
                    request_id,
                    other.as_str()
                )))
            }
        }

        let wallet = state.checked_wallet(&request.wallet_id, expected_version)?;
        let result = state.append(
            wallet,
            NewTransaction {
                wallet_id: request.wallet_id.clone(),
                kind: TransactionKind::Withdrawal,
                amount: -request.amount,
                external_ref: Some(request_id.to_string()),
                metadata: serde_json::json!({
                    "destination": request.destination.0,
                    "payout_ref": request.payout_ref,
                }),
            },
        )?;
        state.set_withdrawal_status(request_id, WithdrawalStatus::Completed)?;
        Ok(result)
    }

    async fn fail_withdrawal(
        &self,
        request_id: &str,
        expected_version: i64,
    ) -> LedgerResult<WithdrawalFailure> {
        let mut state = self.lock()?;
        let request = state.withdrawal(request_id)?;
        match request.status {
            WithdrawalStatus::Pending | WithdrawalStatus::Processing => {}
            WithdrawalStatus::Failed | WithdrawalStatus::Reversed => {
                return Err(LedgerError::DuplicateExternalRef(request_id.to_string()))
            }
            WithdrawalStatus::Completed => {
                return Err(LedgerError::InvalidState(format!(
                    "withdrawal {} already completed",
                    request_id
                )))
            }
        }

        let wallet = state.checked_wallet(&request.wallet_id, expected_version)?;
        let debited = state
            .refs
            .contains_key(&(TransactionKind::Withdrawal, request_id.to_string()));

        if debited {
            let (wallet, reversal) = state.append(
                wallet,
                NewTransaction {
                    wallet_id: request.wallet_id.clone(),
                    kind: TransactionKind::WithdrawalReversal,
                    amount: request.amount,
                    external_ref: Some(request_id.to_string()),
                    metadata: serde_json::json!({ "reason": "payout_failed" }),
                },
            )?;
            let request = state.set_withdrawal_status(request_id, WithdrawalStatus::Reversed)?;
            Ok(WithdrawalFailure {
                wallet,
                request,
                reversal: Some(reversal),
            })
        } else {
            let change = ledger::apply_release(&wallet, request.amount)?;
            let wallet = state.commit_balances(wallet, change);
            let request = state.set_withdrawal_status(request_id, WithdrawalStatus::Failed)?;
            Ok(WithdrawalFailure {
                wallet,
                request,
                reversal: None,
            })
        }
    }
}
