use super::{LedgerStore, WithdrawalFailure};
use crate::errors::{LedgerError, LedgerResult};
use crate::ledger::{self, BalanceChange};
use crate::models::{
    DepositIntent, IntentStatus, NewTransaction, Transaction, TransactionKind, Wallet,
    WithdrawalRequest, WithdrawalStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction as DbTransaction};
use uuid::Uuid;

const WALLET_COLUMNS: &str =
    "id, owner_id, total_balance, reserved_balance, version, created_at, updated_at";
const TRANSACTION_COLUMNS: &str =
    "id, wallet_id, seq, kind, amount, balance_after, external_ref, metadata, created_at";
const INTENT_COLUMNS: &str =
    "id, wallet_id, requested_amount, gateway_order_id, status, created_at, expires_at";
const WITHDRAWAL_COLUMNS: &str =
    "id, wallet_id, amount, destination, status, payout_ref, created_at, updated_at";

/// Postgres-backed ledger store
///
/// All SQL lives here. Every mutation runs in one database transaction and
/// updates the wallet row with `WHERE version = expected`, so two service
/// instances racing on the same wallet cannot both commit.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // === Helper methods for working within transactions ===

    async fn wallet_in_tx(
        &self,
        tx: &mut DbTransaction<'_, Postgres>,
        wallet_id: &str,
    ) -> LedgerResult<Wallet> {
        let wallet = sqlx::query_as::<_, Wallet>(&format!(
            "SELECT {} FROM wallets WHERE id = $1",
            WALLET_COLUMNS
        ))
        .bind(wallet_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| LedgerError::WalletNotFound(wallet_id.to_string()))?;

        Ok(wallet)
    }

    /// Write new balances if nobody committed since `expected_version`
    async fn update_balances_in_tx(
        &self,
        tx: &mut DbTransaction<'_, Postgres>,
        wallet_id: &str,
        change: BalanceChange,
        expected_version: i64,
    ) -> LedgerResult<Wallet> {
        sqlx::query_as::<_, Wallet>(&format!(
            r#"
            UPDATE wallets
            SET total_balance = $1, reserved_balance = $2, version = version + 1, updated_at = $3
            WHERE id = $4 AND version = $5
            RETURNING {}
            "#,
            WALLET_COLUMNS
        ))
        .bind(change.total_balance)
        .bind(change.reserved_balance)
        .bind(Utc::now())
        .bind(wallet_id)
        .bind(expected_version) // This is the optimistic lock!
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(LedgerError::VersionConflict)
    }

    async fn ref_exists_in_tx(
        &self,
        tx: &mut DbTransaction<'_, Postgres>,
        kind: TransactionKind,
        external_ref: &str,
    ) -> LedgerResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM ledger_transactions
                WHERE kind = $1 AND external_ref = $2
            )
            "#,
        )
        .bind(kind.as_str())
        .bind(external_ref)
        .fetch_one(&mut **tx)
        .await?;

        Ok(exists)
    }

    /// Check, apply, and record one entry against a wallet read in this tx
    async fn append_in_tx(
        &self,
        tx: &mut DbTransaction<'_, Postgres>,
        wallet: &Wallet,
        entry: NewTransaction,
        expected_version: i64,
    ) -> LedgerResult<(Wallet, Transaction)> {
        if wallet.version != expected_version {
            return Err(LedgerError::VersionConflict);
        }
        if let Some(external_ref) = entry.external_ref.as_deref() {
            if self.ref_exists_in_tx(tx, entry.kind, external_ref).await? {
                return Err(LedgerError::DuplicateExternalRef(external_ref.to_string()));
            }
        }

        let change = ledger::apply_entry(wallet, entry.kind, entry.amount)?;
        let updated = self
            .update_balances_in_tx(tx, &wallet.id, change, expected_version)
            .await?;

        let transaction = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            INSERT INTO ledger_transactions
                (id, wallet_id, seq, kind, amount, balance_after, external_ref, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&updated.id)
        .bind(updated.version)
        .bind(entry.kind.as_str())
        .bind(entry.amount)
        .bind(updated.total_balance)
        .bind(entry.external_ref.as_deref())
        .bind(&entry.metadata)
        .bind(Utc::now())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| duplicate_or(e, entry.external_ref.as_deref()))?;

        Ok((updated, transaction))
    }

    async fn withdrawal_in_tx(
        &self,
        tx: &mut DbTransaction<'_, Postgres>,
        request_id: &str,
    ) -> LedgerResult<WithdrawalRequest> {
        let request = sqlx::query_as::<_, WithdrawalRequest>(&format!(
            "SELECT {} FROM withdrawal_requests WHERE id = $1 FOR UPDATE",
            WITHDRAWAL_COLUMNS
        ))
        .bind(request_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| LedgerError::WithdrawalNotFound(request_id.to_string()))?;

        Ok(request)
    }

    async fn set_withdrawal_status_in_tx(
        &self,
        tx: &mut DbTransaction<'_, Postgres>,
        request_id: &str,
        status: WithdrawalStatus,
    ) -> LedgerResult<WithdrawalRequest> {
        let request = sqlx::query_as::<_, WithdrawalRequest>(&format!(
            r#"
            UPDATE withdrawal_requests
            SET status = $1, updated_at = $2
            WHERE id = $3
            RETURNING {}
            "#,
            WITHDRAWAL_COLUMNS
        ))
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(request_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(request)
    }
}

/// A unique violation on the ledger means another writer applied the same
/// external reference first.
fn duplicate_or(e: sqlx::Error, external_ref: Option<&str>) -> LedgerError {
    let unique_violation =
        matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation());
    match (unique_violation, external_ref) {
        (true, Some(r)) => LedgerError::DuplicateExternalRef(r.to_string()),
        // (wallet_id, seq) collided: another writer committed this version
        (true, None) => LedgerError::VersionConflict,
        _ => LedgerError::DatabaseError(e),
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn create_wallet(&self, owner_id: &str) -> LedgerResult<Wallet> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO wallets (id, owner_id, total_balance, reserved_balance, version, created_at, updated_at)
            VALUES ($1, $2, 0, 0, 0, $3, $3)
            ON CONFLICT (owner_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(owner_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.find_wallet_by_owner(owner_id)
            .await?
            .ok_or_else(|| LedgerError::InternalError(format!("wallet for {} vanished", owner_id)))
    }

    async fn read_wallet(&self, wallet_id: &str) -> LedgerResult<Wallet> {
        let wallet = sqlx::query_as::<_, Wallet>(&format!(
            "SELECT {} FROM wallets WHERE id = $1",
            WALLET_COLUMNS
        ))
        .bind(wallet_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::WalletNotFound(wallet_id.to_string()))?;

        Ok(wallet)
    }

    async fn find_wallet_by_owner(&self, owner_id: &str) -> LedgerResult<Option<Wallet>> {
        let wallet = sqlx::query_as::<_, Wallet>(&format!(
            "SELECT {} FROM wallets WHERE owner_id = $1",
            WALLET_COLUMNS
        ))
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(wallet)
    }

    async fn append_transaction(
        &self,
        entry: NewTransaction,
        expected_version: i64,
    ) -> LedgerResult<(Wallet, Transaction)> {
        let mut tx = self.pool.begin().await?;
        let wallet = self.wallet_in_tx(&mut tx, &entry.wallet_id).await?;
        let result = self
            .append_in_tx(&mut tx, &wallet, entry, expected_version)
            .await?;
        tx.commit().await?;
        Ok(result)
    }

    async fn find_transaction_by_ref(
        &self,
        kind: TransactionKind,
        external_ref: &str,
    ) -> LedgerResult<Option<Transaction>> {
        let transaction = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {} FROM ledger_transactions WHERE kind = $1 AND external_ref = $2",
            TRANSACTION_COLUMNS
        ))
        .bind(kind.as_str())
        .bind(external_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(transaction)
    }

    async fn list_transactions(
        &self,
        wallet_id: &str,
        before_seq: Option<i64>,
        limit: i64,
    ) -> LedgerResult<Vec<Transaction>> {
        let transactions = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            SELECT {}
            FROM ledger_transactions
            WHERE wallet_id = $1 AND ($2::BIGINT IS NULL OR seq < $2)
            ORDER BY seq DESC
            LIMIT $3
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(wallet_id)
        .bind(before_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(transactions)
    }

    async fn replay_transactions(&self, wallet_id: &str) -> LedgerResult<Vec<Transaction>> {
        let transactions = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {} FROM ledger_transactions WHERE wallet_id = $1 ORDER BY seq ASC",
            TRANSACTION_COLUMNS
        ))
        .bind(wallet_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(transactions)
    }

    async fn create_deposit_intent(&self, intent: &DepositIntent) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO deposit_intents
                (id, wallet_id, requested_amount, gateway_order_id, status, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&intent.id)
        .bind(&intent.wallet_id)
        .bind(intent.requested_amount)
        .bind(&intent.gateway_order_id)
        .bind(intent.status.as_str())
        .bind(intent.created_at)
        .bind(intent.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| duplicate_or(e, Some(intent.gateway_order_id.as_str())))?;

        Ok(())
    }

    async fn find_deposit_intent(&self, order_id: &str) -> LedgerResult<Option<DepositIntent>> {
        let intent = sqlx::query_as::<_, DepositIntent>(&format!(
            "SELECT {} FROM deposit_intents WHERE gateway_order_id = $1",
            INTENT_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(intent)
    }

    async fn assign_gateway_order(
        &self,
        receipt: &str,
        gateway_order_id: &str,
    ) -> LedgerResult<()> {
        if receipt == gateway_order_id {
            return Ok(());
        }
        let rows_affected = sqlx::query(
            r#"
            UPDATE deposit_intents
            SET gateway_order_id = $1
            WHERE gateway_order_id = $2 AND status = 'pending'
            "#,
        )
        .bind(gateway_order_id)
        .bind(receipt)
        .execute(&self.pool)
        .await
        .map_err(|e| duplicate_or(e, Some(gateway_order_id)))?
        .rows_affected();

        if rows_affected == 1 {
            return Ok(());
        }
        match self.find_deposit_intent(receipt).await? {
            Some(intent) => Err(LedgerError::InvalidState(format!(
                "deposit intent {} is {}",
                receipt,
                intent.status.as_str()
            ))),
            None => Err(LedgerError::UnknownIntent),
        }
    }

    async fn close_deposit_intent(
        &self,
        order_id: &str,
        status: IntentStatus,
    ) -> LedgerResult<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE deposit_intents
            SET status = $1
            WHERE gateway_order_id = $2 AND status = 'pending'
            "#,
        )
        .bind(status.as_str())
        .bind(order_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    async fn complete_deposit(
        &self,
        order_id: &str,
        payment_id: &str,
        expected_version: i64,
    ) -> LedgerResult<(Wallet, Transaction)> {
        let mut tx = self.pool.begin().await?;

        // Lock the intent so two verifications of the same order serialize here
        let intent = sqlx::query_as::<_, DepositIntent>(&format!(
            "SELECT {} FROM deposit_intents WHERE gateway_order_id = $1 FOR UPDATE",
            INTENT_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(LedgerError::UnknownIntent)?;

        match intent.status {
            IntentStatus::Pending => {}
            IntentStatus::Verified => {
                return Err(LedgerError::DuplicateExternalRef(order_id.to_string()))
            }
            IntentStatus::Expired => return Err(LedgerError::IntentExpired),
            IntentStatus::Failed => return Err(LedgerError::PaymentVerification),
        }

        let wallet = self.wallet_in_tx(&mut tx, &intent.wallet_id).await?;
        let result = self
            .append_in_tx(
                &mut tx,
                &wallet,
                NewTransaction {
                    wallet_id: intent.wallet_id.clone(),
                    kind: TransactionKind::Deposit,
                    amount: intent.requested_amount,
                    external_ref: Some(order_id.to_string()),
                    metadata: serde_json::json!({ "payment_id": payment_id }),
                },
                expected_version,
            )
            .await?;

        sqlx::query("UPDATE deposit_intents SET status = 'verified' WHERE id = $1")
            .bind(&intent.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result)
    }

    async fn reserve_withdrawal(
        &self,
        request: &WithdrawalRequest,
        expected_version: i64,
    ) -> LedgerResult<Wallet> {
        let mut tx = self.pool.begin().await?;

        let wallet = self.wallet_in_tx(&mut tx, &request.wallet_id).await?;
        if wallet.version != expected_version {
            return Err(LedgerError::VersionConflict);
        }
        let change = ledger::apply_reservation(&wallet, request.amount)?;
        let updated = self
            .update_balances_in_tx(&mut tx, &wallet.id, change, expected_version)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO withdrawal_requests
                (id, wallet_id, amount, destination, status, payout_ref, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'pending', NULL, $5, $5)
            "#,
        )
        .bind(&request.id)
        .bind(&request.wallet_id)
        .bind(request.amount)
        .bind(&request.destination)
        .bind(request.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| duplicate_or(e, Some(request.id.as_str())))?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn find_withdrawal(&self, request_id: &str) -> LedgerResult<Option<WithdrawalRequest>> {
        let request = sqlx::query_as::<_, WithdrawalRequest>(&format!(
            "SELECT {} FROM withdrawal_requests WHERE id = $1",
            WITHDRAWAL_COLUMNS
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(request)
    }

    async fn list_withdrawals(&self, wallet_id: &str) -> LedgerResult<Vec<WithdrawalRequest>> {
        let requests = sqlx::query_as::<_, WithdrawalRequest>(&format!(
            r#"
            SELECT {}
            FROM withdrawal_requests
            WHERE wallet_id = $1
            ORDER BY created_at DESC
            "#,
            WITHDRAWAL_COLUMNS
        ))
        .bind(wallet_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(requests)
    }

    async fn mark_withdrawal_processing(
        &self,
        request_id: &str,
    ) -> LedgerResult<WithdrawalRequest> {
        let updated = sqlx::query_as::<_, WithdrawalRequest>(&format!(
            r#"
            UPDATE withdrawal_requests
            SET status = 'processing', updated_at = $1
            WHERE id = $2 AND status = 'pending'
            RETURNING {}
            "#,
            WITHDRAWAL_COLUMNS
        ))
        .bind(Utc::now())
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(request) => Ok(request),
            None => match self.find_withdrawal(request_id).await? {
                Some(request) => Err(LedgerError::InvalidState(format!(
                    "withdrawal {} is {}, expected pending",
                    request_id,
                    request.status.as_str()
                ))),
                None => Err(LedgerError::WithdrawalNotFound(request_id.to_string())),
            },
        }
    }

    async fn set_payout_ref(&self, request_id: &str, payout_ref: &str) -> LedgerResult<()> {
        let rows_affected = sqlx::query(
            "UPDATE withdrawal_requests SET payout_ref = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(payout_ref)
        .bind(Utc::now())
        .bind(request_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(LedgerError::WithdrawalNotFound(request_id.to_string()));
        }
        Ok(())
    }

    async fn settle_withdrawal(
        &self,
        request_id: &str,
        expected_version: i64,
    ) -> LedgerResult<(Wallet, Transaction)> {
        let mut tx = self.pool.begin().await?;

        let request = self.withdrawal_in_tx(&mut tx, request_id).await?;
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

        let wallet = self.wallet_in_tx(&mut tx, &request.wallet_id).await?;
        let result = self
            .append_in_tx(
                &mut tx,
                &wallet,
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
                expected_version,
            )
            .await?;

        self.set_withdrawal_status_in_tx(&mut tx, request_id, WithdrawalStatus::Completed)
            .await?;

        tx.commit().await?;
        Ok(result)
    }

    async fn fail_withdrawal(
        &self,
        request_id: &str,
        expected_version: i64,
    ) -> LedgerResult<WithdrawalFailure> {
        let mut tx = self.pool.begin().await?;

        let request = self.withdrawal_in_tx(&mut tx, request_id).await?;
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

        let wallet = self.wallet_in_tx(&mut tx, &request.wallet_id).await?;
        let debited = self
            .ref_exists_in_tx(&mut tx, TransactionKind::Withdrawal, request_id)
            .await?;

        let failure = if debited {
            let (wallet, reversal) = self
                .append_in_tx(
                    &mut tx,
                    &wallet,
                    NewTransaction {
                        wallet_id: request.wallet_id.clone(),
                        kind: TransactionKind::WithdrawalReversal,
                        amount: request.amount,
                        external_ref: Some(request_id.to_string()),
                        metadata: serde_json::json!({ "reason": "payout_failed" }),
                    },
                    expected_version,
                )
                .await?;
            let request = self
                .set_withdrawal_status_in_tx(&mut tx, request_id, WithdrawalStatus::Reversed)
                .await?;
            WithdrawalFailure {
                wallet,
                request,
                reversal: Some(reversal),
            }
        } else {
            if wallet.version != expected_version {
                return Err(LedgerError::VersionConflict);
            }
            let change = ledger::apply_release(&wallet, request.amount)?;
            let wallet = self
                .update_balances_in_tx(&mut tx, &request.wallet_id, change, expected_version)
                .await?;
            let request = self
                .set_withdrawal_status_in_tx(&mut tx, request_id, WithdrawalStatus::Failed)
                .await?;
            WithdrawalFailure {
                wallet,
                request,
                reversal: None,
            }
        };

        tx.commit().await?;
        Ok(failure)
    }
}
