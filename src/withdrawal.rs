use crate::errors::{LedgerError, LedgerResult};
use crate::guard::BalanceGuard;
use crate::kafka::{publish_committed, EventPublisher, LedgerEvent};
use crate::models::{PayoutDestination, WithdrawalRequest, WithdrawalStatus};
use crate::payout::{PayoutError, PayoutOutcome, PayoutRail};
use crate::signature;
use crate::store::LedgerStore;
use chrono::Utc;
use futures::FutureExt;
use rust_decimal::Decimal;
use sqlx::types::Json;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WithdrawalSettings {
    pub minimum: Decimal,
    /// Shared secret the payout rail signs `request_id|status` with
    pub webhook_secret: String,
}

/// Final status reported by the payout rail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutStatus {
    Succeeded,
    Failed,
}

impl PayoutStatus {
    pub fn parse(status: &str) -> LedgerResult<Self> {
        match status.trim().to_ascii_lowercase().as_str() {
            "success" | "succeeded" | "completed" | "processed" => Ok(PayoutStatus::Succeeded),
            "failed" | "rejected" | "reversed" => Ok(PayoutStatus::Failed),
            other => Err(LedgerError::InvalidPayoutStatus(other.to_string())),
        }
    }
}

pub struct WithdrawalController {
    store: Arc<dyn LedgerStore>,
    guard: Arc<BalanceGuard>,
    rail: Arc<dyn PayoutRail>,
    publisher: Arc<dyn EventPublisher>,
    settings: WithdrawalSettings,
}

impl WithdrawalController {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        guard: Arc<BalanceGuard>,
        rail: Arc<dyn PayoutRail>,
        publisher: Arc<dyn EventPublisher>,
        settings: WithdrawalSettings,
    ) -> Self {
        Self {
            store,
            guard,
            rail,
            publisher,
            settings,
        }
    }

    /// Reserve funds, record the request and hand it to the payout rail.
    ///
    /// The returned request is `processing` unless the rail answered
    /// synchronously, in which case it is already `completed` or `failed`.
    pub async fn request_withdrawal(
        &self,
        wallet_id: &str,
        amount: Decimal,
        destination: PayoutDestination,
    ) -> LedgerResult<WithdrawalRequest> {
        if amount <= Decimal::ZERO || amount.normalize().scale() > 2 {
            return Err(LedgerError::InvalidAmount(
                "Amount must be positive with at most 2 decimal places".to_string(),
            ));
        }
        if amount < self.settings.minimum {
            return Err(LedgerError::BelowMinimum {
                amount,
                minimum: self.settings.minimum,
            });
        }
        destination
            .validate()
            .map_err(LedgerError::InvalidDestination)?;

        let now = Utc::now();
        let request = WithdrawalRequest {
            id: Uuid::new_v4().to_string(),
            wallet_id: wallet_id.to_string(),
            amount,
            destination: Json(destination),
            status: WithdrawalStatus::Pending,
            payout_ref: None,
            created_at: now,
            updated_at: now,
        };

        let store = &self.store;
        let pending = &request;
        let wallet = self
            .guard
            .mutate(wallet_id, |w| {
                async move { store.reserve_withdrawal(pending, w.version).await }.boxed()
            })
            .await?;

        tracing::info!(
            wallet_id = %wallet_id,
            request_id = %request.id,
            amount = %amount,
            reserved_balance = %wallet.reserved_balance,
            "Withdrawal reserved"
        );
        publish_committed(
            self.publisher.as_ref(),
            LedgerEvent::WithdrawalRequested {
                wallet_id: wallet.id.clone(),
                request_id: request.id.clone(),
                amount,
                reserved_balance: wallet.reserved_balance,
                timestamp: Utc::now(),
            },
        )
        .await;

        let processing = self.store.mark_withdrawal_processing(&request.id).await?;
        self.submit(&processing).await?;

        self.get_withdrawal(&request.id).await
    }

    async fn submit(&self, request: &WithdrawalRequest) -> LedgerResult<()> {
        let receipt = match self
            .rail
            .submit(&request.id, &request.destination.0, request.amount)
            .await
        {
            Ok(receipt) => receipt,
            Err(e @ PayoutError::Rejected(_)) => {
                tracing::warn!(
                    error = %e,
                    request_id = %request.id,
                    "Payout refused by rail"
                );
                self.fail_payout(&request.id).await?;
                return Ok(());
            }
            Err(e) => {
                // Outcome unknown: keep the reservation and wait for the callback
                tracing::warn!(
                    error = %e,
                    request_id = %request.id,
                    "Payout submission failed, awaiting callback"
                );
                return Ok(());
            }
        };

        self.store
            .set_payout_ref(&request.id, &receipt.payout_ref)
            .await?;
        tracing::info!(
            request_id = %request.id,
            payout_ref = %receipt.payout_ref,
            outcome = ?receipt.outcome,
            "Payout submitted"
        );

        match receipt.outcome {
            PayoutOutcome::Accepted => {}
            PayoutOutcome::Settled => {
                self.complete_payout(&request.id).await?;
            }
            PayoutOutcome::Rejected => {
                self.fail_payout(&request.id).await?;
            }
        }
        Ok(())
    }

    /// Debit the reservation. A completed request is returned unchanged.
    pub async fn complete_payout(&self, request_id: &str) -> LedgerResult<WithdrawalRequest> {
        let request = self.get_withdrawal(request_id).await?;
        if request.status == WithdrawalStatus::Completed {
            return Ok(request);
        }

        let store = &self.store;
        let result = self
            .guard
            .mutate(&request.wallet_id, |w| {
                async move { store.settle_withdrawal(request_id, w.version).await }.boxed()
            })
            .await;

        match result {
            Ok((wallet, txn)) => {
                tracing::info!(
                    wallet_id = %wallet.id,
                    request_id = %request_id,
                    amount = %request.amount,
                    balance_after = %txn.balance_after,
                    "Withdrawal completed"
                );
                publish_committed(
                    self.publisher.as_ref(),
                    LedgerEvent::withdrawal_completed(request_id, &txn),
                )
                .await;
            }
            Err(LedgerError::DuplicateExternalRef(_)) => {}
            Err(e) => return Err(e),
        }

        self.get_withdrawal(request_id).await
    }

    /// Release the reservation, or credit back a debit already applied.
    /// Failed and reversed requests are returned unchanged.
    pub async fn fail_payout(&self, request_id: &str) -> LedgerResult<WithdrawalRequest> {
        let request = self.get_withdrawal(request_id).await?;
        match request.status {
            WithdrawalStatus::Failed | WithdrawalStatus::Reversed => return Ok(request),
            WithdrawalStatus::Completed => {
                return Err(LedgerError::InvalidState(format!(
                    "withdrawal {} already completed",
                    request_id
                )))
            }
            WithdrawalStatus::Pending | WithdrawalStatus::Processing => {}
        }

        let store = &self.store;
        let result = self
            .guard
            .mutate(&request.wallet_id, |w| {
                async move { store.fail_withdrawal(request_id, w.version).await }.boxed()
            })
            .await;

        match result {
            Ok(failure) => {
                let event = match &failure.reversal {
                    Some(txn) => LedgerEvent::withdrawal_reversed(request_id, txn),
                    None => LedgerEvent::WithdrawalReleased {
                        wallet_id: failure.wallet.id.clone(),
                        request_id: request_id.to_string(),
                        amount: request.amount,
                        timestamp: Utc::now(),
                    },
                };
                tracing::info!(
                    wallet_id = %failure.wallet.id,
                    request_id = %request_id,
                    status = failure.request.status.as_str(),
                    "Withdrawal failed"
                );
                publish_committed(self.publisher.as_ref(), event).await;
            }
            Err(LedgerError::DuplicateExternalRef(_)) => {}
            Err(e) => return Err(e),
        }

        self.get_withdrawal(request_id).await
    }

    /// Apply a final status from a trusted channel (the payout-events topic)
    pub async fn apply_payout_status(
        &self,
        request_id: &str,
        status: PayoutStatus,
    ) -> LedgerResult<WithdrawalRequest> {
        match status {
            PayoutStatus::Succeeded => self.complete_payout(request_id).await,
            PayoutStatus::Failed => self.fail_payout(request_id).await,
        }
    }

    /// Signed webhook from the payout rail
    pub async fn handle_payout_callback(
        &self,
        request_id: &str,
        status: &str,
        signature: &str,
    ) -> LedgerResult<WithdrawalRequest> {
        if !signature::verify(&self.settings.webhook_secret, &[request_id, status], signature) {
            tracing::warn!(request_id = %request_id, "Payout callback signature mismatch");
            return Err(LedgerError::PaymentVerification);
        }
        let status = PayoutStatus::parse(status)?;
        self.apply_payout_status(request_id, status).await
    }

    pub async fn get_withdrawal(&self, request_id: &str) -> LedgerResult<WithdrawalRequest> {
        self.store
            .find_withdrawal(request_id)
            .await?
            .ok_or_else(|| LedgerError::WithdrawalNotFound(request_id.to_string()))
    }

    pub async fn list_withdrawals(&self, wallet_id: &str) -> LedgerResult<Vec<WithdrawalRequest>> {
        self.store.read_wallet(wallet_id).await?;
        self.store.list_withdrawals(wallet_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::RetryPolicy;
    use crate::kafka::LogPublisher;
    use crate::models::{NewTransaction, TransactionKind, Wallet};
    use crate::payout::{PayoutReceipt, SandboxPayoutRail};
    use crate::store::MemoryLedgerStore;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    const SECRET: &str = "payout-secret";

    #[derive(Debug)]
    struct ScriptedRail(Option<PayoutOutcome>);

    #[async_trait]
    impl PayoutRail for ScriptedRail {
        async fn submit(
            &self,
            request_id: &str,
            _destination: &PayoutDestination,
            _amount: Decimal,
        ) -> Result<PayoutReceipt, PayoutError> {
            match self.0 {
                Some(outcome) => Ok(PayoutReceipt {
                    payout_ref: format!("payout_{}", request_id),
                    outcome,
                }),
                None => Err(PayoutError::Network("connection reset".to_string())),
            }
        }
    }

    /// Rail that refuses every payout at submission
    #[derive(Debug)]
    struct RefusingRail;

    #[async_trait]
    impl PayoutRail for RefusingRail {
        async fn submit(
            &self,
            _request_id: &str,
            _destination: &PayoutDestination,
            _amount: Decimal,
        ) -> Result<PayoutReceipt, PayoutError> {
            Err(PayoutError::Rejected("400 BAD_REQUEST_ERROR: Invalid VPA".to_string()))
        }
    }

    fn upi() -> PayoutDestination {
        PayoutDestination::Upi {
            vpa: "trader@okbank".to_string(),
        }
    }

    async fn setup(
        rail: Arc<dyn PayoutRail>,
        funds: Decimal,
    ) -> (Arc<dyn LedgerStore>, WithdrawalController, Wallet) {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
        let guard = Arc::new(BalanceGuard::new(store.clone(), RetryPolicy::default()));
        let controller = WithdrawalController::new(
            store.clone(),
            guard,
            rail,
            Arc::new(LogPublisher),
            WithdrawalSettings {
                minimum: dec!(100),
                webhook_secret: SECRET.to_string(),
            },
        );
        let wallet = store.create_wallet("owner").await.unwrap();
        let (wallet, _) = store
            .append_transaction(
                NewTransaction {
                    wallet_id: wallet.id.clone(),
                    kind: TransactionKind::Deposit,
                    amount: funds,
                    external_ref: Some("order_seed".to_string()),
                    metadata: serde_json::json!({}),
                },
                wallet.version,
            )
            .await
            .unwrap();
        (store, controller, wallet)
    }

    #[tokio::test]
    async fn validation_errors() {
        let (_, withdrawals, wallet) = setup(Arc::new(SandboxPayoutRail), dec!(1000)).await;

        assert!(matches!(
            withdrawals.request_withdrawal(&wallet.id, dec!(50), upi()).await,
            Err(LedgerError::BelowMinimum { .. })
        ));
        assert!(matches!(
            withdrawals.request_withdrawal(&wallet.id, dec!(0), upi()).await,
            Err(LedgerError::InvalidAmount(_))
        ));
        let bad = PayoutDestination::Upi {
            vpa: "no-handle".to_string(),
        };
        assert!(matches!(
            withdrawals.request_withdrawal(&wallet.id, dec!(200), bad).await,
            Err(LedgerError::InvalidDestination(_))
        ));
    }

    #[tokio::test]
    async fn over_balance_changes_nothing() {
        let (store, withdrawals, wallet) = setup(Arc::new(SandboxPayoutRail), dec!(1000)).await;

        let result = withdrawals.request_withdrawal(&wallet.id, dec!(1000.01), upi()).await;
        assert!(matches!(
            result,
            Err(LedgerError::InsufficientBalance { .. })
        ));

        let after = store.read_wallet(&wallet.id).await.unwrap();
        assert_eq!(after.total_balance, dec!(1000));
        assert_eq!(after.reserved_balance, Decimal::ZERO);
        assert_eq!(after.version, wallet.version);
        assert!(withdrawals.list_withdrawals(&wallet.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn accepted_payout_waits_then_completes_once() {
        let (store, withdrawals, wallet) = setup(Arc::new(SandboxPayoutRail), dec!(1500)).await;

        let request = withdrawals
            .request_withdrawal(&wallet.id, dec!(1200), upi())
            .await
            .unwrap();
        assert_eq!(request.status, WithdrawalStatus::Processing);
        assert!(request.payout_ref.is_some());

        let reserved = store.read_wallet(&wallet.id).await.unwrap();
        assert_eq!(reserved.reserved_balance, dec!(1200));
        assert_eq!(reserved.available_balance(), dec!(300));

        let done = withdrawals.complete_payout(&request.id).await.unwrap();
        assert_eq!(done.status, WithdrawalStatus::Completed);
        let again = withdrawals.complete_payout(&request.id).await.unwrap();
        assert_eq!(again.status, WithdrawalStatus::Completed);

        let settled = store.read_wallet(&wallet.id).await.unwrap();
        assert_eq!(settled.total_balance, dec!(300));
        assert_eq!(settled.reserved_balance, Decimal::ZERO);

        let last = store.list_transactions(&wallet.id, None, 1).await.unwrap();
        assert_eq!(last[0].amount, dec!(-1200));
        assert_eq!(last[0].balance_after, dec!(300));
        assert_eq!(store.replay_transactions(&wallet.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_payout_releases_reservation() {
        let (store, withdrawals, wallet) = setup(Arc::new(SandboxPayoutRail), dec!(1000)).await;
        let request = withdrawals
            .request_withdrawal(&wallet.id, dec!(400), upi())
            .await
            .unwrap();

        let failed = withdrawals.fail_payout(&request.id).await.unwrap();
        assert_eq!(failed.status, WithdrawalStatus::Failed);
        assert_eq!(
            withdrawals.fail_payout(&request.id).await.unwrap().status,
            WithdrawalStatus::Failed
        );

        let after = store.read_wallet(&wallet.id).await.unwrap();
        assert_eq!(after.total_balance, dec!(1000));
        assert_eq!(after.reserved_balance, Decimal::ZERO);

        assert!(matches!(
            withdrawals.complete_payout(&request.id).await,
            Err(LedgerError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn failing_a_completed_payout_is_invalid() {
        let (_, withdrawals, wallet) =
            setup(Arc::new(ScriptedRail(Some(PayoutOutcome::Settled))), dec!(1000)).await;
        let request = withdrawals
            .request_withdrawal(&wallet.id, dec!(400), upi())
            .await
            .unwrap();
        assert_eq!(request.status, WithdrawalStatus::Completed);

        assert!(matches!(
            withdrawals.fail_payout(&request.id).await,
            Err(LedgerError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn rejected_payout_is_released_immediately() {
        let (store, withdrawals, wallet) =
            setup(Arc::new(ScriptedRail(Some(PayoutOutcome::Rejected))), dec!(1000)).await;
        let request = withdrawals
            .request_withdrawal(&wallet.id, dec!(400), upi())
            .await
            .unwrap();
        assert_eq!(request.status, WithdrawalStatus::Failed);
        let after = store.read_wallet(&wallet.id).await.unwrap();
        assert_eq!(after.available_balance(), dec!(1000));
    }

    #[tokio::test]
    async fn refused_submission_releases_reservation() {
        let (store, withdrawals, wallet) = setup(Arc::new(RefusingRail), dec!(1000)).await;
        let request = withdrawals
            .request_withdrawal(&wallet.id, dec!(400), upi())
            .await
            .unwrap();
        assert_eq!(request.status, WithdrawalStatus::Failed);
        assert!(request.payout_ref.is_none());
        let after = store.read_wallet(&wallet.id).await.unwrap();
        assert_eq!(after.reserved_balance, dec!(0));
        assert_eq!(after.total_balance, dec!(1000));
    }

    #[tokio::test]
    async fn transport_error_keeps_request_processing() {
        let (store, withdrawals, wallet) = setup(Arc::new(ScriptedRail(None)), dec!(1000)).await;
        let request = withdrawals
            .request_withdrawal(&wallet.id, dec!(400), upi())
            .await
            .unwrap();
        assert_eq!(request.status, WithdrawalStatus::Processing);
        assert!(request.payout_ref.is_none());
        let after = store.read_wallet(&wallet.id).await.unwrap();
        assert_eq!(after.reserved_balance, dec!(400));
    }

    #[tokio::test]
    async fn callback_requires_valid_signature_and_status() {
        let (store, withdrawals, wallet) = setup(Arc::new(SandboxPayoutRail), dec!(1000)).await;
        let request = withdrawals
            .request_withdrawal(&wallet.id, dec!(400), upi())
            .await
            .unwrap();

        let forged = signature::sign("wrong", &[&request.id, "success"]);
        assert!(matches!(
            withdrawals
                .handle_payout_callback(&request.id, "success", &forged)
                .await,
            Err(LedgerError::PaymentVerification)
        ));

        let odd = signature::sign(SECRET, &[&request.id, "queued"]);
        assert!(matches!(
            withdrawals
                .handle_payout_callback(&request.id, "queued", &odd)
                .await,
            Err(LedgerError::InvalidPayoutStatus(_))
        ));

        let sig = signature::sign(SECRET, &[&request.id, "success"]);
        let done = withdrawals
            .handle_payout_callback(&request.id, "success", &sig)
            .await
            .unwrap();
        assert_eq!(done.status, WithdrawalStatus::Completed);
        assert_eq!(
            store.read_wallet(&wallet.id).await.unwrap().total_balance,
            dec!(600)
        );
    }

    #[test]
    fn payout_status_parsing() {
        assert_eq!(PayoutStatus::parse("SUCCESS").unwrap(), PayoutStatus::Succeeded);
        assert_eq!(PayoutStatus::parse("failed").unwrap(), PayoutStatus::Failed);
        assert!(PayoutStatus::parse("pending").is_err());
    }
}
