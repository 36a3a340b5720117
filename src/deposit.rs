use crate::errors::{LedgerError, LedgerResult};
use crate::gateway::PaymentGateway;
use crate::guard::BalanceGuard;
use crate::kafka::{publish_committed, EventPublisher, LedgerEvent};
use crate::models::{DepositIntent, DepositOrderResponse, IntentStatus, Wallet};
use crate::signature;
use crate::store::LedgerStore;
use chrono::Utc;
use futures::FutureExt;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DepositSettings {
    pub minimum: Decimal,
    pub maximum: Decimal,
    pub intent_ttl: chrono::Duration,
    pub currency: String,
    /// Shared secret the gateway signs `order_id|payment_id` with
    pub gateway_secret: String,
}

/// Result of a verify call
#[derive(Debug, Clone)]
pub struct DepositVerification {
    pub wallet: Wallet,
    /// False when the intent had already been credited by an earlier call
    pub credited: bool,
}

pub struct DepositController {
    store: Arc<dyn LedgerStore>,
    guard: Arc<BalanceGuard>,
    gateway: Arc<dyn PaymentGateway>,
    publisher: Arc<dyn EventPublisher>,
    settings: DepositSettings,
}

impl DepositController {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        guard: Arc<BalanceGuard>,
        gateway: Arc<dyn PaymentGateway>,
        publisher: Arc<dyn EventPublisher>,
        settings: DepositSettings,
    ) -> Self {
        Self {
            store,
            guard,
            gateway,
            publisher,
            settings,
        }
    }

    fn validate_amount(&self, amount: Decimal) -> LedgerResult<()> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(
                "Amount must be positive".to_string(),
            ));
        }
        if amount.normalize().scale() > 2 {
            return Err(LedgerError::InvalidAmount(
                "Amount cannot have more than 2 decimal places".to_string(),
            ));
        }
        if amount < self.settings.minimum {
            return Err(LedgerError::BelowMinimum {
                amount,
                minimum: self.settings.minimum,
            });
        }
        if amount > self.settings.maximum {
            return Err(LedgerError::AboveMaximum {
                amount,
                maximum: self.settings.maximum,
            });
        }
        Ok(())
    }

    /// Open a deposit intent and a matching gateway order. No balance change.
    pub async fn initiate_deposit(
        &self,
        wallet_id: &str,
        amount: Decimal,
    ) -> LedgerResult<DepositOrderResponse> {
        self.validate_amount(amount)?;
        self.store.read_wallet(wallet_id).await?;

        let now = Utc::now();
        let intent = DepositIntent {
            id: Uuid::new_v4().to_string(),
            wallet_id: wallet_id.to_string(),
            requested_amount: amount,
            gateway_order_id: format!("order_{}", Uuid::new_v4().simple()),
            status: IntentStatus::Pending,
            created_at: now,
            expires_at: now + self.settings.intent_ttl,
        };
        self.store.create_deposit_intent(&intent).await?;

        let amount_minor = (amount * Decimal::ONE_HUNDRED)
            .to_i64()
            .ok_or_else(|| LedgerError::InvalidAmount("Amount out of range".to_string()))?;

        let order = match self
            .gateway
            .create_order(&intent.gateway_order_id, amount_minor, &self.settings.currency)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    wallet_id = %wallet_id,
                    order_id = %intent.gateway_order_id,
                    "Gateway order creation failed"
                );
                self.store
                    .close_deposit_intent(&intent.gateway_order_id, IntentStatus::Failed)
                    .await?;
                return Err(LedgerError::GatewayUnavailable(e.to_string()));
            }
        };

        if order.order_id != intent.gateway_order_id {
            if let Err(e) = self
                .store
                .assign_gateway_order(&intent.gateway_order_id, &order.order_id)
                .await
            {
                tracing::error!(
                    error = %e,
                    receipt = %intent.gateway_order_id,
                    order_id = %order.order_id,
                    "Failed to record gateway order id"
                );
                self.store
                    .close_deposit_intent(&intent.gateway_order_id, IntentStatus::Failed)
                    .await?;
                return Err(e);
            }
        }

        tracing::info!(
            wallet_id = %wallet_id,
            order_id = %order.order_id,
            amount = %amount,
            "Deposit initiated"
        );

        Ok(DepositOrderResponse {
            order_id: order.order_id,
            checkout_key: order.checkout_key,
            amount,
            currency: self.settings.currency.clone(),
            expires_at: intent.expires_at,
        })
    }

    /// Check the gateway's signed confirmation and credit the intent once.
    ///
    /// Safe to call repeatedly with the same triple: after the first credit
    /// every call returns the current wallet with `credited = false`.
    pub async fn verify_deposit(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> LedgerResult<DepositVerification> {
        let intent = self
            .store
            .find_deposit_intent(order_id)
            .await?
            .ok_or(LedgerError::UnknownIntent)?;

        match intent.status {
            IntentStatus::Pending => {}
            IntentStatus::Verified => {
                tracing::debug!(order_id = %order_id, "Deposit already verified");
                let wallet = self.store.read_wallet(&intent.wallet_id).await?;
                return Ok(DepositVerification {
                    wallet,
                    credited: false,
                });
            }
            IntentStatus::Expired => return Err(LedgerError::IntentExpired),
            IntentStatus::Failed => return Err(LedgerError::PaymentVerification),
        }

        if Utc::now() >= intent.expires_at {
            self.store
                .close_deposit_intent(order_id, IntentStatus::Expired)
                .await?;
            tracing::info!(order_id = %order_id, "Deposit intent expired");
            return Err(LedgerError::IntentExpired);
        }

        if !signature::verify(&self.settings.gateway_secret, &[order_id, payment_id], signature) {
            tracing::warn!(
                order_id = %order_id,
                wallet_id = %intent.wallet_id,
                "Deposit signature mismatch"
            );
            return Err(LedgerError::PaymentVerification);
        }

        let store = &self.store;
        let result = self
            .guard
            .mutate(&intent.wallet_id, |w| {
                async move { store.complete_deposit(order_id, payment_id, w.version).await }
                    .boxed()
            })
            .await;

        match result {
            Ok((wallet, txn)) => {
                tracing::info!(
                    wallet_id = %wallet.id,
                    order_id = %order_id,
                    amount = %txn.amount,
                    balance_after = %txn.balance_after,
                    "Deposit credited"
                );
                publish_committed(
                    self.publisher.as_ref(),
                    LedgerEvent::deposit_credited(order_id, &txn),
                )
                .await;
                Ok(DepositVerification {
                    wallet,
                    credited: true,
                })
            }
            Err(LedgerError::DuplicateExternalRef(_)) => {
                let wallet = self.store.read_wallet(&intent.wallet_id).await?;
                Ok(DepositVerification {
                    wallet,
                    credited: false,
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayError, GatewayOrder, SandboxGateway};
    use crate::guard::RetryPolicy;
    use crate::kafka::LogPublisher;
    use crate::store::MemoryLedgerStore;
    use rust_decimal_macros::dec;

    const SECRET: &str = "gateway-secret";

    /// Gateway that assigns its own order ids, like a hosted checkout does
    #[derive(Debug)]
    struct IssuingGateway;

    #[async_trait::async_trait]
    impl PaymentGateway for IssuingGateway {
        async fn create_order(
            &self,
            receipt: &str,
            _amount_minor: i64,
            _currency: &str,
        ) -> Result<GatewayOrder, GatewayError> {
            Ok(GatewayOrder {
                order_id: format!("order_gw_{}", &receipt["order_".len()..]),
                checkout_key: "key_live".to_string(),
            })
        }
    }

    fn controller_with(
        key_id: &str,
        ttl: chrono::Duration,
    ) -> (Arc<dyn LedgerStore>, DepositController) {
        controller_on(Arc::new(SandboxGateway::new(key_id)), ttl)
    }

    fn controller_on(
        gateway: Arc<dyn PaymentGateway>,
        ttl: chrono::Duration,
    ) -> (Arc<dyn LedgerStore>, DepositController) {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
        let guard = Arc::new(BalanceGuard::new(store.clone(), RetryPolicy::default()));
        let controller = DepositController::new(
            store.clone(),
            guard,
            gateway,
            Arc::new(LogPublisher),
            DepositSettings {
                minimum: dec!(100),
                maximum: dec!(100000),
                intent_ttl: ttl,
                currency: "INR".to_string(),
                gateway_secret: SECRET.to_string(),
            },
        );
        (store, controller)
    }

    fn controller() -> (Arc<dyn LedgerStore>, DepositController) {
        controller_with("key_test", chrono::Duration::minutes(15))
    }

    #[tokio::test]
    async fn amount_limits_are_enforced() {
        let (store, deposits) = controller();
        let wallet = store.create_wallet("owner").await.unwrap();

        assert!(matches!(
            deposits.initiate_deposit(&wallet.id, dec!(99.99)).await,
            Err(LedgerError::BelowMinimum { .. })
        ));
        assert!(matches!(
            deposits.initiate_deposit(&wallet.id, dec!(100000.01)).await,
            Err(LedgerError::AboveMaximum { .. })
        ));
        assert!(matches!(
            deposits.initiate_deposit(&wallet.id, dec!(150.005)).await,
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            deposits.initiate_deposit(&wallet.id, dec!(-500)).await,
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            deposits.initiate_deposit("missing", dec!(500)).await,
            Err(LedgerError::WalletNotFound(_))
        ));
    }

    #[tokio::test]
    async fn initiate_creates_pending_intent_without_touching_balance() {
        let (store, deposits) = controller();
        let wallet = store.create_wallet("owner").await.unwrap();

        let order = deposits.initiate_deposit(&wallet.id, dec!(500)).await.unwrap();
        assert!(order.order_id.starts_with("order_"));
        assert_eq!(order.order_id.len(), "order_".len() + 32);
        assert_eq!(order.checkout_key, "key_test");
        assert_eq!(order.currency, "INR");

        let intent = store
            .find_deposit_intent(&order.order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(intent.status, IntentStatus::Pending);
        assert_eq!(intent.requested_amount, dec!(500));

        let wallet = store.read_wallet(&wallet.id).await.unwrap();
        assert_eq!(wallet.total_balance, Decimal::ZERO);
    }

    #[tokio::test]
    async fn gateway_failure_is_reported() {
        let (store, deposits) = controller_with("", chrono::Duration::minutes(15));
        let wallet = store.create_wallet("owner").await.unwrap();

        let result = deposits.initiate_deposit(&wallet.id, dec!(500)).await;
        assert!(matches!(result, Err(LedgerError::GatewayUnavailable(_))));
    }

    #[tokio::test]
    async fn verify_credits_exactly_once() {
        let (store, deposits) = controller();
        let wallet = store.create_wallet("owner").await.unwrap();
        let order = deposits.initiate_deposit(&wallet.id, dec!(500)).await.unwrap();
        let sig = signature::sign(SECRET, &[&order.order_id, "pay_1"]);

        let first = deposits
            .verify_deposit(&order.order_id, "pay_1", &sig)
            .await
            .unwrap();
        assert!(first.credited);
        assert_eq!(first.wallet.total_balance, dec!(500));

        let second = deposits
            .verify_deposit(&order.order_id, "pay_1", &sig)
            .await
            .unwrap();
        assert!(!second.credited);
        assert_eq!(second.wallet.total_balance, dec!(500));

        let log = store.replay_transactions(&wallet.id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].external_ref.as_deref(), Some(order.order_id.as_str()));
        assert_eq!(log[0].metadata["payment_id"], "pay_1");
    }

    #[tokio::test]
    async fn tampered_signature_leaves_intent_pending() {
        let (store, deposits) = controller();
        let wallet = store.create_wallet("owner").await.unwrap();
        let order = deposits.initiate_deposit(&wallet.id, dec!(500)).await.unwrap();
        let sig = signature::sign(SECRET, &[&order.order_id, "pay_1"]);

        let result = deposits.verify_deposit(&order.order_id, "pay_2", &sig).await;
        assert!(matches!(result, Err(LedgerError::PaymentVerification)));

        let intent = store
            .find_deposit_intent(&order.order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(intent.status, IntentStatus::Pending);
        let wallet = store.read_wallet(&wallet.id).await.unwrap();
        assert_eq!(wallet.total_balance, Decimal::ZERO);
        assert_eq!(wallet.version, 0);
    }

    #[tokio::test]
    async fn expired_intent_is_closed() {
        let (store, deposits) = controller_with("key_test", chrono::Duration::zero());
        let wallet = store.create_wallet("owner").await.unwrap();
        let order = deposits.initiate_deposit(&wallet.id, dec!(500)).await.unwrap();
        let sig = signature::sign(SECRET, &[&order.order_id, "pay_1"]);

        let result = deposits.verify_deposit(&order.order_id, "pay_1", &sig).await;
        assert!(matches!(result, Err(LedgerError::IntentExpired)));

        let intent = store
            .find_deposit_intent(&order.order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(intent.status, IntentStatus::Expired);

        let again = deposits.verify_deposit(&order.order_id, "pay_1", &sig).await;
        assert!(matches!(again, Err(LedgerError::IntentExpired)));
    }

    #[tokio::test]
    async fn unknown_order_is_rejected() {
        let (_, deposits) = controller();
        let result = deposits.verify_deposit("order_missing", "pay_1", "00").await;
        assert!(matches!(result, Err(LedgerError::UnknownIntent)));
    }

    #[tokio::test]
    async fn gateway_assigned_order_id_is_the_one_verified() {
        let (store, deposits) =
            controller_on(Arc::new(IssuingGateway), chrono::Duration::minutes(15));
        let wallet = store.create_wallet("owner").await.unwrap();

        let order = deposits.initiate_deposit(&wallet.id, dec!(750)).await.unwrap();
        assert!(order.order_id.starts_with("order_gw_"));
        assert_eq!(order.checkout_key, "key_live");

        let receipt = format!("order_{}", &order.order_id["order_gw_".len()..]);
        assert!(store.find_deposit_intent(&receipt).await.unwrap().is_none());

        let sig = signature::sign(SECRET, &[&order.order_id, "pay_9"]);
        let verified = deposits
            .verify_deposit(&order.order_id, "pay_9", &sig)
            .await
            .unwrap();
        assert!(verified.credited);
        assert_eq!(verified.wallet.total_balance, dec!(750));
    }
}
