use crate::errors::{LedgerError, LedgerResult};
use crate::models::{Transaction, TransactionKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ledger events published after a mutation commits
///
/// The ledger tables stay the source of truth; these are notifications for
/// downstream consumers (dashboards, the trading engine, reconciliation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum LedgerEvent {
    #[serde(rename = "DEPOSIT_CREDITED")]
    DepositCredited {
        wallet_id: String,
        order_id: String,
        amount: Decimal,
        balance_after: Decimal,
        transaction_id: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "WITHDRAWAL_REQUESTED")]
    WithdrawalRequested {
        wallet_id: String,
        request_id: String,
        amount: Decimal,
        reserved_balance: Decimal,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "WITHDRAWAL_COMPLETED")]
    WithdrawalCompleted {
        wallet_id: String,
        request_id: String,
        amount: Decimal,
        balance_after: Decimal,
        transaction_id: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "WITHDRAWAL_RELEASED")]
    WithdrawalReleased {
        wallet_id: String,
        request_id: String,
        amount: Decimal,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "WITHDRAWAL_REVERSED")]
    WithdrawalReversed {
        wallet_id: String,
        request_id: String,
        amount: Decimal,
        balance_after: Decimal,
        transaction_id: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "TRADE_SETTLED")]
    TradeSettled {
        wallet_id: String,
        kind: TransactionKind,
        amount: Decimal,
        balance_after: Decimal,
        external_ref: Option<String>,
        transaction_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl LedgerEvent {
    pub fn event_type(&self) -> &str {
        match self {
            LedgerEvent::DepositCredited { .. } => "DEPOSIT_CREDITED",
            LedgerEvent::WithdrawalRequested { .. } => "WITHDRAWAL_REQUESTED",
            LedgerEvent::WithdrawalCompleted { .. } => "WITHDRAWAL_COMPLETED",
            LedgerEvent::WithdrawalReleased { .. } => "WITHDRAWAL_RELEASED",
            LedgerEvent::WithdrawalReversed { .. } => "WITHDRAWAL_REVERSED",
            LedgerEvent::TradeSettled { .. } => "TRADE_SETTLED",
        }
    }

    /// Partition key - all events for one wallet stay ordered
    pub fn wallet_id(&self) -> &str {
        match self {
            LedgerEvent::DepositCredited { wallet_id, .. }
            | LedgerEvent::WithdrawalRequested { wallet_id, .. }
            | LedgerEvent::WithdrawalCompleted { wallet_id, .. }
            | LedgerEvent::WithdrawalReleased { wallet_id, .. }
            | LedgerEvent::WithdrawalReversed { wallet_id, .. }
            | LedgerEvent::TradeSettled { wallet_id, .. } => wallet_id,
        }
    }

    pub fn deposit_credited(order_id: &str, txn: &Transaction) -> Self {
        LedgerEvent::DepositCredited {
            wallet_id: txn.wallet_id.clone(),
            order_id: order_id.to_string(),
            amount: txn.amount,
            balance_after: txn.balance_after,
            transaction_id: txn.id.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn withdrawal_completed(request_id: &str, txn: &Transaction) -> Self {
        LedgerEvent::WithdrawalCompleted {
            wallet_id: txn.wallet_id.clone(),
            request_id: request_id.to_string(),
            amount: -txn.amount,
            balance_after: txn.balance_after,
            transaction_id: txn.id.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn withdrawal_reversed(request_id: &str, txn: &Transaction) -> Self {
        LedgerEvent::WithdrawalReversed {
            wallet_id: txn.wallet_id.clone(),
            request_id: request_id.to_string(),
            amount: txn.amount,
            balance_after: txn.balance_after,
            transaction_id: txn.id.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn trade_settled(txn: &Transaction) -> Self {
        LedgerEvent::TradeSettled {
            wallet_id: txn.wallet_id.clone(),
            kind: txn.kind,
            amount: txn.amount,
            balance_after: txn.balance_after,
            external_ref: txn.external_ref.clone(),
            transaction_id: txn.id.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: LedgerEvent) -> LedgerResult<()>;
}

/// Publish after commit. The mutation already happened, so a failed publish
/// is logged and swallowed rather than reported to the caller.
pub async fn publish_committed(publisher: &dyn EventPublisher, event: LedgerEvent) {
    let event_type = event.event_type().to_string();
    let wallet_id = event.wallet_id().to_string();
    if let Err(e) = publisher.publish(event).await {
        tracing::error!(
            error = %e,
            event_type = %event_type,
            wallet_id = %wallet_id,
            "Ledger event not published"
        );
    }
}

/// Used when no broker is configured: events only go to the log
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: LedgerEvent) -> LedgerResult<()> {
        tracing::debug!(
            event_type = event.event_type(),
            wallet_id = %event.wallet_id(),
            "Ledger event (no broker configured)"
        );
        Ok(())
    }
}

/// Kafka producer wrapper
pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
}

impl KafkaProducer {
    /// acks=all and idempotence on: a published ledger event is durable and
    /// never duplicated by producer retries.
    pub fn new(brokers: &str, topic: String) -> LedgerResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("compression.type", "snappy")
            .set("linger.ms", "10")
            .create()
            .map_err(|e| LedgerError::InternalError(format!("Failed to create producer: {}", e)))?;

        Ok(Self { producer, topic })
    }
}

#[async_trait]
impl EventPublisher for KafkaProducer {
    async fn publish(&self, event: LedgerEvent) -> LedgerResult<()> {
        let key = event.wallet_id().to_string();
        let payload = serde_json::to_string(&event).map_err(|e| {
            LedgerError::InternalError(format!("Failed to serialize event: {}", e))
        })?;

        tracing::info!(
            event_type = event.event_type(),
            wallet_id = %key,
            "Publishing event to Kafka"
        );

        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);

        match self.producer.send(record, Duration::from_secs(5)).await {
            Ok((partition, offset)) => {
                tracing::debug!(
                    partition = partition,
                    offset = offset,
                    "Event published successfully"
                );
                Ok(())
            }
            Err((e, _)) => Err(LedgerError::InternalError(format!(
                "Failed to publish event: {}",
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = LedgerEvent::WithdrawalReleased {
            wallet_id: "w1".to_string(),
            request_id: "r1".to_string(),
            amount: dec!(250),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["eventType"], "WITHDRAWAL_RELEASED");
        assert_eq!(value["amount"], "250");
        assert_eq!(event.wallet_id(), "w1");
    }
}
