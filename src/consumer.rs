use crate::errors::{LedgerError, LedgerResult};
use crate::service::Ledger;
use crate::withdrawal::PayoutStatus;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use serde::Deserialize;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Payout confirmation published by the payout rail integration
#[derive(Debug, Clone, Deserialize)]
pub struct PayoutEvent {
    pub request_id: String,
    pub status: String,
    #[serde(default)]
    pub payout_ref: Option<String>,
}

/// How a payout event was disposed of. Either way its offset may be
/// committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    Applied,
    /// Malformed or not applicable; retrying cannot change the result
    Skipped,
}

/// Applies payout events to the ledger, retrying transient failures until
/// they go through.
pub struct PayoutEventHandler {
    ledger: Arc<Ledger>,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl PayoutEventHandler {
    pub fn new(ledger: Arc<Ledger>, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            ledger,
            base_backoff,
            max_backoff,
        }
    }

    /// Returns only once the event is applied or known to be inapplicable
    pub async fn handle(&self, payload: &[u8]) -> EventDisposition {
        let event: PayoutEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                // Poison message: skip it rather than block the partition
                tracing::warn!(
                    error = %e,
                    payload = ?String::from_utf8_lossy(payload),
                    "Failed to deserialize payout event"
                );
                return EventDisposition::Skipped;
            }
        };

        tracing::info!(
            request_id = %event.request_id,
            status = %event.status,
            payout_ref = ?event.payout_ref,
            "Processing payout event"
        );

        let status = match PayoutStatus::parse(&event.status) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(error = %e, request_id = %event.request_id, "Payout event rejected");
                return EventDisposition::Skipped;
            }
        };

        let mut backoff = self.base_backoff;
        let mut attempt = 1u32;
        loop {
            match self
                .ledger
                .withdrawals()
                .apply_payout_status(&event.request_id, status)
                .await
            {
                Ok(request) => {
                    tracing::debug!(
                        request_id = %request.id,
                        status = request.status.as_str(),
                        "Payout event applied"
                    );
                    return EventDisposition::Applied;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        error = %e,
                        request_id = %event.request_id,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Payout event failed, retrying"
                    );
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(self.max_backoff);
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        request_id = %event.request_id,
                        "Payout event rejected"
                    );
                    return EventDisposition::Skipped;
                }
            }
        }
    }
}

/// Consumes the payout-events topic and settles or fails withdrawals.
///
/// Offsets are committed only after an event has been handled, so a crash
/// mid-retry redelivers it. Handlers are idempotent, so redelivery is
/// harmless.
pub struct PayoutEventConsumer {
    consumer: StreamConsumer,
    handler: PayoutEventHandler,
}

impl PayoutEventConsumer {
    pub fn new(
        brokers: &str,
        group_id: &str,
        topic: &str,
        ledger: Arc<Ledger>,
    ) -> LedgerResult<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", "30000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| LedgerError::InternalError(format!("Failed to create consumer: {}", e)))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| LedgerError::InternalError(format!("Failed to subscribe: {}", e)))?;

        Ok(Self {
            consumer,
            handler: PayoutEventHandler::new(
                ledger,
                Duration::from_millis(100),
                Duration::from_secs(30),
            ),
        })
    }

    /// Runs until the task is dropped
    pub async fn start(self) -> LedgerResult<()> {
        tracing::info!("Starting payout event consumer...");

        loop {
            match self.consumer.recv().await {
                Ok(message) => {
                    if let Some(payload) = message.payload() {
                        self.handler.handle(payload).await;
                    }
                    if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                        tracing::error!(
                            error = %e,
                            partition = message.partition(),
                            offset = message.offset(),
                            "Failed to commit payout event offset"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Kafka error");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}
