use crate::gateway::error_reason;
use crate::models::PayoutDestination;
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayoutError {
    #[error("Network error: {0}")]
    Network(String),
    /// The rail refused the request outright; nothing was paid
    #[error("Payout rejected: {0}")]
    Rejected(String),
}

/// What the rail said when the payout was submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutOutcome {
    /// Queued; the result arrives later through a callback
    Accepted,
    /// Paid out synchronously
    Settled,
    /// Definitively refused; nothing was paid
    Rejected,
}

impl PayoutOutcome {
    /// Map a rail-reported payout status
    pub fn from_rail_status(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "processed" => PayoutOutcome::Settled,
            "rejected" | "failed" | "cancelled" | "reversed" => PayoutOutcome::Rejected,
            _ => PayoutOutcome::Accepted,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PayoutReceipt {
    pub payout_ref: String,
    pub outcome: PayoutOutcome,
}

/// External payout rail (UPI / bank transfer)
#[async_trait]
pub trait PayoutRail: Send + Sync + Debug {
    /// Submit a payout. Must be idempotent on `request_id`.
    async fn submit(
        &self,
        request_id: &str,
        destination: &PayoutDestination,
        amount: Decimal,
    ) -> Result<PayoutReceipt, PayoutError>;
}

/// Rail stand-in: accepts every payout and waits for a callback
#[derive(Debug, Default, Clone)]
pub struct SandboxPayoutRail;

#[async_trait]
impl PayoutRail for SandboxPayoutRail {
    async fn submit(
        &self,
        request_id: &str,
        _destination: &PayoutDestination,
        amount: Decimal,
    ) -> Result<PayoutReceipt, PayoutError> {
        tracing::debug!(
            request_id = %request_id,
            amount = %amount,
            "Sandbox payout accepted"
        );
        Ok(PayoutReceipt {
            payout_ref: format!("payout_{}", uuid::Uuid::new_v4().simple()),
            outcome: PayoutOutcome::Accepted,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpPayoutConfig {
    pub base_url: String,
    pub key_id: String,
    pub key_secret: String,
    /// Business account the payouts are drawn from
    pub source_account: String,
    pub currency: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "account_type", rename_all = "snake_case")]
enum FundAccount<'a> {
    Vpa { vpa: VpaAccount<'a> },
    BankAccount { bank_account: BankAccount<'a> },
}

#[derive(Debug, Serialize)]
struct VpaAccount<'a> {
    address: &'a str,
}

#[derive(Debug, Serialize)]
struct BankAccount<'a> {
    account_number: &'a str,
    ifsc: &'a str,
}

#[derive(Debug, Serialize)]
struct CreatePayoutBody<'a> {
    account_number: &'a str,
    amount: i64,
    currency: &'a str,
    mode: &'static str,
    purpose: &'static str,
    reference_id: &'a str,
    queue_if_low_balance: bool,
    fund_account: FundAccount<'a>,
}

#[derive(Debug, Deserialize)]
struct PayoutCreated {
    id: String,
    status: String,
}

/// Payouts API of a Razorpay-style rail: `POST {base_url}/payouts`, basic
/// auth, and the request id as both `reference_id` and idempotency key.
#[derive(Debug, Clone)]
pub struct HttpPayoutRail {
    client: reqwest::Client,
    config: HttpPayoutConfig,
}

impl HttpPayoutRail {
    pub fn new(mut config: HttpPayoutConfig) -> Result<Self, PayoutError> {
        if config.key_id.is_empty() || config.key_secret.is_empty() {
            return Err(PayoutError::Rejected("payout credentials not configured".to_string()));
        }
        if config.source_account.is_empty() {
            return Err(PayoutError::Rejected("payout source account not configured".to_string()));
        }
        config.base_url = config.base_url.trim_end_matches('/').to_string();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| PayoutError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl PayoutRail for HttpPayoutRail {
    async fn submit(
        &self,
        request_id: &str,
        destination: &PayoutDestination,
        amount: Decimal,
    ) -> Result<PayoutReceipt, PayoutError> {
        let amount_minor = (amount * Decimal::ONE_HUNDRED)
            .to_i64()
            .ok_or_else(|| PayoutError::Rejected(format!("amount {} out of range", amount)))?;

        let (mode, fund_account) = match destination {
            PayoutDestination::Upi { vpa } => (
                "UPI",
                FundAccount::Vpa {
                    vpa: VpaAccount { address: vpa.trim() },
                },
            ),
            PayoutDestination::BankAccount {
                account_number,
                ifsc,
            } => (
                "IMPS",
                FundAccount::BankAccount {
                    bank_account: BankAccount {
                        account_number: account_number.trim(),
                        ifsc: ifsc.trim(),
                    },
                },
            ),
        };

        let response = self
            .client
            .post(format!("{}/payouts", self.config.base_url))
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .header("X-Payout-Idempotency", request_id)
            .json(&CreatePayoutBody {
                account_number: &self.config.source_account,
                amount: amount_minor,
                currency: &self.config.currency,
                mode,
                purpose: "payout",
                reference_id: request_id,
                queue_if_low_balance: true,
                fund_account,
            })
            .send()
            .await
            .map_err(|e| PayoutError::Network(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(PayoutError::Rejected(error_reason(status, &body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PayoutError::Network(error_reason(status, &body)));
        }

        let payout: PayoutCreated = response
            .json()
            .await
            .map_err(|e| PayoutError::Network(format!("Failed to parse response: {}", e)))?;

        Ok(PayoutReceipt {
            outcome: PayoutOutcome::from_rail_status(&payout.status),
            payout_ref: payout.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::HeaderMap, http::StatusCode, routing::post, Json, Router};
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v1", addr)
    }

    fn rail(base_url: String) -> HttpPayoutRail {
        HttpPayoutRail::new(HttpPayoutConfig {
            base_url,
            key_id: "rzp_key".to_string(),
            key_secret: "rzp_secret".to_string(),
            source_account: "7878780080316316".to_string(),
            currency: "INR".to_string(),
        })
        .unwrap()
    }

    async fn create_payout(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        let idempotency = headers
            .get("x-payout-idempotency")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if idempotency != body["reference_id"].as_str().unwrap_or_default() {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": {"description": "idempotency key mismatch"}})));
        }
        let status = match body["fund_account"]["account_type"].as_str() {
            Some("vpa") => "processed",
            Some("bank_account") if body["fund_account"]["bank_account"]["ifsc"] == "FAIL0000000" => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": {"code": "BAD_REQUEST_ERROR", "description": "Invalid IFSC"}})),
                )
            }
            _ => "queued",
        };
        (
            StatusCode::OK,
            Json(json!({
                "id": format!("pout_{}", body["amount"]),
                "status": status,
                "mode": body["mode"],
            })),
        )
    }

    #[tokio::test]
    async fn upi_payout_processed_synchronously_is_settled() {
        let rail = rail(serve(Router::new().route("/v1/payouts", post(create_payout))).await);

        let receipt = rail
            .submit(
                "req-1",
                &PayoutDestination::Upi {
                    vpa: "user@okbank".to_string(),
                },
                dec!(250.50),
            )
            .await
            .unwrap();
        assert_eq!(receipt.payout_ref, "pout_25050");
        assert_eq!(receipt.outcome, PayoutOutcome::Settled);
    }

    #[tokio::test]
    async fn queued_bank_payout_is_accepted_and_bad_ifsc_rejected() {
        let rail = rail(serve(Router::new().route("/v1/payouts", post(create_payout))).await);

        let queued = rail
            .submit(
                "req-2",
                &PayoutDestination::BankAccount {
                    account_number: "001122334455".to_string(),
                    ifsc: "HDFC0001234".to_string(),
                },
                dec!(1000),
            )
            .await
            .unwrap();
        assert_eq!(queued.outcome, PayoutOutcome::Accepted);

        let refused = rail
            .submit(
                "req-3",
                &PayoutDestination::BankAccount {
                    account_number: "001122334455".to_string(),
                    ifsc: "FAIL0000000".to_string(),
                },
                dec!(1000),
            )
            .await;
        assert!(matches!(refused, Err(PayoutError::Rejected(reason)) if reason.contains("Invalid IFSC")));
    }

    #[tokio::test]
    async fn server_errors_leave_the_outcome_unknown() {
        let base = serve(Router::new().route(
            "/v1/payouts",
            post(|| async { (StatusCode::BAD_GATEWAY, "bank timeout") }),
        ))
        .await;

        let result = rail(base)
            .submit(
                "req-4",
                &PayoutDestination::Upi {
                    vpa: "user@okbank".to_string(),
                },
                dec!(100),
            )
            .await;
        assert!(matches!(result, Err(PayoutError::Network(_))));
    }

    #[test]
    fn rail_statuses_map_to_outcomes() {
        assert_eq!(PayoutOutcome::from_rail_status("processed"), PayoutOutcome::Settled);
        assert_eq!(PayoutOutcome::from_rail_status("Rejected"), PayoutOutcome::Rejected);
        assert_eq!(PayoutOutcome::from_rail_status("processing"), PayoutOutcome::Accepted);
        assert_eq!(PayoutOutcome::from_rail_status("queued"), PayoutOutcome::Accepted);
    }
}
