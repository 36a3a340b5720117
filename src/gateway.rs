use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Gateway not configured")]
    NotConfigured,
    #[error("Network error: {0}")]
    Network(String),
    #[error("Order rejected: {0}")]
    Rejected(String),
}

/// Order created at the payment gateway for a deposit intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayOrder {
    /// Id the gateway assigned; the client pays against this and it comes
    /// back in the signed confirmation
    pub order_id: String,
    /// Public key the client-side checkout needs to open the order
    pub checkout_key: String,
}

/// External payment gateway (client-side checkout + signed confirmation)
#[async_trait]
pub trait PaymentGateway: Send + Sync + Debug {
    /// Register an order. `receipt` is our own reference for the intent and
    /// `amount_minor` is in the currency's smallest unit.
    async fn create_order(
        &self,
        receipt: &str,
        amount_minor: i64,
        currency: &str,
    ) -> Result<GatewayOrder, GatewayError>;
}

/// Gateway stand-in for development and tests: accepts every order under the
/// receipt id and hands back the configured key id. Verification still uses
/// the real HMAC scheme.
#[derive(Debug, Clone)]
pub struct SandboxGateway {
    key_id: String,
}

impl SandboxGateway {
    pub fn new(key_id: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
        }
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn create_order(
        &self,
        receipt: &str,
        amount_minor: i64,
        currency: &str,
    ) -> Result<GatewayOrder, GatewayError> {
        if self.key_id.is_empty() {
            return Err(GatewayError::NotConfigured);
        }
        tracing::debug!(
            order_id = %receipt,
            amount_minor = amount_minor,
            currency = %currency,
            "Sandbox gateway order created"
        );
        Ok(GatewayOrder {
            order_id: receipt.to_string(),
            checkout_key: self.key_id.clone(),
        })
    }
}

#[derive(Debug, Serialize)]
struct CreateOrderBody<'a> {
    amount: i64,
    currency: &'a str,
    receipt: &'a str,
    payment_capture: u8,
}

#[derive(Debug, Deserialize)]
struct OrderCreated {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Pull a readable reason out of a gateway error response
pub(crate) fn error_reason(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => format!(
            "{} {}: {}",
            status.as_u16(),
            envelope.error.code.unwrap_or_default(),
            envelope.error.description.unwrap_or_default()
        ),
        Err(_) => format!("{} {}", status.as_u16(), body.trim()),
    }
}

/// Orders API of a Razorpay-style gateway: `POST {base_url}/orders` with the
/// key id and secret as basic auth.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
}

impl HttpGateway {
    pub fn new(
        base_url: impl Into<String>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Result<Self, GatewayError> {
        let key_id = key_id.into();
        let key_secret = key_secret.into();
        if key_id.is_empty() || key_secret.is_empty() {
            return Err(GatewayError::NotConfigured);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key_id,
            key_secret,
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_order(
        &self,
        receipt: &str,
        amount_minor: i64,
        currency: &str,
    ) -> Result<GatewayOrder, GatewayError> {
        let response = self
            .client
            .post(format!("{}/orders", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&CreateOrderBody {
                amount: amount_minor,
                currency,
                receipt,
                payment_capture: 1,
            })
            .send()
            .await
            .map_err(|e| GatewayError::Network(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected(error_reason(status, &body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Network(error_reason(status, &body)));
        }

        let order: OrderCreated = response
            .json()
            .await
            .map_err(|e| GatewayError::Network(format!("Failed to parse response: {}", e)))?;

        tracing::debug!(
            receipt = %receipt,
            order_id = %order.id,
            amount_minor = amount_minor,
            "Gateway order created"
        );

        Ok(GatewayOrder {
            order_id: order.id,
            checkout_key: self.key_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::HeaderMap, routing::post, Json, Router};
    use serde_json::{json, Value};

    /// Serve `app` on an ephemeral port and return its base url
    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v1", addr)
    }

    async fn create_order(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        let authorized = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v.starts_with("Basic "));
        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": {"code": "BAD_REQUEST_ERROR", "description": "Authentication failed"}})),
            );
        }
        if body["amount"].as_i64().unwrap_or(0) < 100 {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": {"code": "BAD_REQUEST_ERROR", "description": "Order amount less than minimum"}})),
            );
        }
        (
            StatusCode::OK,
            Json(json!({
                "id": format!("order_gw_{}", body["receipt"].as_str().unwrap_or("")),
                "amount": body["amount"],
                "currency": body["currency"],
                "status": "created"
            })),
        )
    }

    #[tokio::test]
    async fn http_gateway_returns_the_gateway_order_id() {
        let base = serve(Router::new().route("/v1/orders", post(create_order))).await;
        let gateway = HttpGateway::new(base, "rzp_key", "rzp_secret").unwrap();

        let order = gateway.create_order("order_local", 50_000, "INR").await.unwrap();
        assert_eq!(order.order_id, "order_gw_order_local");
        assert_eq!(order.checkout_key, "rzp_key");
    }

    #[tokio::test]
    async fn client_errors_are_rejections() {
        let base = serve(Router::new().route("/v1/orders", post(create_order))).await;
        let gateway = HttpGateway::new(base, "rzp_key", "rzp_secret").unwrap();

        match gateway.create_order("order_local", 50, "INR").await {
            Err(GatewayError::Rejected(reason)) => {
                assert!(reason.contains("400"));
                assert!(reason.contains("less than minimum"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn server_errors_and_transport_failures_are_network_errors() {
        let base = serve(Router::new().route(
            "/v1/orders",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "upstream down") }),
        ))
        .await;
        let gateway = HttpGateway::new(base, "rzp_key", "rzp_secret").unwrap();
        assert!(matches!(
            gateway.create_order("order_local", 50_000, "INR").await,
            Err(GatewayError::Network(_))
        ));

        // Nothing listens on port 9 locally
        let unreachable = HttpGateway::new("http://127.0.0.1:9/v1", "k", "s").unwrap();
        assert!(matches!(
            unreachable.create_order("order_local", 50_000, "INR").await,
            Err(GatewayError::Network(_))
        ));
    }

    #[test]
    fn missing_credentials_are_not_configured() {
        assert!(matches!(
            HttpGateway::new("https://api.example.com/v1", "", "secret"),
            Err(GatewayError::NotConfigured)
        ));
    }
}
