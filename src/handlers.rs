use crate::errors::LedgerResult;
use crate::ledger::LedgerAudit;
use crate::models::*;
use crate::service::Ledger;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
}

/// All routes, without middleware
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Wallets
        .route("/wallets", post(open_wallet))
        .route("/wallets/:wallet_id", get(get_wallet))
        .route("/users/:owner_id/wallet", get(get_owner_wallet))
        // Deposits
        .route("/wallets/:wallet_id/deposits", post(initiate_deposit))
        .route("/deposits/verify", post(verify_deposit))
        // Withdrawals
        .route(
            "/wallets/:wallet_id/withdrawals",
            post(request_withdrawal).get(list_withdrawals),
        )
        .route("/withdrawals/:request_id", get(get_withdrawal))
        .route("/payouts/callback", post(payout_callback))
        // Ledger
        .route("/wallets/:wallet_id/transactions", get(transaction_history))
        .route("/wallets/:wallet_id/trades", post(settle_trade))
        .route("/wallets/:wallet_id/stats", get(wallet_stats))
        .route("/wallets/:wallet_id/audit", get(audit_wallet))
        .with_state(state)
}

/// Get-or-create the wallet for an owner
pub async fn open_wallet(
    State(state): State<AppState>,
    Json(payload): Json<OpenWalletRequest>,
) -> LedgerResult<Json<ApiResponse<WalletResponse>>> {
    tracing::info!(owner_id = %payload.owner_id, "Opening wallet");

    let wallet = state.ledger.open_wallet(&payload.owner_id).await?;

    Ok(Json(ApiResponse::success(WalletResponse::from(wallet))))
}

pub async fn get_wallet(
    State(state): State<AppState>,
    Path(wallet_id): Path<String>,
) -> LedgerResult<Json<ApiResponse<WalletResponse>>> {
    tracing::debug!(wallet_id = %wallet_id, "Fetching wallet");

    let wallet = state.ledger.wallet(&wallet_id).await?;

    Ok(Json(ApiResponse::success(WalletResponse::from(wallet))))
}

pub async fn get_owner_wallet(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
) -> LedgerResult<Json<ApiResponse<WalletResponse>>> {
    let wallet = state.ledger.wallet_for_owner(&owner_id).await?;

    Ok(Json(ApiResponse::success(WalletResponse::from(wallet))))
}

/// Open a deposit intent. The client completes payment at the gateway and
/// comes back through `/deposits/verify`.
pub async fn initiate_deposit(
    State(state): State<AppState>,
    Path(wallet_id): Path<String>,
    Json(payload): Json<InitiateDepositRequest>,
) -> LedgerResult<Json<ApiResponse<DepositOrderResponse>>> {
    tracing::info!(
        wallet_id = %wallet_id,
        amount = %payload.amount,
        "Initiating deposit"
    );

    let order = state
        .ledger
        .deposits()
        .initiate_deposit(&wallet_id, payload.amount)
        .await?;

    Ok(Json(ApiResponse::success(order)))
}

pub async fn verify_deposit(
    State(state): State<AppState>,
    Json(payload): Json<VerifyDepositRequest>,
) -> LedgerResult<Json<ApiResponse<WalletResponse>>> {
    tracing::info!(order_id = %payload.order_id, "Verifying deposit");

    let verification = state
        .ledger
        .deposits()
        .verify_deposit(&payload.order_id, &payload.payment_id, &payload.signature)
        .await?;

    let message = if verification.credited {
        "Deposit credited"
    } else {
        "Deposit already credited"
    };
    Ok(Json(ApiResponse::with_message(
        WalletResponse::from(verification.wallet),
        message,
    )))
}

pub async fn request_withdrawal(
    State(state): State<AppState>,
    Path(wallet_id): Path<String>,
    Json(payload): Json<WithdrawRequest>,
) -> LedgerResult<(StatusCode, Json<ApiResponse<WithdrawalResponse>>)> {
    tracing::info!(
        wallet_id = %wallet_id,
        amount = %payload.amount,
        "Requesting withdrawal"
    );

    let request = state
        .ledger
        .withdrawals()
        .request_withdrawal(&wallet_id, payload.amount, payload.destination)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(WithdrawalResponse::from(&request))),
    ))
}

pub async fn list_withdrawals(
    State(state): State<AppState>,
    Path(wallet_id): Path<String>,
) -> LedgerResult<Json<ApiResponse<Vec<WithdrawalRequest>>>> {
    let requests = state.ledger.withdrawals().list_withdrawals(&wallet_id).await?;

    Ok(Json(ApiResponse::success(requests)))
}

pub async fn get_withdrawal(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> LedgerResult<Json<ApiResponse<WithdrawalRequest>>> {
    let request = state.ledger.withdrawals().get_withdrawal(&request_id).await?;

    Ok(Json(ApiResponse::success(request)))
}

/// Signed status webhook from the payout rail
pub async fn payout_callback(
    State(state): State<AppState>,
    Json(payload): Json<PayoutCallbackRequest>,
) -> LedgerResult<Json<ApiResponse<WithdrawalResponse>>> {
    tracing::info!(
        request_id = %payload.request_id,
        status = %payload.status,
        "Payout callback received"
    );

    let request = state
        .ledger
        .withdrawals()
        .handle_payout_callback(&payload.request_id, &payload.status, &payload.signature)
        .await?;

    Ok(Json(ApiResponse::success(WithdrawalResponse::from(&request))))
}

pub async fn transaction_history(
    State(state): State<AppState>,
    Path(wallet_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> LedgerResult<Json<ApiResponse<TransactionPage>>> {
    let page = state
        .ledger
        .history(&wallet_id, query.cursor, query.limit)
        .await?;

    Ok(Json(ApiResponse::success(page)))
}

/// Trade settlement from the matching engine
pub async fn settle_trade(
    State(state): State<AppState>,
    Path(wallet_id): Path<String>,
    Json(payload): Json<SettleTradeRequest>,
) -> LedgerResult<Json<ApiResponse<Transaction>>> {
    let txn = state
        .ledger
        .settle_trade(&wallet_id, payload.kind, payload.amount, &payload.external_ref)
        .await?;

    Ok(Json(ApiResponse::success(txn)))
}

pub async fn wallet_stats(
    State(state): State<AppState>,
    Path(wallet_id): Path<String>,
) -> LedgerResult<Json<ApiResponse<WalletStats>>> {
    let stats = state.ledger.wallet_stats(&wallet_id).await?;

    Ok(Json(ApiResponse::success(stats)))
}

pub async fn audit_wallet(
    State(state): State<AppState>,
    Path(wallet_id): Path<String>,
) -> LedgerResult<Json<ApiResponse<LedgerAudit>>> {
    let audit = state.ledger.audit_wallet(&wallet_id).await?;

    Ok(Json(ApiResponse::success(audit)))
}

/// Health check endpoint
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}
