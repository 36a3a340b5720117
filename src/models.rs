use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::str::FromStr;

/// Wallet - the cached balance row for one owner
///
/// - `total_balance` always equals the sum of the wallet's transaction amounts
/// - `reserved_balance` is held for in-flight withdrawals, `0 <= reserved <= total`
/// - `version` increments on every committed mutation (optimistic locking)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Wallet {
    pub id: String,
    pub owner_id: String,
    pub total_balance: Decimal,
    pub reserved_balance: Decimal,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Funds that can be withdrawn or spent. Derived, never stored.
    pub fn available_balance(&self) -> Decimal {
        self.total_balance - self.reserved_balance
    }
}

/// Ledger transaction - append-only, immutable once committed
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub wallet_id: String,
    pub seq: i64,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub external_ref: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    TradeDebit,
    TradeCredit,
    Fee,
    WithdrawalReversal,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdrawal => "withdrawal",
            TransactionKind::TradeDebit => "trade_debit",
            TransactionKind::TradeCredit => "trade_credit",
            TransactionKind::Fee => "fee",
            TransactionKind::WithdrawalReversal => "withdrawal_reversal",
        }
    }

    /// Kinds the trading engine may settle directly
    pub fn is_trade_settlement(&self) -> bool {
        matches!(
            self,
            TransactionKind::TradeDebit | TransactionKind::TradeCredit | TransactionKind::Fee
        )
    }

    /// Whether a transaction of this kind increases `total_balance`
    pub fn is_credit(&self) -> bool {
        matches!(
            self,
            TransactionKind::Deposit
                | TransactionKind::TradeCredit
                | TransactionKind::WithdrawalReversal
        )
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TransactionKind::Deposit),
            "withdrawal" => Ok(TransactionKind::Withdrawal),
            "trade_debit" => Ok(TransactionKind::TradeDebit),
            "trade_credit" => Ok(TransactionKind::TradeCredit),
            "fee" => Ok(TransactionKind::Fee),
            "withdrawal_reversal" => Ok(TransactionKind::WithdrawalReversal),
            _ => Err(format!("Unknown transaction kind: {}", s)),
        }
    }
}

/// Input to `LedgerStore::append_transaction`
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub wallet_id: String,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub external_ref: Option<String>,
    pub metadata: serde_json::Value,
}

/// Deposit intent - a pending deposit awaiting gateway confirmation
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DepositIntent {
    pub id: String,
    pub wallet_id: String,
    pub requested_amount: Decimal,
    pub gateway_order_id: String,
    pub status: IntentStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    Verified,
    Failed,
    Expired,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Verified => "verified",
            IntentStatus::Failed => "failed",
            IntentStatus::Expired => "expired",
        }
    }
}

impl FromStr for IntentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(IntentStatus::Pending),
            "verified" => Ok(IntentStatus::Verified),
            "failed" => Ok(IntentStatus::Failed),
            "expired" => Ok(IntentStatus::Expired),
            _ => Err(format!("Unknown intent status: {}", s)),
        }
    }
}

/// Withdrawal request - funds reserved until the payout rail settles
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: String,
    pub wallet_id: String,
    pub amount: Decimal,
    pub destination: Json<PayoutDestination>,
    pub status: WithdrawalStatus,
    pub payout_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Reversed,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Processing => "processing",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Failed => "failed",
            WithdrawalStatus::Reversed => "reversed",
        }
    }
}

impl FromStr for WithdrawalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WithdrawalStatus::Pending),
            "processing" => Ok(WithdrawalStatus::Processing),
            "completed" => Ok(WithdrawalStatus::Completed),
            "failed" => Ok(WithdrawalStatus::Failed),
            "reversed" => Ok(WithdrawalStatus::Reversed),
            _ => Err(format!("Unknown withdrawal status: {}", s)),
        }
    }
}

/// Store a string-valued enum in a VARCHAR column via `as_str`/`FromStr`
macro_rules! varchar_column {
    ($ty:ty) => {
        impl sqlx::Type<sqlx::Postgres> for $ty {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <String as sqlx::Type<sqlx::Postgres>>::type_info()
            }

            fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
                <String as sqlx::Type<sqlx::Postgres>>::compatible(ty)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $ty {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let raw = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
                Ok(raw.parse::<$ty>()?)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Postgres> for $ty {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> sqlx::encode::IsNull {
                <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
            }
        }
    };
}

varchar_column!(TransactionKind);
varchar_column!(IntentStatus);
varchar_column!(WithdrawalStatus);

/// Where a withdrawal is paid out to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayoutDestination {
    Upi {
        vpa: String,
    },
    BankAccount {
        account_number: String,
        ifsc: String,
    },
}

impl PayoutDestination {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            PayoutDestination::Upi { vpa } => {
                let vpa = vpa.trim();
                match vpa.split_once('@') {
                    Some((name, handle)) if !name.is_empty() && !handle.is_empty() => Ok(()),
                    _ => Err("UPI id must look like name@bank".to_string()),
                }
            }
            PayoutDestination::BankAccount {
                account_number,
                ifsc,
            } => {
                if account_number.trim().is_empty() || ifsc.trim().is_empty() {
                    Err("Bank account number and IFSC are required".to_string())
                } else {
                    Ok(())
                }
            }
        }
    }
}

// === API Request/Response Models ===

#[derive(Debug, Deserialize)]
pub struct OpenWalletRequest {
    pub owner_id: String,
}

#[derive(Debug, Deserialize)]
pub struct InitiateDepositRequest {
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct VerifyDepositRequest {
    pub order_id: String,
    pub payment_id: String,
    pub signature: String,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawRequest {
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub destination: PayoutDestination,
}

#[derive(Debug, Deserialize)]
pub struct PayoutCallbackRequest {
    pub request_id: String,
    pub status: String,
    pub signature: String,
}

#[derive(Debug, Deserialize)]
pub struct SettleTradeRequest {
    pub kind: TransactionKind,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub external_ref: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub cursor: Option<i64>,
    pub limit: Option<i64>,
}

/// Generic API response
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletResponse {
    pub id: String,
    pub owner_id: String,
    pub total_balance: Decimal,
    pub reserved_balance: Decimal,
    pub available_balance: Decimal,
    pub version: i64,
}

impl From<Wallet> for WalletResponse {
    fn from(wallet: Wallet) -> Self {
        Self {
            available_balance: wallet.available_balance(),
            id: wallet.id,
            owner_id: wallet.owner_id,
            total_balance: wallet.total_balance,
            reserved_balance: wallet.reserved_balance,
            version: wallet.version,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DepositOrderResponse {
    pub order_id: String,
    pub checkout_key: String,
    pub amount: Decimal,
    pub currency: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawalResponse {
    pub request_id: String,
    pub status: WithdrawalStatus,
}

impl From<&WithdrawalRequest> for WithdrawalResponse {
    fn from(request: &WithdrawalRequest) -> Self {
        Self {
            request_id: request.id.clone(),
            status: request.status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionPage {
    pub transactions: Vec<Transaction>,
    pub next_cursor: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletStats {
    pub total_deposits: Decimal,
    pub total_withdrawals: Decimal,
    pub total_fees: Decimal,
    pub trade_count: usize,
    pub total_balance: Decimal,
    pub reserved_balance: Decimal,
    pub available_balance: Decimal,
}
