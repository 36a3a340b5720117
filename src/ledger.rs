//! Balance arithmetic shared by every store implementation.
//!
//! A store reads the wallet, calls [`apply_entry`] to get the post-mutation
//! balances, and commits those together with the transaction row. Keeping the
//! rules in one pure function means the Postgres and in-memory stores cannot
//! disagree about what a given kind does to a wallet.

use crate::errors::{LedgerError, LedgerResult};
use crate::models::{Transaction, TransactionKind, Wallet};
use rust_decimal::Decimal;
use serde::Serialize;

/// Balances after applying one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceChange {
    pub total_balance: Decimal,
    pub reserved_balance: Decimal,
}

/// Compute the effect of appending `amount` of `kind` to `wallet`.
///
/// Credits must be positive and debits negative. A `withdrawal` settles a
/// reservation, so it consumes reserved funds instead of available ones.
pub fn apply_entry(
    wallet: &Wallet,
    kind: TransactionKind,
    amount: Decimal,
) -> LedgerResult<BalanceChange> {
    if amount.is_zero() {
        return Err(LedgerError::InvalidAmount(
            "Amount must be non-zero".to_string(),
        ));
    }
    if kind.is_credit() && amount.is_sign_negative() {
        return Err(LedgerError::InvalidAmount(format!(
            "{} amount must be positive",
            kind
        )));
    }
    if !kind.is_credit() && amount.is_sign_positive() {
        return Err(LedgerError::InvalidAmount(format!(
            "{} amount must be negative",
            kind
        )));
    }

    let total = wallet.total_balance + amount;
    let reserved = match kind {
        TransactionKind::Withdrawal => {
            let debit = -amount;
            if wallet.reserved_balance < debit {
                return Err(LedgerError::InvalidState(format!(
                    "withdrawal of {} exceeds reserved balance {}",
                    debit, wallet.reserved_balance
                )));
            }
            wallet.reserved_balance - debit
        }
        _ => {
            if amount.is_sign_negative() && wallet.available_balance() + amount < Decimal::ZERO {
                return Err(LedgerError::InsufficientBalance {
                    required: -amount,
                    available: wallet.available_balance(),
                });
            }
            wallet.reserved_balance
        }
    };

    Ok(BalanceChange {
        total_balance: total,
        reserved_balance: reserved,
    })
}

/// Reserve `amount` for a withdrawal. Total is untouched.
pub fn apply_reservation(wallet: &Wallet, amount: Decimal) -> LedgerResult<BalanceChange> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(
            "Withdrawal amount must be positive".to_string(),
        ));
    }
    let available = wallet.available_balance();
    if available < amount {
        return Err(LedgerError::InsufficientBalance {
            required: amount,
            available,
        });
    }
    Ok(BalanceChange {
        total_balance: wallet.total_balance,
        reserved_balance: wallet.reserved_balance + amount,
    })
}

/// Release a reservation without touching total.
pub fn apply_release(wallet: &Wallet, amount: Decimal) -> LedgerResult<BalanceChange> {
    if wallet.reserved_balance < amount {
        return Err(LedgerError::InvalidState(format!(
            "release of {} exceeds reserved balance {}",
            amount, wallet.reserved_balance
        )));
    }
    Ok(BalanceChange {
        total_balance: wallet.total_balance,
        reserved_balance: wallet.reserved_balance - amount,
    })
}

/// Result of replaying a wallet's transaction log
#[derive(Debug, Clone, Serialize)]
pub struct LedgerAudit {
    pub wallet_id: String,
    pub transaction_count: usize,
    pub replayed_total: Decimal,
    pub recorded_total: Decimal,
    /// First transaction whose `balance_after` disagrees with the running sum
    pub first_mismatch: Option<String>,
    pub consistent: bool,
}

/// Replay `transactions` (oldest first) and compare against `wallet`.
pub fn replay(wallet: &Wallet, transactions: &[Transaction]) -> LedgerAudit {
    let mut running = Decimal::ZERO;
    let mut first_mismatch = None;
    let mut last_seq = i64::MIN;

    for txn in transactions {
        running += txn.amount;
        let out_of_order = txn.seq <= last_seq;
        last_seq = txn.seq;
        if first_mismatch.is_none() && (running != txn.balance_after || out_of_order) {
            first_mismatch = Some(txn.id.clone());
        }
    }

    let consistent = first_mismatch.is_none()
        && running == wallet.total_balance
        && wallet.reserved_balance >= Decimal::ZERO
        && wallet.reserved_balance <= wallet.total_balance;

    LedgerAudit {
        wallet_id: wallet.id.clone(),
        transaction_count: transactions.len(),
        replayed_total: running,
        recorded_total: wallet.total_balance,
        first_mismatch,
        consistent,
    }
}
