//! Wallet ledger: append-only entries plus the cached balance on each account.
//!
//! `credit` and `debit` only run inside a [`Tx`], so the balance change and
//! the entry append always commit together. Amounts are always stored signed:
//! debits are negative, credits positive.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::{CommerceError, Result};
use crate::model::{AccountId, EntryId, EntryKind, EntryRef, LedgerEntry};
use crate::store::{Snapshot, Tx};

/// An unsigned movement to be posted against one account.
#[derive(Debug, Clone)]
pub struct Posting {
    pub account_id: AccountId,
    pub amount: Decimal,
    pub kind: EntryKind,
    pub reference: Option<EntryRef>,
    pub provider_txn_id: Option<String>,
    pub memo: Option<String>,
}

impl Posting {
    pub fn new(account_id: AccountId, amount: Decimal, kind: EntryKind) -> Self {
        Self {
            account_id,
            amount,
            kind,
            reference: None,
            provider_txn_id: None,
            memo: None,
        }
    }

    pub fn reference(mut self, reference: EntryRef) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn provider_txn(mut self, txn_id: impl Into<String>) -> Self {
        self.provider_txn_id = Some(txn_id.into());
        self
    }

    pub fn memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }
}

/// Append a positive entry and raise the cached balance.
pub fn credit(tx: &mut Tx<'_>, posting: Posting, now: DateTime<Utc>) -> Result<LedgerEntry> {
    post(tx, posting, Direction::Credit, now)
}

/// Append a negative entry and lower the cached balance.
///
/// Fails with `InsufficientFunds` before writing anything when the balance
/// would go negative.
pub fn debit(tx: &mut Tx<'_>, posting: Posting, now: DateTime<Utc>) -> Result<LedgerEntry> {
    post(tx, posting, Direction::Debit, now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Credit,
    Debit,
}

fn post(
    tx: &mut Tx<'_>,
    posting: Posting,
    direction: Direction,
    now: DateTime<Utc>,
) -> Result<LedgerEntry> {
    if posting.amount <= Decimal::ZERO {
        return Err(CommerceError::Validation(format!(
            "ledger amount must be positive, got {}",
            posting.amount
        )));
    }

    let balance = tx
        .snapshot()
        .account(posting.account_id)
        .map(|a| a.wallet_balance)
        .ok_or_else(|| CommerceError::not_found("account", posting.account_id))?;

    let signed = match direction {
        Direction::Credit => posting.amount,
        Direction::Debit => {
            if posting.amount > balance {
                return Err(CommerceError::InsufficientFunds {
                    required: posting.amount,
                    available: balance,
                });
            }
            -posting.amount
        }
    };

    let new_balance = balance.checked_add(signed).ok_or_else(|| {
        CommerceError::Validation(format!(
            "crediting {} would overflow the balance of account {}",
            posting.amount, posting.account_id
        ))
    })?;

    let entry = LedgerEntry {
        id: EntryId::new(),
        account_id: posting.account_id,
        amount: signed,
        kind: posting.kind,
        reference: posting.reference,
        provider_txn_id: posting.provider_txn_id,
        memo: posting.memo,
        created_at: now,
    };
    tx.append_entry(entry.clone())?;
    tx.account_mut(posting.account_id)?.wallet_balance = new_balance;

    tracing::debug!(
        account_id = %entry.account_id,
        amount = %entry.amount,
        kind = ?entry.kind,
        "ledger entry posted"
    );
    Ok(entry)
}

/// Cached balance, or `NotFound` for an unknown account.
pub fn balance(view: Snapshot<'_>, account: AccountId) -> Result<Decimal> {
    view.account(account)
        .map(|a| a.wallet_balance)
        .ok_or_else(|| CommerceError::not_found("account", account))
}

/// Entries of `account` in append order.
pub fn entries(view: Snapshot<'_>, account: AccountId) -> Vec<LedgerEntry> {
    view.entries_for(account).into_iter().cloned().collect()
}

pub fn ledger_sum(view: Snapshot<'_>, account: AccountId) -> Decimal {
    view.ledger_sum(account)
}

/// Whether the cached balance equals the ledger sum and is non-negative.
pub fn is_consistent(view: Snapshot<'_>, account: AccountId) -> bool {
    match view.account(account) {
        Some(a) => a.wallet_balance >= Decimal::ZERO && a.wallet_balance == view.ledger_sum(account),
        None => false,
    }
}

/// Like [`is_consistent`], but `NotFound` for an unknown account and a
/// logged error on drift.
pub fn verify_account(view: Snapshot<'_>, account: AccountId) -> Result<bool> {
    let cached = balance(view, account)?;
    let consistent = is_consistent(view, account);
    if !consistent {
        tracing::error!(
            %account,
            %cached,
            ledger_sum = %view.ledger_sum(account),
            "wallet balance drifted from ledger"
        );
    }
    Ok(consistent)
}

// =============================================================================
// Tests
// =============================================================================
