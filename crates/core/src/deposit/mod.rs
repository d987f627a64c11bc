//! Wallet top-ups: deposit intents and payment webhook reconciliation.
//!
//! A deposit starts as a `Pending` [`DepositIntent`] carrying an idempotency
//! key (`content`) that the payer copies into the transfer memo. When the
//! provider reports the transfer, [`DepositReconciler::handle_webhook`] finds
//! the intent from that key and, in one unit of work, flips it to `Completed`
//! and credits the wallet. A webhook delivered any number of times credits
//! the wallet at most once: the status transition is conditional and the
//! ledger rejects a second entry for the same provider transaction id.

pub mod provider;

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::auth::{self, Action, Capabilities};
use crate::clock::Clock;
use crate::config::CommerceConfig;
use crate::error::{CommerceError, Result};
use crate::ledger::{self, Posting};
use crate::model::{
    round2, AccountId, DepositId, DepositIntent, DepositStatus, EntryKind, EntryRef,
};
use crate::notify::{self, Notification, NotificationKind, Notifier};
use crate::store::Store;

use self::provider::{DepositRequest, PaymentProvider};

// =============================================================================
// Webhook wire types
// =============================================================================

/// Payment notification pushed by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub data: WebhookData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookData {
    pub transaction_id: String,
    pub amount: Decimal,
    /// Free-text transfer memo, expected to contain the deposit key.
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum IgnoreReason {
    Malformed { detail: String },
    Unmatched { transaction_id: String },
    /// Above the configured deposit maximum; left pending for manual review.
    OverLimit {
        transaction_id: String,
        amount: Decimal,
    },
}

/// Outcome reported back to the provider. Every variant is a successful
/// acknowledgement; only store failures surface as errors so the provider
/// retries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookAck {
    Credited {
        deposit_id: DepositId,
        account_id: AccountId,
        amount: Decimal,
    },
    Duplicate {
        deposit_id: DepositId,
    },
    Ignored {
        #[serde(flatten)]
        reason: IgnoreReason,
    },
}

/// Candidate deposit keys in a transfer memo, in memo order: every token,
/// split on anything that is not ASCII alphanumeric, that starts with
/// `prefix` (case-insensitive) and is longer than it. Returned uppercase.
pub fn deposit_key_candidates(description: &str, prefix: &str) -> Vec<String> {
    let prefix = prefix.to_ascii_uppercase();
    description
        .split(|c: char| !c.is_ascii_alphanumeric())
        .map(str::to_ascii_uppercase)
        .filter(|token| token.len() > prefix.len() && token.starts_with(&prefix))
        .collect()
}

fn parse_payload(body: &[u8]) -> std::result::Result<WebhookData, String> {
    let payload: WebhookPayload = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    let mut data = payload.data;
    data.transaction_id = data.transaction_id.trim().to_string();
    if data.transaction_id.is_empty() {
        return Err("empty transaction_id".to_string());
    }
    data.amount = round2(data.amount);
    if data.amount <= Decimal::ZERO {
        return Err(format!("non-positive amount {}", data.amount));
    }
    Ok(data)
}

// =============================================================================
// DepositReconciler
// =============================================================================

pub struct DepositReconciler {
    store: Arc<Store>,
    provider: Arc<dyn PaymentProvider>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    min_deposit: Decimal,
    max_deposit: Option<Decimal>,
    key_prefix: String,
    receiving_account: String,
}

impl DepositReconciler {
    pub fn new(
        config: &CommerceConfig,
        store: Arc<Store>,
        provider: Arc<dyn PaymentProvider>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            provider,
            notifier,
            clock,
            min_deposit: config.min_deposit,
            max_deposit: config.max_deposit,
            key_prefix: config.deposit_key_prefix.clone(),
            receiving_account: config.provider.receiving_account.clone(),
        }
    }

    fn new_key(&self) -> String {
        format!("{}{}", self.key_prefix, Ulid::new())
    }

    /// Ask the provider for transfer instructions and record a pending intent.
    ///
    /// Nothing is persisted when the provider call fails.
    pub async fn create_deposit(&self, account_id: AccountId, amount: Decimal) -> Result<DepositIntent> {
        let amount = round2(amount);
        if amount < self.min_deposit {
            return Err(CommerceError::Validation(format!(
                "deposit amount {amount} is below the minimum of {}",
                self.min_deposit
            )));
        }
        if let Some(max) = self.max_deposit.filter(|max| amount > *max) {
            return Err(CommerceError::Validation(format!(
                "deposit amount {amount} exceeds the maximum of {max}"
            )));
        }
        if self.store.read(|q| q.account(account_id).is_none()) {
            return Err(CommerceError::not_found("account", account_id));
        }

        let content = self.new_key();
        let instructions = self
            .provider
            .create_deposit_request(DepositRequest {
                account_number: self.receiving_account.clone(),
                amount,
                content: content.clone(),
            })
            .await
            .map_err(|e| {
                tracing::error!(error = %e, %account_id, %amount, "payment provider rejected deposit request");
                CommerceError::from(e)
            })?;

        let intent = DepositIntent {
            id: DepositId::new(),
            account_id,
            amount,
            content,
            qr_code: instructions.qr_code,
            receiving_account: instructions.account_number,
            status: DepositStatus::Pending,
            provider_txn_id: None,
            credited_amount: None,
            created_at: self.clock.now(),
            completed_at: None,
        };
        self.store
            .unit_of_work(|tx| tx.insert_deposit(intent.clone()))?;

        tracing::info!(
            deposit_id = %intent.id,
            %account_id,
            %amount,
            content = %intent.content,
            "deposit intent created"
        );
        Ok(intent)
    }

    /// Reconcile one provider notification. See [`WebhookAck`].
    pub async fn handle_webhook(&self, body: &[u8]) -> Result<WebhookAck> {
        let data = match parse_payload(body) {
            Ok(data) => data,
            Err(detail) => {
                tracing::warn!(%detail, "ignoring malformed payment webhook");
                return Ok(WebhookAck::Ignored {
                    reason: IgnoreReason::Malformed { detail },
                });
            }
        };
        let txn = data.transaction_id.as_str();

        if let Some(max) = self.max_deposit.filter(|max| data.amount > *max) {
            tracing::error!(
                transaction_id = %txn,
                amount = %data.amount,
                %max,
                description = %data.description,
                "payment webhook above deposit maximum, needs manual review"
            );
            return Ok(WebhookAck::Ignored {
                reason: IgnoreReason::OverLimit {
                    transaction_id: txn.to_string(),
                    amount: data.amount,
                },
            });
        }

        // Memos may carry other prefixed words before the real key.
        let candidates = deposit_key_candidates(&data.description, &self.key_prefix);
        let intent = self.store.read(|q| {
            candidates
                .iter()
                .find_map(|key| q.deposit_by_content(key).cloned())
        });
        let Some(intent) = intent else {
            tracing::warn!(
                transaction_id = %txn,
                description = %data.description,
                "payment webhook matches no deposit intent"
            );
            return Ok(WebhookAck::Ignored {
                reason: IgnoreReason::Unmatched {
                    transaction_id: txn.to_string(),
                },
            });
        };

        let already_seen = self.store.read(|q| q.has_provider_txn(txn));
        if intent.status == DepositStatus::Completed || already_seen {
            tracing::info!(deposit_id = %intent.id, transaction_id = %txn, "duplicate payment webhook");
            return Ok(WebhookAck::Duplicate {
                deposit_id: intent.id,
            });
        }

        if data.amount != intent.amount {
            tracing::warn!(
                deposit_id = %intent.id,
                requested = %intent.amount,
                received = %data.amount,
                "deposit amount differs from request, crediting amount received"
            );
        }

        let now = self.clock.now();
        let credited = self.store.unit_of_work(|tx| -> Result<bool> {
            if tx.snapshot().has_provider_txn(txn) {
                return Ok(false);
            }
            if !tx.complete_deposit_if_pending(intent.id, txn, data.amount, now)? {
                return Ok(false);
            }
            let posting = Posting::new(intent.account_id, data.amount, EntryKind::Deposit)
                .reference(EntryRef::Deposit(intent.id))
                .provider_txn(txn)
                .memo(intent.content.clone());
            ledger::credit(tx, posting, now)?;
            Ok(true)
        });
        let credited = credited.map_err(|e| {
            tracing::error!(error = %e, deposit_id = %intent.id, transaction_id = %txn, "failed to apply deposit");
            e
        })?;

        if !credited {
            tracing::info!(deposit_id = %intent.id, transaction_id = %txn, "payment webhook lost race, already applied");
            return Ok(WebhookAck::Duplicate {
                deposit_id: intent.id,
            });
        }

        tracing::info!(
            deposit_id = %intent.id,
            account_id = %intent.account_id,
            amount = %data.amount,
            transaction_id = %txn,
            "deposit credited"
        );

        notify::send_best_effort(
            self.notifier.as_ref(),
            Notification {
                account_id: intent.account_id,
                title: "Deposit received".to_string(),
                body: format!("{} has been added to your wallet.", data.amount),
                kind: NotificationKind::Deposit,
                link: Some("/wallet".to_string()),
            },
        )
        .await;

        Ok(WebhookAck::Credited {
            deposit_id: intent.id,
            account_id: intent.account_id,
            amount: data.amount,
        })
    }

    /// Read a deposit intent on behalf of `actor`.
    pub fn deposit_status(&self, actor: AccountId, deposit_id: DepositId) -> Result<DepositIntent> {
        self.store.read(|q| -> Result<DepositIntent> {
            let account = q
                .account(actor)
                .ok_or_else(|| CommerceError::not_found("account", actor))?;
            let intent = q
                .deposit(deposit_id)
                .ok_or_else(|| CommerceError::not_found("deposit", deposit_id))?;
            auth::authorize(
                Action::ViewFinancials,
                Capabilities::new(account.role, intent.account_id == actor),
            )?;
            Ok(intent.clone())
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
