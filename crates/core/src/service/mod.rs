//! The public face of the commerce core.
//!
//! [`Commerce`] owns one instance of each component, all sharing the same
//! [`Store`] and collaborators, and is `Send + Sync` so a host can keep it in
//! an `Arc` and call it from any number of tasks.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::auth::{self, Action, Capabilities};
use crate::catalog::CourseDirectory;
use crate::clock::{Clock, SystemClock};
use crate::config::{CommerceConfig, ConfigError};
use crate::coupon::{CouponEngine, NewCoupon};
use crate::deposit::provider::{HttpPaymentProvider, PaymentProvider, ProviderError};
use crate::deposit::{DepositReconciler, WebhookAck};
use crate::enrollment::EnrollmentOrchestrator;
use crate::error::{CommerceError, Result};
use crate::ledger::{self, Posting};
use crate::model::{
    Account, AccountId, Coupon, CourseId, DepositId, DepositIntent, Enrollment, EntryKind,
    InstructorEarning, LedgerEntry, LessonId, Role,
};
use crate::notify::{Notifier, TracingNotifier};
use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::store::Store;

/// External systems the core talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn CourseDirectory>,
    pub provider: Arc<dyn PaymentProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// HTTP payment provider from `config`, log-only notifications and the
    /// system clock.
    pub fn from_config(
        config: &CommerceConfig,
        catalog: Arc<dyn CourseDirectory>,
    ) -> std::result::Result<Self, ProviderError> {
        Ok(Self {
            catalog,
            provider: Arc::new(HttpPaymentProvider::new(&config.provider)?),
            notifier: Arc::new(TracingNotifier),
            clock: Arc::new(SystemClock),
        })
    }
}

/// Result of a coupon dry run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CouponPreview {
    pub code: String,
    pub discount_percent: u8,
    pub original_price: Decimal,
    pub final_price: Decimal,
}

pub struct Commerce {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    catalog: Arc<dyn CourseDirectory>,
    coupons: CouponEngine,
    enrollments: EnrollmentOrchestrator,
    deposits: DepositReconciler,
    progress: ProgressTracker,
}

impl Commerce {
    pub fn new(
        config: CommerceConfig,
        store: Arc<Store>,
        collaborators: Collaborators,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let Collaborators {
            catalog,
            provider,
            notifier,
            clock,
        } = collaborators;

        tracing::info!(
            min_deposit = %config.min_deposit,
            instructor_share = %config.instructor_share,
            provider_configured = config.provider.is_configured(),
            "commerce core initialised"
        );

        Ok(Self {
            coupons: CouponEngine::new(store.clone(), catalog.clone(), clock.clone()),
            enrollments: EnrollmentOrchestrator::new(
                store.clone(),
                catalog.clone(),
                notifier.clone(),
                clock.clone(),
                config.instructor_share,
            ),
            deposits: DepositReconciler::new(
                &config,
                store.clone(),
                provider,
                notifier,
                clock.clone(),
            ),
            progress: ProgressTracker::new(store.clone(), catalog.clone(), clock.clone()),
            store,
            clock,
            catalog,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // =========================================================================
    // Accounts and wallets
    // =========================================================================

    pub fn register_account(&self, display_name: &str, role: Role) -> Result<Account> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(CommerceError::Validation("display name must not be empty".into()));
        }
        let account = Account::new(display_name, role, self.clock.now());
        self.store
            .unit_of_work(|tx| tx.insert_account(account.clone()))?;
        tracing::info!(account_id = %account.id, role = ?role, "account registered");
        Ok(account)
    }

    pub fn wallet_balance(&self, account_id: AccountId) -> Result<Decimal> {
        self.store.read(|q| ledger::balance(q, account_id))
    }

    /// Ledger lines of `account_id`, oldest first.
    pub fn ledger_entries(&self, actor: AccountId, account_id: AccountId) -> Result<Vec<LedgerEntry>> {
        self.store.read(|q| -> Result<Vec<LedgerEntry>> {
            let role = q
                .account(actor)
                .map(|a| a.role)
                .ok_or_else(|| CommerceError::not_found("account", actor))?;
            auth::authorize(
                Action::ViewFinancials,
                Capabilities::new(role, actor == account_id),
            )?;
            if q.account(account_id).is_none() {
                return Err(CommerceError::not_found("account", account_id));
            }
            Ok(ledger::entries(q, account_id))
        })
    }

    /// Manual correction by an administrator. Positive amounts credit,
    /// negative amounts debit and may not overdraw the wallet.
    pub fn adjust_wallet(
        &self,
        actor: AccountId,
        account_id: AccountId,
        amount: Decimal,
        memo: &str,
    ) -> Result<LedgerEntry> {
        let now = self.clock.now();
        let entry = self.store.unit_of_work(|tx| -> Result<LedgerEntry> {
            let role = tx
                .snapshot()
                .account(actor)
                .map(|a| a.role)
                .ok_or_else(|| CommerceError::not_found("account", actor))?;
            auth::authorize(Action::AdjustWallet, Capabilities::new(role, false))?;

            let posting = Posting::new(account_id, amount.abs(), EntryKind::Adjustment).memo(memo);
            if amount.is_sign_negative() {
                ledger::debit(tx, posting, now)
            } else {
                ledger::credit(tx, posting, now)
            }
        })?;
        tracing::info!(
            %actor,
            %account_id,
            amount = %entry.amount,
            "wallet adjusted"
        );
        Ok(entry)
    }

    pub fn instructor_earnings(
        &self,
        actor: AccountId,
        instructor: AccountId,
    ) -> Result<Vec<InstructorEarning>> {
        self.store.read(|q| -> Result<Vec<InstructorEarning>> {
            let role = q
                .account(actor)
                .map(|a| a.role)
                .ok_or_else(|| CommerceError::not_found("account", actor))?;
            auth::authorize(
                Action::ViewFinancials,
                Capabilities::new(role, actor == instructor),
            )?;
            Ok(q.earnings_for(instructor).into_iter().cloned().collect())
        })
    }

    // =========================================================================
    // Coupons
    // =========================================================================

    /// Validate `code` for a purchase without redeeming it.
    pub fn apply_coupon(
        &self,
        code: &str,
        course_id: CourseId,
        account_id: AccountId,
    ) -> Result<CouponPreview> {
        let quote = self.coupons.validate(code, course_id, account_id)?;
        let course = self
            .catalog
            .course(course_id)
            .ok_or_else(|| CommerceError::not_found("course", course_id))?;
        let final_price = if course.is_free() {
            Decimal::ZERO
        } else {
            quote.apply(course.price)
        };
        Ok(CouponPreview {
            code: quote.code,
            discount_percent: quote.discount_percent,
            original_price: course.price,
            final_price,
        })
    }

    pub fn create_coupon(&self, actor: AccountId, request: NewCoupon) -> Result<Coupon> {
        self.coupons.create(actor, request)
    }

    pub fn deactivate_coupon(&self, actor: AccountId, code: &str) -> Result<Coupon> {
        self.coupons.deactivate(actor, code)
    }

    // =========================================================================
    // Enrollment and progress
    // =========================================================================

    pub async fn enroll(
        &self,
        course_id: CourseId,
        account_id: AccountId,
        coupon_code: Option<&str>,
    ) -> Result<Enrollment> {
        self.enrollments
            .enroll(course_id, account_id, coupon_code)
            .await
            .inspect_err(|e| {
                tracing::info!(
                    %course_id,
                    %account_id,
                    kind = %e.kind(),
                    error = %e,
                    "enrollment rejected"
                );
            })
    }

    pub fn get_progress(&self, course_id: CourseId, account_id: AccountId) -> Result<ProgressSnapshot> {
        self.progress.get_progress(course_id, account_id)
    }

    pub fn recalc_progress(&self, account_id: AccountId, course_id: CourseId) -> Result<ProgressSnapshot> {
        self.progress.recalculate(account_id, course_id)
    }

    pub fn record_lesson_event(
        &self,
        account_id: AccountId,
        lesson_id: LessonId,
        completed: bool,
    ) -> Result<ProgressSnapshot> {
        self.progress
            .record_lesson_event(account_id, lesson_id, completed)
    }

    // =========================================================================
    // Deposits
    // =========================================================================

    pub async fn create_deposit(&self, account_id: AccountId, amount: Decimal) -> Result<DepositIntent> {
        self.deposits.create_deposit(account_id, amount).await
    }

    /// Entry point for the provider's payment webhook; takes the raw body.
    pub async fn handle_webhook(&self, body: &[u8]) -> Result<WebhookAck> {
        self.deposits.handle_webhook(body).await
    }

    pub fn deposit_status(&self, actor: AccountId, deposit_id: DepositId) -> Result<DepositIntent> {
        self.deposits.deposit_status(actor, deposit_id)
    }
}

#[cfg(test)]
mod tests;
