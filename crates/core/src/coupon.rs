//! Coupon validation, redemption and administration.
//!
//! [`check`] is the read-only rule set shared by price previews and
//! purchases. [`redeem`] re-applies the usage rules inside the unit of
//! work, so the last remaining use can only be consumed by one
//! purchase; the loser's whole unit rolls back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::auth::{self, Action, Capabilities};
use crate::catalog::CourseDirectory;
use crate::clock::Clock;
use crate::error::{CommerceError, CouponError, Result};
use crate::model::{
    round2, AccountId, Coupon, CouponId, CouponRedemption, CouponScope, Course, CourseId,
};
use crate::store::{Snapshot, Store, StoreError, Tx};

/// Maximum coupon code length.
pub const MAX_CODE_LEN: usize = 32;

/// Outcome of a successful validation.
#[derive(Debug, Clone, PartialEq)]
pub struct CouponQuote {
    pub coupon_id: CouponId,
    pub code: String,
    pub discount_percent: u8,
}

impl CouponQuote {
    pub fn discount_fraction(&self) -> Decimal {
        Decimal::from(self.discount_percent) / Decimal::ONE_HUNDRED
    }

    /// `price * (1 - fraction)`, rounded to two places and never negative.
    pub fn apply(&self, price: Decimal) -> Decimal {
        round2(price * (Decimal::ONE - self.discount_fraction())).max(Decimal::ZERO)
    }
}

/// Request to create a coupon.
#[derive(Debug, Clone)]
pub struct NewCoupon {
    pub code: String,
    pub discount_percent: u8,
    pub max_usage: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: CouponScope,
}

/// Normalize a user-typed coupon code.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Apply every validation rule, in order: existence, active, expiry, scope,
/// usage limit, prior redemption by `account`.
pub fn check(
    view: Snapshot<'_>,
    code: &str,
    course: &Course,
    account: AccountId,
    now: DateTime<Utc>,
) -> Result<CouponQuote, CouponError> {
    let code = normalize_code(code);
    let Some(coupon) = view.coupon_by_code(&code) else {
        return Err(CouponError::NotFound { code });
    };
    if !coupon.active {
        return Err(CouponError::Inactive { code });
    }
    if coupon.is_expired(now) {
        return Err(CouponError::Expired { code });
    }
    if !coupon.scope.covers(course) {
        return Err(CouponError::ScopeMismatch { code });
    }
    if coupon.is_exhausted() {
        return Err(CouponError::LimitReached { code });
    }
    if view.redemption(coupon.id, account).is_some() {
        return Err(CouponError::AlreadyRedeemed { code });
    }
    Ok(CouponQuote {
        coupon_id: coupon.id,
        code,
        discount_percent: coupon.discount_percent,
    })
}

/// Consume one use of `coupon_id` for `account` inside the purchase unit.
///
/// The coupon is re-read inside the unit, so a use taken by a concurrent
/// purchase that committed first is seen here.
pub fn redeem(
    tx: &mut Tx<'_>,
    coupon_id: CouponId,
    account: AccountId,
    now: DateTime<Utc>,
) -> Result<()> {
    let coupon = tx.coupon_mut(coupon_id)?;
    let code = coupon.code.clone();
    if !coupon.active {
        return Err(CouponError::Inactive { code }.into());
    }
    if coupon.is_expired(now) {
        return Err(CouponError::Expired { code }.into());
    }
    if coupon.is_exhausted() {
        return Err(CouponError::LimitReached { code }.into());
    }
    coupon.used_count += 1;

    tx.insert_redemption(CouponRedemption {
        coupon_id,
        account_id: account,
        redeemed_at: now,
    })
    .map_err(|e| match e {
        StoreError::UniqueViolation { .. } => CommerceError::from(CouponError::AlreadyRedeemed { code }),
        other => other.into(),
    })?;
    Ok(())
}

// =============================================================================
// CouponEngine
// =============================================================================

/// Coupon operations bound to their collaborators.
pub struct CouponEngine {
    store: Arc<Store>,
    catalog: Arc<dyn CourseDirectory>,
    clock: Arc<dyn Clock>,
}

impl CouponEngine {
    pub fn new(store: Arc<Store>, catalog: Arc<dyn CourseDirectory>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            catalog,
            clock,
        }
    }

    /// Dry-run validation of `code` for `account` buying `course_id`.
    pub fn validate(&self, code: &str, course_id: CourseId, account: AccountId) -> Result<CouponQuote> {
        let course = self
            .catalog
            .course(course_id)
            .filter(|c| c.published)
            .ok_or_else(|| CommerceError::not_found("course", course_id))?;
        let now = self.clock.now();
        self.store.read(|q| -> Result<CouponQuote> {
            if q.account(account).is_none() {
                return Err(CommerceError::not_found("account", account));
            }
            Ok(check(q, code, &course, account, now)?)
        })
    }

    pub fn create(&self, actor: AccountId, request: NewCoupon) -> Result<Coupon> {
        let now = self.clock.now();
        let role = self
            .store
            .read(|q| q.account(actor).map(|a| a.role))
            .ok_or_else(|| CommerceError::not_found("account", actor))?;

        let owns_resource = match request.scope {
            CouponScope::Course(course_id) => {
                let course = self
                    .catalog
                    .course(course_id)
                    .ok_or_else(|| CommerceError::not_found("course", course_id))?;
                course.instructor_id == actor
            }
            CouponScope::All | CouponScope::Specialization(_) => false,
        };
        auth::authorize(Action::CreateCoupon, Capabilities::new(role, owns_resource))?;

        let code = normalize_code(&request.code);
        if code.is_empty()
            || code.len() > MAX_CODE_LEN
            || !code
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CommerceError::Validation(format!(
                "coupon code must be 1-{MAX_CODE_LEN} characters of A-Z, 0-9, '-' or '_'"
            )));
        }
        if !(1..=100).contains(&request.discount_percent) {
            return Err(CommerceError::Validation(format!(
                "discount percent must be within 1..=100, got {}",
                request.discount_percent
            )));
        }
        if request.max_usage == Some(0) {
            return Err(CommerceError::Validation("max usage must be positive".into()));
        }
        if request.expires_at.is_some_and(|at| at <= now) {
            return Err(CommerceError::Validation("expiry must be in the future".into()));
        }

        let coupon = Coupon {
            id: CouponId::new(),
            code,
            discount_percent: request.discount_percent,
            max_usage: request.max_usage,
            used_count: 0,
            expires_at: request.expires_at,
            active: true,
            scope: request.scope,
            created_by: actor,
            created_at: now,
        };
        self.store
            .unit_of_work(|tx| tx.insert_coupon(coupon.clone()))
            .map_err(|e| match e {
                StoreError::UniqueViolation { key, .. } => {
                    CommerceError::Conflict(format!("coupon code {key} already exists"))
                }
                other => other.into(),
            })?;

        tracing::info!(
            coupon_id = %coupon.id,
            code = %coupon.code,
            percent = coupon.discount_percent,
            created_by = %actor,
            "coupon created"
        );
        Ok(coupon)
    }

    pub fn deactivate(&self, actor: AccountId, code: &str) -> Result<Coupon> {
        let code = normalize_code(code);
        let (role, coupon) = self.store.read(|q| {
            let role = q.account(actor).map(|a| a.role);
            let coupon = q.coupon_by_code(&code).cloned();
            (role, coupon)
        });
        let role = role.ok_or_else(|| CommerceError::not_found("account", actor))?;
        let coupon = coupon.ok_or_else(|| CouponError::NotFound { code: code.clone() })?;
        auth::authorize(
            Action::ManageCoupon,
            Capabilities::new(role, coupon.created_by == actor),
        )?;

        let updated = self.store.unit_of_work(|tx| -> Result<Coupon> {
            let c = tx.coupon_mut(coupon.id)?;
            c.active = false;
            Ok(c.clone())
        })?;
        tracing::info!(coupon_id = %updated.id, code = %updated.code, "coupon deactivated");
        Ok(updated)
    }
}

// =============================================================================
// Tests
// =============================================================================
