//! Course purchase: coupon, wallet debit, instructor share and enrollment
//! committed as one unit, followed by a best-effort buyer notification.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::auth::{self, Action, Capabilities};
use crate::catalog::CourseDirectory;
use crate::clock::Clock;
use crate::coupon::{self, CouponQuote};
use crate::error::{CommerceError, Result};
use crate::ledger::{self, Posting};
use crate::model::{
    round2, AccountId, Course, CourseId, EarningId, Enrollment, EntryKind, EntryRef,
    InstructorEarning,
};
use crate::notify::{self, Notification, NotificationKind, Notifier};
use crate::store::{Store, StoreError, Tx};

/// Price a buyer would pay, before anything is committed.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub course_id: CourseId,
    pub original_price: Decimal,
    pub coupon: Option<CouponQuote>,
    pub final_price: Decimal,
}

pub struct EnrollmentOrchestrator {
    store: Arc<Store>,
    catalog: Arc<dyn CourseDirectory>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    default_share: Decimal,
}

impl EnrollmentOrchestrator {
    pub fn new(
        store: Arc<Store>,
        catalog: Arc<dyn CourseDirectory>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        default_share: Decimal,
    ) -> Self {
        Self {
            store,
            catalog,
            notifier,
            clock,
            default_share,
        }
    }

    /// Run every pre-commit check and compute the final price.
    ///
    /// Fails with `NotFound` for unknown accounts and missing or unpublished
    /// courses, `Forbidden` for instructors buying their own course,
    /// `Conflict` when already enrolled, and the coupon error when a code
    /// does not apply.
    pub fn quote(
        &self,
        course_id: CourseId,
        account_id: AccountId,
        coupon_code: Option<&str>,
    ) -> Result<(Course, PriceQuote)> {
        let now = self.clock.now();
        let course = self
            .catalog
            .course(course_id)
            .filter(|c| c.published)
            .ok_or_else(|| CommerceError::not_found("course", course_id))?;

        self.store.read(|q| -> Result<PriceQuote> {
            let account = q
                .account(account_id)
                .ok_or_else(|| CommerceError::not_found("account", account_id))?;
            auth::authorize(
                Action::Enroll,
                Capabilities::new(account.role, course.instructor_id == account_id),
            )?;
            if q.enrollment_for(account_id, course_id).is_some() {
                return Err(already_enrolled());
            }
            let coupon = coupon_code
                .map(|code| coupon::check(q, code, &course, account_id, now))
                .transpose()?;
            let final_price = match (&coupon, course.is_free()) {
                (_, true) => Decimal::ZERO,
                (Some(c), false) => c.apply(course.price),
                (None, false) => course.price,
            };
            Ok(PriceQuote {
                course_id,
                original_price: course.price,
                coupon,
                final_price,
            })
        })
        .map(|quote| (course, quote))
    }

    /// Enroll `account_id` in `course_id`, paying from the wallet when the
    /// (discounted) price is positive.
    pub async fn enroll(
        &self,
        course_id: CourseId,
        account_id: AccountId,
        coupon_code: Option<&str>,
    ) -> Result<Enrollment> {
        let (course, quote) = self.quote(course_id, account_id, coupon_code)?;
        let now = self.clock.now();

        let enrollment = self
            .store
            .unit_of_work(|tx| self.purchase(tx, &course, account_id, &quote, now))?;

        tracing::info!(
            enrollment_id = %enrollment.id,
            %account_id,
            %course_id,
            price_paid = %enrollment.price_paid,
            coupon = quote.coupon.as_ref().map(|c| c.code.as_str()),
            "enrollment committed"
        );

        notify::send_best_effort(
            self.notifier.as_ref(),
            Notification {
                account_id,
                title: "Enrollment confirmed".to_string(),
                body: format!("You are now enrolled in {}.", course.title),
                kind: NotificationKind::Enrollment,
                link: Some(format!("/courses/{course_id}")),
            },
        )
        .await;

        Ok(enrollment)
    }

    /// The atomic part of [`Self::enroll`]. Every check is repeated inside
    /// the unit so a concurrent commit cannot slip between check and write.
    fn purchase(
        &self,
        tx: &mut Tx<'_>,
        course: &Course,
        account_id: AccountId,
        quote: &PriceQuote,
        now: DateTime<Utc>,
    ) -> Result<Enrollment> {
        if tx.snapshot().enrollment_for(account_id, course.id).is_some() {
            return Err(already_enrolled());
        }

        let enrollment = Enrollment::new(
            account_id,
            course.id,
            quote.coupon.as_ref().map(|c| c.coupon_id),
            quote.final_price,
            now,
        );

        if quote.final_price > Decimal::ZERO {
            ledger::debit(
                tx,
                Posting::new(account_id, quote.final_price, EntryKind::CoursePurchase)
                    .reference(EntryRef::Enrollment(enrollment.id))
                    .memo(course.title.clone()),
                now,
            )?;
        }

        // A fully discounted purchase still consumes a coupon use.
        if let Some(c) = &quote.coupon {
            coupon::redeem(tx, c.coupon_id, account_id, now)?;
        }

        tx.insert_enrollment(enrollment.clone())
            .map_err(|e| match e {
                StoreError::UniqueViolation { .. } => already_enrolled(),
                other => other.into(),
            })?;

        if quote.final_price > Decimal::ZERO {
            self.credit_instructor(tx, course, &enrollment, now)?;
        }
        Ok(enrollment)
    }

    fn credit_instructor(
        &self,
        tx: &mut Tx<'_>,
        course: &Course,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let share_rate = course.revenue_share.unwrap_or(self.default_share);
        let amount = round2(enrollment.price_paid * share_rate);
        if amount <= Decimal::ZERO {
            return Ok(());
        }
        if tx.snapshot().account(course.instructor_id).is_none() {
            tracing::warn!(
                instructor_id = %course.instructor_id,
                course_id = %course.id,
                "instructor account missing, earning not recorded"
            );
            return Ok(());
        }

        ledger::credit(
            tx,
            Posting::new(course.instructor_id, amount, EntryKind::InstructorEarning)
                .reference(EntryRef::Enrollment(enrollment.id)),
            now,
        )?;
        tx.append_earning(InstructorEarning {
            id: EarningId::new(),
            instructor_id: course.instructor_id,
            course_id: course.id,
            enrollment_id: enrollment.id,
            buyer_id: enrollment.account_id,
            gross: enrollment.price_paid,
            share_rate,
            amount,
            created_at: now,
        });
        Ok(())
    }
}

fn already_enrolled() -> CommerceError {
    CommerceError::Conflict("already enrolled in this course".to_string())
}

// =============================================================================
// Tests
// =============================================================================
