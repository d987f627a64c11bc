//! Records owned by the commerce core and the read-only course view it consumes.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Decimal places kept for money and progress values.
pub const MONEY_SCALE: u32 = 2;

/// Round a money or percentage value to [`MONEY_SCALE`] places, half away from zero.
pub fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

ulid_id!(AccountId);
ulid_id!(CourseId);
ulid_id!(ChapterId);
ulid_id!(LessonId);
ulid_id!(SpecializationId);
ulid_id!(CouponId);
ulid_id!(EnrollmentId);
ulid_id!(EntryId);
ulid_id!(DepositId);
ulid_id!(EarningId);

// =============================================================================
// Accounts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Student,
    Instructor,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub display_name: String,
    pub role: Role,
    /// Cached sum of this account's ledger entries.
    pub wallet_balance: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(display_name: impl Into<String>, role: Role, now: DateTime<Utc>) -> Self {
        Self {
            id: AccountId::new(),
            display_name: display_name.into(),
            role,
            wallet_balance: Decimal::ZERO,
            created_at: now,
        }
    }
}

// =============================================================================
// Courses (directory view)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PricingKind {
    Free,
    Paid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: ChapterId,
    pub lessons: Vec<LessonId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub id: CourseId,
    pub title: String,
    pub instructor_id: AccountId,
    pub price: Decimal,
    pub pricing: PricingKind,
    pub published: bool,
    /// Instructor share of each sale; the configured default applies when absent.
    pub revenue_share: Option<Decimal>,
    pub specialization_id: Option<SpecializationId>,
    pub chapters: Vec<Chapter>,
}

impl Course {
    pub fn lesson_count(&self) -> usize {
        self.chapters.iter().map(|c| c.lessons.len()).sum()
    }

    pub fn lessons(&self) -> impl Iterator<Item = &LessonId> + '_ {
        self.chapters.iter().flat_map(|c| c.lessons.iter())
    }

    pub fn is_free(&self) -> bool {
        self.pricing == PricingKind::Free
    }
}

// =============================================================================
// Coupons
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CouponScope {
    All,
    Course(CourseId),
    Specialization(SpecializationId),
}

impl CouponScope {
    pub fn covers(&self, course: &Course) -> bool {
        match self {
            CouponScope::All => true,
            CouponScope::Course(id) => *id == course.id,
            CouponScope::Specialization(id) => course.specialization_id == Some(*id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub id: CouponId,
    /// Uppercase, unique.
    pub code: String,
    /// Whole percent in 1..=100.
    pub discount_percent: u8,
    pub max_usage: Option<u32>,
    pub used_count: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub scope: CouponScope,
    pub created_by: AccountId,
    pub created_at: DateTime<Utc>,
}

impl Coupon {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_usage.is_some_and(|max| self.used_count >= max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouponRedemption {
    pub coupon_id: CouponId,
    pub account_id: AccountId,
    pub redeemed_at: DateTime<Utc>,
}

// =============================================================================
// Enrollments and progress
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: EnrollmentId,
    pub account_id: AccountId,
    pub course_id: CourseId,
    /// Percentage in [0, 100], two decimals.
    pub progress: Decimal,
    /// Set iff `progress >= 100`.
    pub completed_at: Option<DateTime<Utc>>,
    pub coupon_id: Option<CouponId>,
    pub price_paid: Decimal,
    pub enrolled_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn new(
        account_id: AccountId,
        course_id: CourseId,
        coupon_id: Option<CouponId>,
        price_paid: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EnrollmentId::new(),
            account_id,
            course_id,
            progress: Decimal::ZERO,
            completed_at: None,
            coupon_id,
            price_paid,
            enrolled_at: now,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.progress >= Decimal::ONE_HUNDRED
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonProgressEvent {
    pub account_id: AccountId,
    pub lesson_id: LessonId,
    pub course_id: CourseId,
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Ledger
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    Deposit,
    CoursePurchase,
    InstructorEarning,
    Adjustment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryRef {
    Deposit(DepositId),
    Enrollment(EnrollmentId),
}

/// Immutable ledger line. Negative amounts are debits, positive are credits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub account_id: AccountId,
    pub amount: Decimal,
    pub kind: EntryKind,
    pub reference: Option<EntryRef>,
    pub provider_txn_id: Option<String>,
    pub memo: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructorEarning {
    pub id: EarningId,
    pub instructor_id: AccountId,
    pub course_id: CourseId,
    pub enrollment_id: EnrollmentId,
    pub buyer_id: AccountId,
    pub gross: Decimal,
    pub share_rate: Decimal,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Deposits
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DepositStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositIntent {
    pub id: DepositId,
    pub account_id: AccountId,
    pub amount: Decimal,
    /// Idempotency key the payer puts in the transfer memo.
    pub content: String,
    pub qr_code: String,
    pub receiving_account: String,
    pub status: DepositStatus,
    pub provider_txn_id: Option<String>,
    pub credited_amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
