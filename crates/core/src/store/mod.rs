//! Transactional record store backing the commerce core.
//!
//! All writes go through [`Store::unit_of_work`]. The closure runs while the
//! store's write lock is held and writes straight into the tables, recording
//! an undo step for every row it inserts or changes. `Ok` keeps the writes;
//! an `Err` or a panic replays the undo log and leaves the tables as they
//! were. Holding the lock for the whole unit gives serializable isolation, so
//! checks made inside a unit (balance, remaining coupon uses, existing
//! enrollment, deposit still pending) are still true when the unit commits.
//!
//! Uniqueness constraints:
//!
//! | constraint                    | key                         |
//! |-------------------------------|-----------------------------|
//! | `account_id`                  | account id                  |
//! | `coupon_code`                 | uppercase coupon code       |
//! | `redemption_coupon_account`   | (coupon, account)           |
//! | `enrollment_account_course`   | (account, course)           |
//! | `deposit_content`             | deposit idempotency key     |
//! | `ledger_provider_txn`         | provider transaction id     |

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::model::{
    Account, AccountId, Coupon, CouponId, CouponRedemption, CourseId, DepositId, DepositIntent,
    DepositStatus, Enrollment, EnrollmentId, InstructorEarning, LedgerEntry, LessonId,
    LessonProgressEvent,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint {constraint} violated by {key}")]
    UniqueViolation { constraint: &'static str, key: String },
    #[error("{entity} {id} does not exist")]
    Missing { entity: &'static str, id: String },
}

#[derive(Debug, Default)]
struct Tables {
    accounts: HashMap<AccountId, Account>,
    coupons: HashMap<CouponId, Coupon>,
    coupon_codes: HashMap<String, CouponId>,
    redemptions: HashMap<(CouponId, AccountId), CouponRedemption>,
    enrollments: HashMap<EnrollmentId, Enrollment>,
    enrollment_keys: HashMap<(AccountId, CourseId), EnrollmentId>,
    deposits: HashMap<DepositId, DepositIntent>,
    deposit_contents: HashMap<String, DepositId>,
    provider_txns: HashSet<String>,
    lesson_events: HashMap<(AccountId, LessonId), LessonProgressEvent>,
    ledger: Vec<LedgerEntry>,
    /// Positions in `ledger`, per account, ascending.
    ledger_by_account: HashMap<AccountId, Vec<usize>>,
    earnings: Vec<InstructorEarning>,
    /// Positions in `earnings`, per instructor, ascending.
    earnings_by_instructor: HashMap<AccountId, Vec<usize>>,
}

impl Tables {
    fn snapshot(&self) -> Snapshot<'_> {
        Snapshot { tables: self }
    }
}

/// Before-image of one write, replayed newest first on rollback. Appends to
/// the ledger and earnings logs are undone by truncating to the unit's start.
enum Undo {
    Account(AccountId, Option<Account>),
    Coupon(CouponId, Option<Coupon>),
    CouponCode(String),
    Redemption((CouponId, AccountId)),
    Enrollment(EnrollmentId, Option<Enrollment>),
    EnrollmentKey((AccountId, CourseId)),
    Deposit(DepositId, Option<DepositIntent>),
    DepositContent(String),
    ProviderTxn(String),
    LessonEvent((AccountId, LessonId), Option<LessonProgressEvent>),
}

fn restore<K: Eq + Hash, V>(map: &mut HashMap<K, V>, key: K, prior: Option<V>) {
    match prior {
        Some(row) => {
            map.insert(key, row);
        }
        None => {
            map.remove(&key);
        }
    }
}

impl Undo {
    fn revert(self, t: &mut Tables) {
        match self {
            Undo::Account(id, prior) => restore(&mut t.accounts, id, prior),
            Undo::Coupon(id, prior) => restore(&mut t.coupons, id, prior),
            Undo::CouponCode(code) => {
                t.coupon_codes.remove(&code);
            }
            Undo::Redemption(key) => {
                t.redemptions.remove(&key);
            }
            Undo::Enrollment(id, prior) => restore(&mut t.enrollments, id, prior),
            Undo::EnrollmentKey(key) => {
                t.enrollment_keys.remove(&key);
            }
            Undo::Deposit(id, prior) => restore(&mut t.deposits, id, prior),
            Undo::DepositContent(content) => {
                t.deposit_contents.remove(&content);
            }
            Undo::ProviderTxn(txn) => {
                t.provider_txns.remove(&txn);
            }
            Undo::LessonEvent(key, prior) => restore(&mut t.lesson_events, key, prior),
        }
    }
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Default)]
pub struct Store {
    tables: RwLock<Tables>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against a consistent read-only view.
    pub fn read<T>(&self, f: impl FnOnce(Snapshot<'_>) -> T) -> T {
        let guard = self.tables.read();
        f(guard.snapshot())
    }

    /// Run `work` as one atomic unit: commit on `Ok`, roll back on `Err`.
    ///
    /// A panic inside `work` also rolls back before the lock is released.
    pub fn unit_of_work<T, E>(
        &self,
        work: impl FnOnce(&mut Tx<'_>) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut guard = self.tables.write();
        let mut tx = Tx::begin(&mut guard);
        let result = work(&mut tx);
        match result {
            Ok(_) => tx.commit(),
            Err(_) => tx.rollback(),
        }
        result
    }
}

// =============================================================================
// Read view
// =============================================================================

/// Read-only view over the tables, either committed or as seen inside a unit.
#[derive(Clone, Copy)]
pub struct Snapshot<'a> {
    tables: &'a Tables,
}

impl<'a> Snapshot<'a> {
    pub fn account(self, id: AccountId) -> Option<&'a Account> {
        self.tables.accounts.get(&id)
    }

    pub fn accounts(self) -> impl Iterator<Item = &'a Account> {
        self.tables.accounts.values()
    }

    pub fn coupon(self, id: CouponId) -> Option<&'a Coupon> {
        self.tables.coupons.get(&id)
    }

    pub fn coupon_by_code(self, code: &str) -> Option<&'a Coupon> {
        let id = self
            .tables
            .coupon_codes
            .get(&code.trim().to_ascii_uppercase())?;
        self.tables.coupons.get(id)
    }

    pub fn redemption(self, coupon: CouponId, account: AccountId) -> Option<&'a CouponRedemption> {
        self.tables.redemptions.get(&(coupon, account))
    }

    pub fn enrollment_for(self, account: AccountId, course: CourseId) -> Option<&'a Enrollment> {
        let id = self.tables.enrollment_keys.get(&(account, course))?;
        self.tables.enrollments.get(id)
    }

    pub fn deposit(self, id: DepositId) -> Option<&'a DepositIntent> {
        self.tables.deposits.get(&id)
    }

    pub fn deposit_by_content(self, content: &str) -> Option<&'a DepositIntent> {
        let id = self.tables.deposit_contents.get(content)?;
        self.tables.deposits.get(id)
    }

    pub fn has_provider_txn(self, txn_id: &str) -> bool {
        self.tables.provider_txns.contains(txn_id)
    }

    pub fn lesson_event(self, account: AccountId, lesson: LessonId) -> Option<&'a LessonProgressEvent> {
        self.tables.lesson_events.get(&(account, lesson))
    }

    /// Ledger entries of `account` in append order.
    pub fn entries_for(self, account: AccountId) -> Vec<&'a LedgerEntry> {
        indexed(&self.tables.ledger, &self.tables.ledger_by_account, account).collect()
    }

    pub fn ledger_sum(self, account: AccountId) -> Decimal {
        indexed(&self.tables.ledger, &self.tables.ledger_by_account, account)
            .map(|e| e.amount)
            .sum()
    }

    pub fn earnings_for(self, instructor: AccountId) -> Vec<&'a InstructorEarning> {
        indexed(
            &self.tables.earnings,
            &self.tables.earnings_by_instructor,
            instructor,
        )
        .collect()
    }
}

fn indexed<'a, T>(
    log: &'a [T],
    index: &'a HashMap<AccountId, Vec<usize>>,
    account: AccountId,
) -> impl Iterator<Item = &'a T> + 'a {
    index
        .get(&account)
        .into_iter()
        .flatten()
        .filter_map(move |&at| log.get(at))
}

// =============================================================================
// Unit of work handle
// =============================================================================

/// Write handle passed to [`Store::unit_of_work`]. Dropping it without a
/// commit rolls back.
pub struct Tx<'a> {
    tables: &'a mut Tables,
    undo: Vec<Undo>,
    ledger_mark: usize,
    earnings_mark: usize,
    done: bool,
}

impl<'a> Tx<'a> {
    fn begin(tables: &'a mut Tables) -> Self {
        let ledger_mark = tables.ledger.len();
        let earnings_mark = tables.earnings.len();
        Self {
            tables,
            undo: Vec::new(),
            ledger_mark,
            earnings_mark,
            done: false,
        }
    }

    fn commit(mut self) {
        tracing::trace!(
            row_writes = self.undo.len(),
            ledger_appends = self.tables.ledger.len() - self.ledger_mark,
            earning_appends = self.tables.earnings.len() - self.earnings_mark,
            "unit of work committed"
        );
        self.undo.clear();
        self.done = true;
    }

    fn rollback(mut self) {
        self.revert();
        tracing::trace!("unit of work rolled back");
    }

    fn revert(&mut self) {
        let t = &mut *self.tables;
        while let Some(step) = self.undo.pop() {
            step.revert(t);
        }
        for entry in t.ledger.drain(self.ledger_mark..) {
            if let Some(positions) = t.ledger_by_account.get_mut(&entry.account_id) {
                positions.pop();
            }
        }
        for earning in t.earnings.drain(self.earnings_mark..) {
            if let Some(positions) = t.earnings_by_instructor.get_mut(&earning.instructor_id) {
                positions.pop();
            }
        }
        self.done = true;
    }

    /// Reads see this unit's own uncommitted writes.
    pub fn snapshot(&self) -> Snapshot<'_> {
        self.tables.snapshot()
    }

    pub fn insert_account(&mut self, account: Account) -> Result<(), StoreError> {
        if self.tables.accounts.contains_key(&account.id) {
            return Err(StoreError::UniqueViolation {
                constraint: "account_id",
                key: account.id.to_string(),
            });
        }
        self.undo.push(Undo::Account(account.id, None));
        self.tables.accounts.insert(account.id, account);
        Ok(())
    }

    /// Balance changes go through [`crate::ledger`] only.
    pub(crate) fn account_mut(&mut self, id: AccountId) -> Result<&mut Account, StoreError> {
        let account = self
            .tables
            .accounts
            .get_mut(&id)
            .ok_or_else(|| StoreError::Missing {
                entity: "account",
                id: id.to_string(),
            })?;
        self.undo.push(Undo::Account(id, Some(account.clone())));
        Ok(account)
    }

    pub fn insert_coupon(&mut self, coupon: Coupon) -> Result<(), StoreError> {
        if self.tables.coupon_codes.contains_key(&coupon.code) {
            return Err(StoreError::UniqueViolation {
                constraint: "coupon_code",
                key: coupon.code,
            });
        }
        self.undo.push(Undo::CouponCode(coupon.code.clone()));
        self.undo
            .push(Undo::Coupon(coupon.id, self.tables.coupons.get(&coupon.id).cloned()));
        self.tables.coupon_codes.insert(coupon.code.clone(), coupon.id);
        self.tables.coupons.insert(coupon.id, coupon);
        Ok(())
    }

    pub(crate) fn coupon_mut(&mut self, id: CouponId) -> Result<&mut Coupon, StoreError> {
        let coupon = self
            .tables
            .coupons
            .get_mut(&id)
            .ok_or_else(|| StoreError::Missing {
                entity: "coupon",
                id: id.to_string(),
            })?;
        self.undo.push(Undo::Coupon(id, Some(coupon.clone())));
        Ok(coupon)
    }

    pub fn insert_redemption(&mut self, redemption: CouponRedemption) -> Result<(), StoreError> {
        let key = (redemption.coupon_id, redemption.account_id);
        if self.tables.redemptions.contains_key(&key) {
            return Err(StoreError::UniqueViolation {
                constraint: "redemption_coupon_account",
                key: format!("{}/{}", key.0, key.1),
            });
        }
        self.undo.push(Undo::Redemption(key));
        self.tables.redemptions.insert(key, redemption);
        Ok(())
    }

    pub fn insert_enrollment(&mut self, enrollment: Enrollment) -> Result<(), StoreError> {
        let key = (enrollment.account_id, enrollment.course_id);
        if self.tables.enrollment_keys.contains_key(&key) {
            return Err(StoreError::UniqueViolation {
                constraint: "enrollment_account_course",
                key: format!("{}/{}", key.0, key.1),
            });
        }
        self.undo.push(Undo::EnrollmentKey(key));
        self.undo.push(Undo::Enrollment(
            enrollment.id,
            self.tables.enrollments.get(&enrollment.id).cloned(),
        ));
        self.tables.enrollment_keys.insert(key, enrollment.id);
        self.tables.enrollments.insert(enrollment.id, enrollment);
        Ok(())
    }

    pub(crate) fn enrollment_mut(&mut self, id: EnrollmentId) -> Result<&mut Enrollment, StoreError> {
        let enrollment = self
            .tables
            .enrollments
            .get_mut(&id)
            .ok_or_else(|| StoreError::Missing {
                entity: "enrollment",
                id: id.to_string(),
            })?;
        self.undo.push(Undo::Enrollment(id, Some(enrollment.clone())));
        Ok(enrollment)
    }

    /// Append an immutable ledger line. Does not touch cached balances.
    pub(crate) fn append_entry(&mut self, entry: LedgerEntry) -> Result<(), StoreError> {
        if let Some(txn) = &entry.provider_txn_id {
            if !self.tables.provider_txns.insert(txn.clone()) {
                return Err(StoreError::UniqueViolation {
                    constraint: "ledger_provider_txn",
                    key: txn.clone(),
                });
            }
            self.undo.push(Undo::ProviderTxn(txn.clone()));
        }
        let at = self.tables.ledger.len();
        self.tables
            .ledger_by_account
            .entry(entry.account_id)
            .or_default()
            .push(at);
        self.tables.ledger.push(entry);
        Ok(())
    }

    pub(crate) fn append_earning(&mut self, earning: InstructorEarning) {
        let at = self.tables.earnings.len();
        self.tables
            .earnings_by_instructor
            .entry(earning.instructor_id)
            .or_default()
            .push(at);
        self.tables.earnings.push(earning);
    }

    pub fn insert_deposit(&mut self, intent: DepositIntent) -> Result<(), StoreError> {
        if self.tables.deposit_contents.contains_key(&intent.content) {
            return Err(StoreError::UniqueViolation {
                constraint: "deposit_content",
                key: intent.content,
            });
        }
        self.undo.push(Undo::DepositContent(intent.content.clone()));
        self.undo
            .push(Undo::Deposit(intent.id, self.tables.deposits.get(&intent.id).cloned()));
        self.tables
            .deposit_contents
            .insert(intent.content.clone(), intent.id);
        self.tables.deposits.insert(intent.id, intent);
        Ok(())
    }

    /// Conditional `Pending -> Completed` transition. Returns `false` without
    /// changing anything when the intent is no longer pending.
    pub(crate) fn complete_deposit_if_pending(
        &mut self,
        id: DepositId,
        provider_txn_id: &str,
        credited_amount: Decimal,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let intent = self
            .tables
            .deposits
            .get_mut(&id)
            .ok_or_else(|| StoreError::Missing {
                entity: "deposit",
                id: id.to_string(),
            })?;
        if intent.status != DepositStatus::Pending {
            return Ok(false);
        }
        self.undo.push(Undo::Deposit(id, Some(intent.clone())));
        intent.status = DepositStatus::Completed;
        intent.completed_at = Some(at);
        intent.provider_txn_id = Some(provider_txn_id.to_string());
        intent.credited_amount = Some(credited_amount);
        Ok(true)
    }

    pub(crate) fn upsert_lesson_event(&mut self, event: LessonProgressEvent) {
        let key = (event.account_id, event.lesson_id);
        let prior = self.tables.lesson_events.insert(key, event);
        self.undo.push(Undo::LessonEvent(key, prior));
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.revert();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
