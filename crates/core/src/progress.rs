//! Completion tracking derived from per-lesson progress events.
//!
//! A course without lessons counts as fully complete. Recalculation only ever
//! touches the single enrollment it targets and may run any number of times.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::catalog::CourseDirectory;
use crate::clock::Clock;
use crate::error::{CommerceError, Result};
use crate::model::{round2, AccountId, Course, CourseId, Enrollment, LessonId, LessonProgressEvent};
use crate::store::{Store, Tx};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub progress: Decimal,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Enrollment> for ProgressSnapshot {
    fn from(e: &Enrollment) -> Self {
        Self {
            progress: e.progress,
            completed_at: e.completed_at,
        }
    }
}

/// `completed / total * 100`, two decimals; 100 for a course with no lessons.
pub fn compute_progress(completed: usize, total: usize) -> Decimal {
    if total == 0 {
        return Decimal::ONE_HUNDRED;
    }
    let completed = Decimal::from(completed.min(total) as u64);
    round2(completed * Decimal::ONE_HUNDRED / Decimal::from(total as u64))
}

pub struct ProgressTracker {
    store: Arc<Store>,
    catalog: Arc<dyn CourseDirectory>,
    clock: Arc<dyn Clock>,
}

impl ProgressTracker {
    pub fn new(store: Arc<Store>, catalog: Arc<dyn CourseDirectory>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            catalog,
            clock,
        }
    }

    pub fn get_progress(&self, course_id: CourseId, account_id: AccountId) -> Result<ProgressSnapshot> {
        self.store.read(|q| {
            q.enrollment_for(account_id, course_id)
                .map(ProgressSnapshot::from)
                .ok_or_else(|| CommerceError::not_found("enrollment", format!("{account_id}/{course_id}")))
        })
    }

    /// Recompute the enrollment's progress from the stored lesson events.
    pub fn recalculate(&self, account_id: AccountId, course_id: CourseId) -> Result<ProgressSnapshot> {
        let course = self
            .catalog
            .course(course_id)
            .ok_or_else(|| CommerceError::not_found("course", course_id))?;
        let now = self.clock.now();
        let snapshot = self
            .store
            .unit_of_work(|tx| apply_progress(tx, &course, account_id, now))?;
        tracing::debug!(
            %account_id,
            %course_id,
            progress = %snapshot.progress,
            "progress recalculated"
        );
        Ok(snapshot)
    }

    /// Store a lesson completion event and recalculate its course in the same unit.
    pub fn record_lesson_event(
        &self,
        account_id: AccountId,
        lesson_id: LessonId,
        completed: bool,
    ) -> Result<ProgressSnapshot> {
        let course = self
            .catalog
            .course_for_lesson(lesson_id)
            .and_then(|id| self.catalog.course(id))
            .ok_or_else(|| CommerceError::not_found("lesson", lesson_id))?;
        let now = self.clock.now();

        let snapshot = self.store.unit_of_work(|tx| {
            tx.upsert_lesson_event(LessonProgressEvent {
                account_id,
                lesson_id,
                course_id: course.id,
                completed,
                updated_at: now,
            });
            apply_progress(tx, &course, account_id, now)
        })?;

        tracing::info!(
            %account_id,
            %lesson_id,
            course_id = %course.id,
            completed,
            progress = %snapshot.progress,
            "lesson progress recorded"
        );
        Ok(snapshot)
    }
}

fn apply_progress(
    tx: &mut Tx<'_>,
    course: &Course,
    account_id: AccountId,
    now: DateTime<Utc>,
) -> Result<ProgressSnapshot> {
    let view = tx.snapshot();
    let enrollment_id = view
        .enrollment_for(account_id, course.id)
        .map(|e| e.id)
        .ok_or_else(|| CommerceError::not_found("enrollment", format!("{account_id}/{}", course.id)))?;
    let completed = course
        .lessons()
        .filter(|lesson| {
            view.lesson_event(account_id, **lesson)
                .is_some_and(|e| e.completed)
        })
        .count();
    let progress = compute_progress(completed, course.lesson_count());

    let enrollment = tx.enrollment_mut(enrollment_id)?;
    enrollment.progress = progress;
    if enrollment.is_complete() {
        // Keep the first completion time across repeated recalculations.
        enrollment.completed_at.get_or_insert(now);
    } else {
        enrollment.completed_at = None;
    }
    Ok(ProgressSnapshot::from(&*enrollment))
}

// =============================================================================
// Tests
// =============================================================================
