//! Read-only course directory consumed by the commerce core.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::model::{Course, CourseId, LessonId};

/// Lookup of courses and their lesson structure. Course content itself is
/// managed elsewhere; the core never writes through this trait.
pub trait CourseDirectory: Send + Sync + 'static {
    fn course(&self, id: CourseId) -> Option<Course>;

    /// The course a lesson belongs to.
    fn course_for_lesson(&self, lesson: LessonId) -> Option<CourseId>;

    /// Lessons of a course across all chapters, in chapter order.
    fn lessons(&self, id: CourseId) -> Option<Vec<LessonId>> {
        self.course(id).map(|c| c.lessons().copied().collect())
    }
}

/// Directory held in memory, fed by whatever owns course content.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    courses: RwLock<HashMap<CourseId, Course>>,
    lesson_index: RwLock<HashMap<LessonId, CourseId>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a course and re-index its lessons.
    pub fn upsert(&self, course: Course) {
        let mut index = self.lesson_index.write();
        index.retain(|_, c| *c != course.id);
        for lesson in course.lessons() {
            index.insert(*lesson, course.id);
        }
        self.courses.write().insert(course.id, course);
    }

    pub fn set_published(&self, id: CourseId, published: bool) -> bool {
        match self.courses.write().get_mut(&id) {
            Some(course) => {
                course.published = published;
                true
            }
            None => false,
        }
    }
}

impl CourseDirectory for InMemoryCatalog {
    fn course(&self, id: CourseId) -> Option<Course> {
        self.courses.read().get(&id).cloned()
    }

    fn course_for_lesson(&self, lesson: LessonId) -> Option<CourseId> {
        self.lesson_index.read().get(&lesson).copied()
    }
}
