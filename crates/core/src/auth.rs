//! Authorization predicates evaluated at the top of each operation.

use crate::error::{CommerceError, Result};
use crate::model::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Buy or claim a course.
    Enroll,
    /// Create a coupon; ownership means the coupon is scoped to one of the
    /// actor's own courses.
    CreateCoupon,
    /// Deactivate a coupon; ownership means the actor created it.
    ManageCoupon,
    /// Read a deposit intent or earnings; ownership means it is the actor's.
    ViewFinancials,
    /// Post a manual wallet adjustment.
    AdjustWallet,
}

/// What the acting account is, relative to the resource being acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub role: Role,
    pub owns_resource: bool,
}

impl Capabilities {
    pub fn new(role: Role, owns_resource: bool) -> Self {
        Self {
            role,
            owns_resource,
        }
    }
}

pub fn is_allowed(action: Action, caps: Capabilities) -> bool {
    match (action, caps.role) {
        // Owning the course means being its instructor.
        (Action::Enroll, Role::Student | Role::Instructor) => !caps.owns_resource,
        (Action::Enroll, Role::Admin) => false,
        (Action::CreateCoupon | Action::ManageCoupon, Role::Admin) => true,
        (Action::CreateCoupon | Action::ManageCoupon, Role::Instructor) => caps.owns_resource,
        (Action::CreateCoupon | Action::ManageCoupon, Role::Student) => false,
        (Action::ViewFinancials, Role::Admin) => true,
        (Action::ViewFinancials, _) => caps.owns_resource,
        (Action::AdjustWallet, role) => role == Role::Admin,
    }
}

pub fn authorize(action: Action, caps: Capabilities) -> Result<()> {
    if is_allowed(action, caps) {
        return Ok(());
    }
    let reason = match (action, caps.role) {
        (Action::Enroll, Role::Admin) => "administrators cannot enroll in courses",
        (Action::Enroll, _) => "instructors cannot enroll in their own course",
        (Action::CreateCoupon, Role::Instructor) => {
            "instructors may only create coupons for their own courses"
        }
        (Action::CreateCoupon, _) => "only instructors and administrators may create coupons",
        (Action::ManageCoupon, _) => "only the coupon creator or an administrator may change it",
        (Action::ViewFinancials, _) => "resource belongs to another account",
        (Action::AdjustWallet, _) => "only administrators may adjust wallets",
    };
    Err(CommerceError::Forbidden(reason.to_string()))
}
