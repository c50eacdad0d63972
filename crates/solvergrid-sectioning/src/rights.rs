//! Rights as pure predicates.
//!
//! Each `Right` maps to a plain function of the subject and the request
//! context. Composite rights call the rights they build on directly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use solvergrid_state::StudentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Right {
    Enroll,
    Change,
    Drop,
    OverrideDeadline,
    ManageSolvers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Advisor,
    Admin,
}

/// Who is acting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub user: String,
    pub role: Role,
    /// Set for students acting on their own record.
    pub student_id: Option<StudentId>,
}

impl Subject {
    pub fn student(id: StudentId) -> Self {
        Self {
            user: format!("student:{id}"),
            role: Role::Student,
            student_id: Some(id),
        }
    }

    pub fn advisor(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            role: Role::Advisor,
            student_id: None,
        }
    }

    pub fn admin(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            role: Role::Admin,
            student_id: None,
        }
    }
}

/// What the subject is acting on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RightContext {
    pub student_id: Option<StudentId>,
    /// The request already holds an enrollment.
    pub has_enrollment: bool,
    /// Some section of the requested courses still accepts changes.
    pub change_window_open: bool,
}

pub type RightCheck = fn(&Subject, &RightContext) -> bool;

fn enroll(subject: &Subject, ctx: &RightContext) -> bool {
    match subject.role {
        Role::Admin | Role::Advisor => true,
        Role::Student => subject.student_id.is_some() && subject.student_id == ctx.student_id,
    }
}

fn change(subject: &Subject, ctx: &RightContext) -> bool {
    enroll(subject, ctx) && (ctx.change_window_open || override_deadline(subject, ctx))
}

fn drop_enrollment(subject: &Subject, ctx: &RightContext) -> bool {
    enroll(subject, ctx) && ctx.has_enrollment
}

fn override_deadline(subject: &Subject, _ctx: &RightContext) -> bool {
    subject.role == Role::Admin
}

fn manage_solvers(subject: &Subject, _ctx: &RightContext) -> bool {
    subject.role == Role::Admin
}

pub struct RightsRegistry {
    checks: HashMap<Right, RightCheck>,
}

impl Default for RightsRegistry {
    fn default() -> Self {
        let mut checks: HashMap<Right, RightCheck> = HashMap::new();
        checks.insert(Right::Enroll, enroll);
        checks.insert(Right::Change, change);
        checks.insert(Right::Drop, drop_enrollment);
        checks.insert(Right::OverrideDeadline, override_deadline);
        checks.insert(Right::ManageSolvers, manage_solvers);
        Self { checks }
    }
}

impl RightsRegistry {
    /// Replace the check for one right.
    pub fn with(mut self, right: Right, check: RightCheck) -> Self {
        self.checks.insert(right, check);
        self
    }

    /// Unregistered rights are denied.
    pub fn check(&self, right: Right, subject: &Subject, ctx: &RightContext) -> bool {
        self.checks.get(&right).is_some_and(|f| f(subject, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(student_id: StudentId) -> RightContext {
        RightContext {
            student_id: Some(student_id),
            has_enrollment: true,
            change_window_open: true,
        }
    }

    #[test]
    fn students_act_on_their_own_record() {
        let rights = RightsRegistry::default();
        assert!(rights.check(Right::Enroll, &Subject::student(7), &ctx(7)));
        assert!(!rights.check(Right::Enroll, &Subject::student(8), &ctx(7)));
        assert!(rights.check(Right::Enroll, &Subject::advisor("avery"), &ctx(7)));
    }

    #[test]
    fn change_needs_an_open_window_unless_overridden() {
        let rights = RightsRegistry::default();
        let closed = RightContext {
            change_window_open: false,
            ..ctx(7)
        };
        assert!(rights.check(Right::Change, &Subject::student(7), &ctx(7)));
        assert!(!rights.check(Right::Change, &Subject::student(7), &closed));
        assert!(rights.check(Right::Change, &Subject::admin("root"), &closed));
    }

    #[test]
    fn drop_needs_an_enrollment() {
        let rights = RightsRegistry::default();
        let empty = RightContext {
            has_enrollment: false,
            ..ctx(7)
        };
        assert!(rights.check(Right::Drop, &Subject::student(7), &ctx(7)));
        assert!(!rights.check(Right::Drop, &Subject::student(7), &empty));
    }

    #[test]
    fn admin_only_rights() {
        let rights = RightsRegistry::default();
        let none = RightContext::default();
        assert!(rights.check(Right::ManageSolvers, &Subject::admin("root"), &none));
        assert!(!rights.check(Right::ManageSolvers, &Subject::advisor("avery"), &none));
        assert!(!rights.check(Right::OverrideDeadline, &Subject::student(7), &none));
    }

    #[test]
    fn checks_can_be_replaced() {
        fn never(_: &Subject, _: &RightContext) -> bool {
            false
        }
        let rights = RightsRegistry::default().with(Right::Enroll, never);
        assert!(!rights.check(Right::Enroll, &Subject::admin("root"), &ctx(7)));
    }
}
