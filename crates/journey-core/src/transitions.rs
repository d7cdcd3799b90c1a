//! Transition table: (from, to) -> roles allowed to perform it
//!
//! The table is a static `match`, so lookups are constant time and unknown
//! pairs deny by default. Superadmin may do everything admin may.

use crate::error::{JourneyError, Result};
use crate::types::{NodeState, Role, TargetState};

/// Bitmask of roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoleSet(u8);

impl RoleSet {
    pub const EMPTY: Self = Self(0);
    pub const STUDENT: Self = Self(1);
    pub const ADVISOR: Self = Self(1 << 1);
    pub const ADMIN: Self = Self(1 << 2);
    pub const SUPERADMIN: Self = Self(1 << 3);

    const ADMINS: Self = Self(Self::ADMIN.0 | Self::SUPERADMIN.0);
    const REVIEWERS: Self = Self(Self::ADVISOR.0 | Self::ADMINS.0);

    #[inline]
    #[must_use]
    pub const fn of(role: Role) -> Self {
        match role {
            Role::Student => Self::STUDENT,
            Role::Advisor => Self::ADVISOR,
            Role::Admin => Self::ADMIN,
            Role::Superadmin => Self::SUPERADMIN,
        }
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, role: Role) -> bool {
        self.0 & Self::of(role).0 != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn roles(self) -> Vec<Role> {
        Role::ALL.into_iter().filter(|r| self.contains(*r)).collect()
    }
}

/// Roles allowed to move a node from `from` to `to`
#[must_use]
pub const fn allowed_roles(from: NodeState, to: TargetState) -> RoleSet {
    use NodeState::{Active, Done, NeedsFixes, Skipped, Submitted, UnderReview};

    let target = match to {
        TargetState::Node(state) => state,
        TargetState::ApprovedWithComments => {
            return match from {
                UnderReview => RoleSet::REVIEWERS,
                _ => RoleSet::EMPTY,
            };
        }
    };

    match (from, target) {
        // Same-state writes are not transitions.
        (Active, Active)
        | (Submitted, Submitted)
        | (UnderReview, UnderReview)
        | (NeedsFixes, NeedsFixes)
        | (Done, Done)
        | (Skipped, Skipped) => RoleSet::EMPTY,

        (Active | NeedsFixes, Submitted) => RoleSet(RoleSet::STUDENT.0 | RoleSet::ADMINS.0),

        (_, Skipped | Active) => RoleSet::ADMINS,

        (Submitted, UnderReview | Done | NeedsFixes)
        | (UnderReview, NeedsFixes | Done | Submitted)
        | (NeedsFixes, UnderReview | Done)
        | (Done, NeedsFixes | UnderReview)
        | (Active, UnderReview) => RoleSet::REVIEWERS,

        _ => RoleSet::EMPTY,
    }
}

/// `check_transition(from, to, role)`
#[inline]
#[must_use]
pub const fn check_transition(from: NodeState, to: TargetState, role: Role) -> bool {
    allowed_roles(from, to).contains(role)
}

/// Like [`check_transition`] but returns `Forbidden` with a readable reason
pub fn validate_transition(from: NodeState, to: TargetState, role: Role) -> Result<()> {
    if check_transition(from, to, role) {
        Ok(())
    } else {
        Err(JourneyError::Forbidden(format!(
            "role '{role}' may not move a node from '{from}' to '{to}'"
        )))
    }
}

/// Every target a role may request from `from`
#[must_use]
pub fn allowed_targets(from: NodeState, role: Role) -> Vec<TargetState> {
    NodeState::ALL
        .into_iter()
        .map(TargetState::Node)
        .chain(std::iter::once(TargetState::ApprovedWithComments))
        .filter(|to| check_transition(from, *to, role))
        .collect()
}
