//! Principal - who is asking.

use crate::domain::ids::UserId;

/// Caller identity for management operations.
///
/// `manager` is membership of the administrative role: managers may enqueue,
/// cancel and delete tasks they do not own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user: UserId,
    pub manager: bool,
}

impl Principal {
    pub const SYSTEM_USER: UserId = UserId::new(1);

    pub fn user(user: UserId) -> Self {
        Self {
            user,
            manager: false,
        }
    }

    pub fn manager(user: UserId) -> Self {
        Self {
            user,
            manager: true,
        }
    }

    /// The engine itself (dependency chain continuation).
    pub fn system() -> Self {
        Self::manager(Self::SYSTEM_USER)
    }

    pub fn may_manage(&self, owner: UserId) -> bool {
        self.manager || self.user == owner
    }
}
