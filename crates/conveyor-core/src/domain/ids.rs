//! Domain identifiers (strongly-typed surrogate IDs).
//!
//! Every row the engine owns (task, stage, log entry, scheduler entry,
//! triggerable action) is addressed by an `i64` surrogate key handed out by
//! the store. `Id<T>` wraps that key with a phantom marker so a `StageId`
//! can never be passed where a `TaskId` is expected.
//!
//! Ordering matters: the singleton check compares task ids ("the oldest
//! active task wins"), so `Id<T>` is `Ord` by its numeric value.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

/// IdMarker is implemented by the marker type of each id family.
///
/// The prefix is only used for `Display` (log output); the wire format is the
/// bare integer.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic surrogate id.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    value: i64,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub const fn new(value: i64) -> Self {
        Self {
            value,
            _marker: PhantomData,
        }
    }

    /// Raw key as stored.
    pub const fn get(self) -> i64 {
        self.value
    }
}

impl<T: IdMarker> From<i64> for Id<T> {
    fn from(value: i64) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.value)
    }
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = std::num::ParseIntError;

    /// Accepts the bare integer (as returned by the ingestion endpoint) or the
    /// prefixed display form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s.strip_prefix(T::prefix()).unwrap_or(s);
        digits.parse::<i64>().map(Self::new)
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.value)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        i64::deserialize(deserializer).map(Self::new)
    }
}

// ========================================
// Marker types
// ========================================

macro_rules! id_marker {
    ($(#[$doc:meta])* $marker:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $marker {}

        impl IdMarker for $marker {
            fn prefix() -> &'static str {
                $prefix
            }
        }
    };
}

id_marker!(
    /// Marker for tasks.
    Task,
    "task-"
);
id_marker!(
    /// Marker for stages of a task.
    Stage,
    "stage-"
);
id_marker!(
    /// Marker for log entries.
    Log,
    "log-"
);
id_marker!(
    /// Marker for scheduler entries.
    Schedule,
    "schedule-"
);
id_marker!(
    /// Marker for triggerable actions.
    Action,
    "action-"
);
id_marker!(
    /// Marker for principals (task owners).
    User,
    "user-"
);

/// Identifier of a task.
pub type TaskId = Id<Task>;

/// Identifier of a stage node.
pub type StageId = Id<Stage>;

/// Identifier of a log entry.
pub type LogId = Id<Log>;

/// Identifier of a scheduler entry.
pub type ScheduleId = Id<Schedule>;

/// Identifier of a triggerable action.
pub type ActionId = Id<Action>;

/// Identifier of a principal.
pub type UserId = Id<User>;
