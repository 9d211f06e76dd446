//! Domain identifiers (strongly-typed IDs).
//!
//! Numeric ids (`TaskId`, `GroupId`) share one generic implementation through a
//! phantom marker type, so they cannot be mixed up at compile time while still
//! being plain `u64` at runtime. String-keyed ids (`MarkerId`, `AccountId`) are
//! newtypes because their values are chosen by task implementations and callers.
//!
//! `ThingId` is the key used everywhere a "task thing" is indexed: the priority
//! queue, the resource gate and the group tracker all speak `ThingId`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// Marker trait providing the display prefix of a numeric id.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic numeric id. `T` only exists at compile time.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    value: u64,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub const fn new(value: u64) -> Self {
        Self {
            value,
            _marker: PhantomData,
        }
    }

    pub fn get(&self) -> u64 {
        self.value
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Group {}

impl IdMarker for Group {
    fn prefix() -> &'static str {
        "group-"
    }
}

/// Identifier of a wrapped task. Issued monotonically by [`TaskIdAllocator`].
pub type TaskId = Id<Task>;

/// Identifier of an in-memory task group.
pub type GroupId = Id<Group>;

/// Identifier chosen by a complex task for one of its markers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkerId(String);

impl MarkerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MarkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of a task thing: either a wrapped task or a complex task's marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThingId {
    Task(TaskId),
    Marker(MarkerId),
}

impl ThingId {
    pub fn as_task(&self) -> Option<TaskId> {
        match self {
            ThingId::Task(id) => Some(*id),
            ThingId::Marker(_) => None,
        }
    }
}

impl From<TaskId> for ThingId {
    fn from(id: TaskId) -> Self {
        ThingId::Task(id)
    }
}

impl From<MarkerId> for ThingId {
    fn from(id: MarkerId) -> Self {
        ThingId::Marker(id)
    }
}

impl fmt::Display for ThingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThingId::Task(id) => id.fmt(f),
            ThingId::Marker(id) => id.fmt(f),
        }
    }
}

/// Offset subtracted from the wall clock before seeding task ids, which keeps
/// the numbers short enough to read in logs.
const ID_EPOCH_MS: i64 = 1_400_000_000_000;

/// Issues unique, monotonically increasing task ids.
///
/// Seeded from the wall clock (`(now_ms - epoch) * 100`) so that ids issued by a
/// later process run sort after those persisted by an earlier one, then counts
/// up by one. [`observe`](Self::observe) bumps the counter past ids loaded from
/// the store.
#[derive(Debug, Clone)]
pub struct TaskIdAllocator {
    next: u64,
}

impl TaskIdAllocator {
    pub fn from_clock() -> Self {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let base = u64::try_from(now_ms - ID_EPOCH_MS).unwrap_or(0);
        Self {
            next: base.saturating_mul(100),
        }
    }

    pub fn starting_at(next: u64) -> Self {
        Self { next }
    }

    pub fn allocate(&mut self) -> TaskId {
        let id = TaskId::new(self.next);
        self.next += 1;
        id
    }

    pub fn observe(&mut self, id: TaskId) {
        if id.get() >= self.next {
            self.next = id.get() + 1;
        }
    }
}
