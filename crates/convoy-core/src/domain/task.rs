//! Task shapes: what callers submit, what gets persisted, and what the queue
//! actually schedules.
//!
//! Lifecycle:
//! - `RawTask` is submitted by a caller and wrapped into a `WrappedTask` (state `Unplanned`).
//! - Planning turns it into a `PlannedTask` (state `Planned`), or declares it moot.
//! - The planned wrapped task, or a complex task's `TaskMarker`, is a `TaskThing`
//!   that flows through the resource gate and priority queue until executed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::ids::{AccountId, MarkerId, TaskId, ThingId};

/// Name of a task implementation, e.g. `sync_refresh`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Well-known resource identifiers.
pub mod resources {
    use super::AccountId;

    /// Network connectivity.
    pub const ONLINE: &str = "online";

    /// Valid credentials for one account.
    pub fn credentials(account_id: &AccountId) -> String {
        format!("credentials!{account_id}")
    }
}

/// Caller-supplied intent. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTask {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RawTask {
    pub fn new(task_type: impl Into<TaskType>) -> Self {
        Self {
            task_type: task_type.into(),
            account_id: None,
            fields: Map::new(),
        }
    }

    pub fn for_account(mut self, account_id: AccountId) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// The fully-specified, ready-to-run form produced by planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
    #[serde(default)]
    pub priority_tags: Vec<String>,
    #[serde(default)]
    pub rel_priority: i64,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl PlannedTask {
    /// Starts from the raw task's type, account and fields.
    pub fn from_raw(raw: &RawTask) -> Self {
        Self {
            task_type: raw.task_type.clone(),
            account_id: raw.account_id.clone(),
            priority_tags: Vec::new(),
            rel_priority: 0,
            resources: Vec::new(),
            fields: raw.fields.clone(),
        }
    }

    pub fn with_priority_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.priority_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_rel_priority(mut self, rel_priority: i64) -> Self {
        self.rel_priority = rel_priority;
        self
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WrappedState {
    Unplanned,
    Planned,
    Removed,
}

/// The persisted envelope around a `RawTask`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrappedTask {
    pub id: TaskId,
    pub state: WrappedState,
    pub raw_task: RawTask,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_task: Option<PlannedTask>,
    /// Ephemeral tasks are never written to the store.
    #[serde(default)]
    pub nonpersistent: bool,
}

impl WrappedTask {
    pub fn new(id: TaskId, raw_task: RawTask) -> Self {
        Self {
            id,
            state: WrappedState::Unplanned,
            raw_task,
            planned_task: None,
            nonpersistent: false,
        }
    }

    pub fn ephemeral(mut self) -> Self {
        self.nonpersistent = true;
        self
    }

    pub fn task_type(&self) -> &TaskType {
        match &self.planned_task {
            Some(planned) => &planned.task_type,
            None => &self.raw_task.task_type,
        }
    }

    pub fn account_id(&self) -> Option<&AccountId> {
        match &self.planned_task {
            Some(planned) => planned.account_id.as_ref(),
            None => self.raw_task.account_id.as_ref(),
        }
    }

    pub fn mark_planned(&mut self, planned: PlannedTask) {
        self.state = WrappedState::Planned;
        self.planned_task = Some(planned);
    }
}

/// A complex task's lightweight stand-in for a persisted wrapped task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMarker {
    pub id: MarkerId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
    #[serde(default)]
    pub priority_tags: Vec<String>,
    #[serde(default)]
    pub rel_priority: i64,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TaskMarker {
    pub fn new(id: MarkerId, task_type: impl Into<TaskType>) -> Self {
        Self {
            id,
            task_type: task_type.into(),
            account_id: None,
            priority_tags: Vec::new(),
            rel_priority: 0,
            resources: Vec::new(),
            fields: Map::new(),
        }
    }

    pub fn for_account(mut self, account_id: AccountId) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn with_priority_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.priority_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_rel_priority(mut self, rel_priority: i64) -> Self {
        self.rel_priority = rel_priority;
        self
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// A wrapped task or a marker, once it is schedulable.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskThing {
    Task(WrappedTask),
    Marker(TaskMarker),
}

impl TaskThing {
    pub fn id(&self) -> ThingId {
        match self {
            TaskThing::Task(task) => ThingId::Task(task.id),
            TaskThing::Marker(marker) => ThingId::Marker(marker.id.clone()),
        }
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, TaskThing::Marker(_))
    }

    pub fn task_type(&self) -> &TaskType {
        match self {
            TaskThing::Task(task) => task.task_type(),
            TaskThing::Marker(marker) => &marker.task_type,
        }
    }

    pub fn account_id(&self) -> Option<&AccountId> {
        match self {
            TaskThing::Task(task) => task.account_id(),
            TaskThing::Marker(marker) => marker.account_id.as_ref(),
        }
    }

    pub fn priority_tags(&self) -> &[String] {
        match self {
            TaskThing::Task(task) => task
                .planned_task
                .as_ref()
                .map(|p| p.priority_tags.as_slice())
                .unwrap_or(&[]),
            TaskThing::Marker(marker) => &marker.priority_tags,
        }
    }

    pub fn rel_priority(&self) -> i64 {
        match self {
            TaskThing::Task(task) => task.planned_task.as_ref().map_or(0, |p| p.rel_priority),
            TaskThing::Marker(marker) => marker.rel_priority,
        }
    }

    pub fn resources(&self) -> &[String] {
        match self {
            TaskThing::Task(task) => task
                .planned_task
                .as_ref()
                .map(|p| p.resources.as_slice())
                .unwrap_or(&[]),
            TaskThing::Marker(marker) => &marker.resources,
        }
    }
}
