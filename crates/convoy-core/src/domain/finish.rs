//! Store request and commit payloads.
//!
//! `ReadRequest`/`ReadResults` are the batch lookups a context issues against the
//! store. `FinishData` is everything a task hands back when it finishes; the
//! context turns it into the store's `finish_mutate` call plus scheduler side
//! effects (re-queueing, markers, spawned tasks, undo).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::ids::{AccountId, MarkerId, TaskId};
use super::task::{PlannedTask, RawTask, TaskMarker, TaskType, WrappedTask};

/// Namespace that persisted complex task state is written under.
pub const COMPLEX_STATE_NAMESPACE: &str = "complexTaskStates";

/// Record id of one complex task's persisted state.
pub fn complex_state_key(account_id: Option<&AccountId>, task_type: &TaskType) -> String {
    match account_id {
        Some(account_id) => format!("{account_id}|{task_type}"),
        None => format!("global|{task_type}"),
    }
}

/// Batch lookup keyed by namespace then record id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadRequest {
    entries: BTreeMap<String, BTreeSet<String>>,
}

impl ReadRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new().with(namespace, id)
    }

    pub fn with(mut self, namespace: impl Into<String>, id: impl Into<String>) -> Self {
        self.entries
            .entry(namespace.into())
            .or_default()
            .insert(id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(BTreeSet::is_empty)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(ns, ids)| ids.iter().map(move |id| (ns.as_str(), id.as_str())))
    }
}

/// Values returned for a `ReadRequest`. A missing record reads as `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadResults {
    values: BTreeMap<String, BTreeMap<String, Option<Value>>>,
}

impl ReadResults {
    pub fn insert(&mut self, namespace: &str, id: &str, value: Option<Value>) {
        self.values
            .entry(namespace.to_string())
            .or_default()
            .insert(id.to_string(), value);
    }

    pub fn get(&self, namespace: &str, id: &str) -> Option<&Value> {
        self.values
            .get(namespace)
            .and_then(|ids| ids.get(id))
            .and_then(Option::as_ref)
    }

    pub fn take(&mut self, namespace: &str, id: &str) -> Option<Value> {
        self.values
            .get_mut(namespace)
            .and_then(|ids| ids.remove(id))
            .flatten()
    }

    pub fn len(&self) -> usize {
        self.values.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Add/update or remove one of a complex task's markers.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkerUpdate {
    Upsert(TaskMarker),
    Remove(MarkerId),
}

/// What a task hands back to `finish_task`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinishData {
    /// Updated records, or `None` to delete.
    pub mutations: BTreeMap<String, BTreeMap<String, Option<Value>>>,
    pub new_records: BTreeMap<String, BTreeMap<String, Value>>,
    /// Raw tasks to wrap, persist and plan after the commit.
    pub new_tasks: Vec<RawTask>,
    /// `Some` keeps the task planned and re-queues it; `None` means done.
    pub task_state: Option<PlannedTask>,
    pub complex_task_state: Option<Value>,
    pub task_markers: Vec<MarkerUpdate>,
    pub undo_tasks: Vec<RawTask>,
}

impl FinishData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(mut self, namespace: &str, id: impl Into<String>, value: Value) -> Self {
        self.mutations
            .entry(namespace.to_string())
            .or_default()
            .insert(id.into(), Some(value));
        self
    }

    pub fn remove(mut self, namespace: &str, id: impl Into<String>) -> Self {
        self.mutations
            .entry(namespace.to_string())
            .or_default()
            .insert(id.into(), None);
        self
    }

    pub fn add_record(mut self, namespace: &str, id: impl Into<String>, value: Value) -> Self {
        self.new_records
            .entry(namespace.to_string())
            .or_default()
            .insert(id.into(), value);
        self
    }

    pub fn spawn_task(mut self, task: RawTask) -> Self {
        self.new_tasks.push(task);
        self
    }

    pub fn keep_planned(mut self, planned: PlannedTask) -> Self {
        self.task_state = Some(planned);
        self
    }

    pub fn complex_state(mut self, state: Value) -> Self {
        self.complex_task_state = Some(state);
        self
    }

    pub fn upsert_marker(mut self, marker: TaskMarker) -> Self {
        self.task_markers.push(MarkerUpdate::Upsert(marker));
        self
    }

    pub fn remove_marker(mut self, id: MarkerId) -> Self {
        self.task_markers.push(MarkerUpdate::Remove(id));
        self
    }

    pub fn undo_with(mut self, tasks: Vec<RawTask>) -> Self {
        self.undo_tasks = tasks;
        self
    }

    pub fn mutation_count(&self) -> usize {
        self.mutations.values().map(BTreeMap::len).sum::<usize>()
            + self.new_records.values().map(BTreeMap::len).sum::<usize>()
    }
}

/// The task's own record after a finish: `value: None` deletes it.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisedTask {
    pub id: TaskId,
    pub value: Option<WrappedTask>,
}

/// Scheduler-side bookkeeping committed alongside `FinishData`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinishMeta {
    pub revised_task: Option<RevisedTask>,
    pub new_tasks: Vec<WrappedTask>,
}

/// One persisted complex state row as loaded from the store.
///
/// Rows with a `key` belong to a multi-valued state and are assembled into a
/// map keyed by `key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexStateRow {
    pub account_id: Option<AccountId>,
    pub task_type: TaskType,
    #[serde(default)]
    pub key: Option<String>,
    pub value: Value,
}
