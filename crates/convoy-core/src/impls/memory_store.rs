//! InMemoryStore - development and test implementation of the store port.
//!
//! - Records are `serde_json::Value`s keyed by namespace then id.
//! - `begin_mutate` takes a per-record write lock owned by the context's label;
//!   a competing context waits on a `Notify` until `finish_mutate` releases it.
//! - Every committed record change is appended to a change log with its
//!   pre-mutation value, which stands in for the delta notifications a real
//!   store would emit.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::context::ContextInfo;
use crate::domain::{
    AccountId, COMPLEX_STATE_NAMESPACE, ComplexStateRow, FinishData, FinishMeta, ReadRequest,
    ReadResults, TaskId, TaskType, WrappedTask,
};
use crate::error::ConvoyError;
use crate::ports::{PersistedState, Store};

type RecordKey = (String, String);

/// One committed record change.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub namespace: String,
    pub id: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
    /// Label of the committing context.
    pub by: String,
}

#[derive(Default)]
struct Inner {
    records: BTreeMap<String, BTreeMap<String, Value>>,
    tasks: BTreeMap<TaskId, WrappedTask>,
    /// Record -> label of the context holding its write lock.
    locks: HashMap<RecordKey, String>,
    /// Pre-mutation values captured by `begin_mutate`, per context label.
    snapshots: HashMap<String, HashMap<RecordKey, Option<Value>>>,
    changes: Vec<Change>,
    complex_rows: Vec<ComplexStateRow>,
    finish_calls: usize,
    fail_task_writes: bool,
}

impl Inner {
    fn value(&self, namespace: &str, id: &str) -> Option<Value> {
        self.records.get(namespace).and_then(|ns| ns.get(id)).cloned()
    }

    fn write(&mut self, by: &str, namespace: &str, id: &str, after: Option<Value>) {
        let key = (namespace.to_string(), id.to_string());
        let before = self
            .snapshots
            .get(by)
            .and_then(|snap| snap.get(&key).cloned())
            .unwrap_or_else(|| self.value(namespace, id));
        match &after {
            Some(value) => {
                self.records
                    .entry(namespace.to_string())
                    .or_default()
                    .insert(id.to_string(), value.clone());
            }
            None => {
                if let Some(ns) = self.records.get_mut(namespace) {
                    ns.remove(id);
                }
            }
        }
        self.changes.push(Change {
            namespace: key.0,
            id: key.1,
            before,
            after,
            by: by.to_string(),
        });
    }

    /// Take every lock in `request` for `owner`, or none of them.
    fn try_lock(&mut self, owner: &str, request: &ReadRequest) -> Option<ReadResults> {
        let contended = request.iter().any(|(ns, id)| {
            self.locks
                .get(&(ns.to_string(), id.to_string()))
                .is_some_and(|holder| holder != owner)
        });
        if contended {
            return None;
        }
        let mut results = ReadResults::default();
        for (ns, id) in request.iter() {
            let key = (ns.to_string(), id.to_string());
            let current = self.value(ns, id);
            self.locks.insert(key.clone(), owner.to_string());
            self.snapshots
                .entry(owner.to_string())
                .or_default()
                .entry(key)
                .or_insert_with(|| current.clone());
            results.insert(ns, id, current);
        }
        Some(results)
    }

    fn release(&mut self, owner: &str) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, holder| holder != owner);
        self.snapshots.remove(owner);
        before - self.locks.len()
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    unlocked: Notify,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_record(self, namespace: &str, id: &str, value: Value) -> Self {
        self.lock()
            .records
            .entry(namespace.to_string())
            .or_default()
            .insert(id.to_string(), value);
        self
    }

    /// Seed a persisted wrapped task, as if written by an earlier run.
    pub fn with_task(self, task: WrappedTask) -> Self {
        self.lock().tasks.insert(task.id, task);
        self
    }

    /// Seed a complex state row that is not stored as a plain record, such as
    /// one part of a multi-valued state.
    pub fn with_complex_row(self, row: ComplexStateRow) -> Self {
        self.lock().complex_rows.push(row);
        self
    }

    /// Make `add_tasks` fail, to exercise schedule error paths.
    pub fn fail_task_writes(&self, fail: bool) {
        self.lock().fail_task_writes = fail;
    }

    pub fn record(&self, namespace: &str, id: &str) -> Option<Value> {
        self.lock().value(namespace, id)
    }

    pub fn task(&self, id: TaskId) -> Option<WrappedTask> {
        self.lock().tasks.get(&id).cloned()
    }

    pub fn task_count(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn finish_count(&self) -> usize {
        self.lock().finish_calls
    }

    pub fn held_locks(&self) -> usize {
        self.lock().locks.len()
    }

    pub fn changes(&self) -> Vec<Change> {
        self.lock().changes.clone()
    }
}

fn complex_rows_from_records(records: &BTreeMap<String, Value>) -> Vec<ComplexStateRow> {
    records
        .iter()
        .filter_map(|(key, value)| {
            let (account, task_type) = key.split_once('|')?;
            let account_id = (account != "global").then(|| AccountId::new(account));
            Some(ComplexStateRow {
                account_id,
                task_type: TaskType::new(task_type),
                key: None,
                value: value.clone(),
            })
        })
        .collect()
}

#[async_trait]
impl Store for InMemoryStore {
    async fn load(&self) -> Result<PersistedState, ConvoyError> {
        let inner = self.lock();
        let mut complex_states = inner
            .records
            .get(COMPLEX_STATE_NAMESPACE)
            .map(complex_rows_from_records)
            .unwrap_or_default();
        complex_states.extend(inner.complex_rows.iter().cloned());
        Ok(PersistedState {
            tasks: inner.tasks.values().cloned().collect(),
            complex_states,
        })
    }

    async fn add_tasks(&self, tasks: &[WrappedTask]) -> Result<(), ConvoyError> {
        let mut inner = self.lock();
        if inner.fail_task_writes {
            return Err(ConvoyError::store("task writes are disabled"));
        }
        for task in tasks {
            inner.tasks.insert(task.id, task.clone());
        }
        trace!(count = tasks.len(), "added tasks");
        Ok(())
    }

    async fn read(
        &self,
        _ctx: &ContextInfo,
        request: &ReadRequest,
    ) -> Result<ReadResults, ConvoyError> {
        let inner = self.lock();
        let mut results = ReadResults::default();
        for (ns, id) in request.iter() {
            results.insert(ns, id, inner.value(ns, id));
        }
        Ok(results)
    }

    async fn begin_mutate(
        &self,
        ctx: &ContextInfo,
        request: &ReadRequest,
    ) -> Result<ReadResults, ConvoyError> {
        loop {
            let notified = {
                let mut inner = self.lock();
                if let Some(results) = inner.try_lock(&ctx.label, request) {
                    return Ok(results);
                }
                // registered before the lock is dropped, so a release in
                // between still wakes us
                self.unlocked.notified()
            };
            debug!(ctx = %ctx.label, "waiting for record write locks");
            notified.await;
        }
    }

    async fn finish_mutate(
        &self,
        ctx: &ContextInfo,
        data: &FinishData,
        meta: &FinishMeta,
    ) -> Result<(), ConvoyError> {
        let released = {
            let mut inner = self.lock();
            inner.finish_calls += 1;
            let by = ctx.label.as_str();
            for (ns, records) in &data.mutations {
                for (id, value) in records {
                    inner.write(by, ns, id, value.clone());
                }
            }
            for (ns, records) in &data.new_records {
                for (id, value) in records {
                    inner.write(by, ns, id, Some(value.clone()));
                }
            }
            if let Some(revised) = &meta.revised_task {
                match &revised.value {
                    Some(task) => {
                        inner.tasks.insert(revised.id, task.clone());
                    }
                    None => {
                        inner.tasks.remove(&revised.id);
                    }
                }
            }
            for task in &meta.new_tasks {
                inner.tasks.insert(task.id, task.clone());
            }
            inner.release(by)
        };
        if released > 0 {
            self.unlocked.notify_waiters();
        }
        debug!(ctx = %ctx.label, released, "finish_mutate");
        Ok(())
    }
}
