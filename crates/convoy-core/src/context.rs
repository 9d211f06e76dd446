//! Per-invocation task context.
//!
//! A fresh context is created for every plan or execute dispatch (and for every
//! subtask). It enforces the store protocol:
//!
//! ```text
//! Prep --begin_mutate--> Mutate --finish_task--> Finishing
//!   \___________________finish_task______________^
//! ```
//!
//! `finish_task` may be called once. If the implementation returns, fails or
//! panics without calling it, the dispatcher runs [`TaskContext::failsafe_finalize`]
//! so the store's write path runs exactly once and write intents are released.
//!
//! `TaskContext` is a cheap handle; clones share the same state.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::app::shared::Shared;
use crate::domain::{
    AccountId, COMPLEX_STATE_NAMESPACE, FinishData, FinishMeta, GroupId, MarkerUpdate, RawTask,
    ReadRequest, ReadResults, RevisedTask, TaskThing, TaskType, ThingId, WrappedTask,
    complex_state_key,
};
use crate::error::ConvoyError;
use crate::group::GroupCompletion;
use crate::registry::ConsultTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Prep,
    Mutate,
    Finishing,
}

impl ContextState {
    fn as_str(self) -> &'static str {
        match self {
            ContextState::Prep => "prep",
            ContextState::Mutate => "mutate",
            ContextState::Finishing => "finishing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Plan,
    Execute,
    Subtask,
}

/// Identity of a context as seen by the store and the logs.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextInfo {
    /// Unique per context: `task-5`, `outbox:A`, `sub:task-5:0`.
    pub label: String,
    pub thing_id: ThingId,
    pub task_type: TaskType,
    pub account_id: Option<AccountId>,
    pub phase: Phase,
}

/// How a context ended, as reported to `on_finish` hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    Completed,
    Failed,
}

/// Runs just before the finish is committed; may add to the finish data.
pub type FinishHook = Box<dyn FnOnce(&mut FinishData, FinishOutcome) + Send>;

enum Subject {
    Planning(WrappedTask),
    Executing(TaskThing),
    Subtask,
}

struct ContextCore {
    info: ContextInfo,
    subject: Subject,
    state: Mutex<ContextState>,
    hooks: Mutex<Vec<FinishHook>>,
    subtask_counter: AtomicU32,
    requeued: AtomicBool,
}

#[derive(Clone)]
pub struct TaskContext {
    shared: Arc<Shared>,
    core: Arc<ContextCore>,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("info", &self.core.info)
            .field("state", &self.state())
            .finish()
    }
}

impl TaskContext {
    pub(crate) fn for_planning(shared: Arc<Shared>, wrapped: WrappedTask) -> Self {
        let info = ContextInfo {
            label: wrapped.id.to_string(),
            thing_id: ThingId::Task(wrapped.id),
            task_type: wrapped.task_type().clone(),
            account_id: wrapped.account_id().cloned(),
            phase: Phase::Plan,
        };
        Self::with_subject(shared, info, Subject::Planning(wrapped))
    }

    pub(crate) fn for_execution(shared: Arc<Shared>, thing: TaskThing) -> Self {
        let info = ContextInfo {
            label: thing.id().to_string(),
            thing_id: thing.id(),
            task_type: thing.task_type().clone(),
            account_id: thing.account_id().cloned(),
            phase: Phase::Execute,
        };
        Self::with_subject(shared, info, Subject::Executing(thing))
    }

    fn with_subject(shared: Arc<Shared>, info: ContextInfo, subject: Subject) -> Self {
        Self {
            shared,
            core: Arc::new(ContextCore {
                info,
                subject,
                state: Mutex::new(ContextState::Prep),
                hooks: Mutex::new(Vec::new()),
                subtask_counter: AtomicU32::new(0),
                requeued: AtomicBool::new(false),
            }),
        }
    }

    pub fn info(&self) -> &ContextInfo {
        &self.core.info
    }

    pub fn id(&self) -> &ThingId {
        &self.core.info.thing_id
    }

    pub fn label(&self) -> &str {
        &self.core.info.label
    }

    pub fn account_id(&self) -> Option<&AccountId> {
        self.core.info.account_id.as_ref()
    }

    pub fn is_planning(&self) -> bool {
        self.core.info.phase == Phase::Plan
    }

    pub fn state(&self) -> ContextState {
        *self.core.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_finished(&self) -> bool {
        self.state() == ContextState::Finishing
    }

    /// Whether finishing handed the task back to the gate for execution.
    pub(crate) fn was_requeued(&self) -> bool {
        self.core.requeued.load(Ordering::Acquire)
    }

    /// Non-exclusive batch read. Values must not be mutated and written back.
    pub async fn read(&self, request: &ReadRequest) -> Result<ReadResults, ConvoyError> {
        self.shared.store.read(self.info(), request).await
    }

    pub async fn read_single(
        &self,
        namespace: &str,
        id: &str,
    ) -> Result<Option<Value>, ConvoyError> {
        let mut results = self.read(&ReadRequest::single(namespace, id)).await?;
        Ok(results.take(namespace, id))
    }

    /// Take write intent on `request` and return the current values.
    /// Only legal from `Prep`.
    pub async fn begin_mutate(&self, request: &ReadRequest) -> Result<ReadResults, ConvoyError> {
        self.transition("begin_mutate", ContextState::Prep, ContextState::Mutate)?;
        self.shared.store.begin_mutate(self.info(), request).await
    }

    /// Extend the write intent of a context already in `Mutate`.
    pub async fn mutate_more(&self, request: &ReadRequest) -> Result<ReadResults, ConvoyError> {
        self.transition("mutate_more", ContextState::Mutate, ContextState::Mutate)?;
        self.shared.store.begin_mutate(self.info(), request).await
    }

    pub async fn mutate_single(
        &self,
        namespace: &str,
        id: &str,
    ) -> Result<Option<Value>, ConvoyError> {
        let mut results = self.begin_mutate(&ReadRequest::single(namespace, id)).await?;
        Ok(results.take(namespace, id))
    }

    fn transition(
        &self,
        op: &'static str,
        from: ContextState,
        to: ContextState,
    ) -> Result<(), ConvoyError> {
        let mut state = self.core.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(ConvoyError::IllegalTransition {
                op,
                state: state.as_str(),
            });
        }
        *state = to;
        Ok(())
    }

    /// Register a hook that sees the finish data (and whether the task failed)
    /// right before it is committed.
    pub fn on_finish<F>(&self, hook: F)
    where
        F: FnOnce(&mut FinishData, FinishOutcome) + Send + 'static,
    {
        self.core
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(hook));
    }

    fn take_hooks(&self) -> Vec<FinishHook> {
        std::mem::take(&mut *self.core.hooks.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Commit the task's results. Legal once, from `Prep` or `Mutate`.
    pub async fn finish_task(&self, mut data: FinishData) -> Result<(), ConvoyError> {
        {
            let mut state = self.core.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == ContextState::Finishing {
                return Err(ConvoyError::AlreadyFinishing(self.label().to_string()));
            }
            *state = ContextState::Finishing;
        }
        for hook in self.take_hooks() {
            hook(&mut data, FinishOutcome::Completed);
        }

        let origin = self.id().clone();
        let mut meta = FinishMeta::default();

        let own_task = match &self.core.subject {
            Subject::Planning(wrapped) | Subject::Executing(TaskThing::Task(wrapped)) => {
                Some(wrapped)
            }
            Subject::Executing(TaskThing::Marker(_)) | Subject::Subtask => None,
        };
        if let Some(wrapped) = own_task {
            let value = match &data.task_state {
                Some(planned) => {
                    let mut revised = wrapped.clone();
                    revised.mark_planned(planned.clone());
                    self.core.requeued.store(true, Ordering::Release);
                    self.shared
                        .queue_things(vec![TaskThing::Task(revised.clone())], Some(&origin));
                    Some(revised)
                }
                None => None,
            };
            if !wrapped.nonpersistent {
                meta.revised_task = Some(RevisedTask {
                    id: wrapped.id,
                    value,
                });
            }
        }

        if let Some(state) = &data.complex_task_state {
            let key = complex_state_key(self.account_id(), &self.core.info.task_type);
            data.mutations
                .entry(COMPLEX_STATE_NAMESPACE.to_string())
                .or_default()
                .insert(key, Some(state.clone()));
        }

        for update in &data.task_markers {
            match update {
                MarkerUpdate::Upsert(marker) => {
                    self.shared
                        .queue_things(vec![TaskThing::Marker(marker.clone())], Some(&origin));
                }
                MarkerUpdate::Remove(id) => {
                    self.shared.remove_thing(&ThingId::Marker(id.clone()));
                }
            }
        }

        meta.new_tasks = self.shared.wrap_tasks(&data.new_tasks);

        if !data.undo_tasks.is_empty() {
            self.shared.deliver_undo(&origin, data.undo_tasks.clone());
        }

        debug!(
            ctx = self.label(),
            mutations = data.mutation_count(),
            new_tasks = meta.new_tasks.len(),
            "finish_task"
        );
        self.shared
            .store
            .finish_mutate(self.info(), &data, &meta)
            .await?;

        if !meta.new_tasks.is_empty() {
            self.shared.enqueue_for_planning(meta.new_tasks, Some(&origin));
        }
        Ok(())
    }

    /// Force the context through `finish_task` after the implementation failed
    /// to do so. Hooks are told the task failed. No-op once finishing.
    pub(crate) async fn failsafe_finalize(&self, reason: &str) {
        if self.is_finished() {
            return;
        }
        warn!(
            ctx = self.label(),
            task_type = %self.core.info.task_type,
            account_id = ?self.account_id(),
            reason,
            "failsafe finalize"
        );
        let mut data = FinishData::default();
        for hook in self.take_hooks() {
            hook(&mut data, FinishOutcome::Failed);
        }
        if let Err(err) = self.finish_task(data).await {
            error!(ctx = self.label(), error = %err, "failsafe finalize could not commit");
        }
    }

    fn subtask(&self) -> TaskContext {
        let n = self.core.subtask_counter.fetch_add(1, Ordering::Relaxed);
        let info = ContextInfo {
            label: format!("sub:{}:{n}", self.label()),
            phase: Phase::Subtask,
            ..self.core.info.clone()
        };
        Self::with_subject(self.shared.clone(), info, Subject::Subtask)
    }

    /// Run `f` with a nested context sharing this task's identity, typically
    /// to lock, write and release a record without holding it for the whole
    /// task. The nested context is finalized if `f` does not finish it.
    pub async fn spawn_subtask<A, R, F, Fut>(&self, f: F, arg: A) -> Result<R, ConvoyError>
    where
        F: FnOnce(TaskContext, A) -> Fut + Send,
        A: Send,
        Fut: Future<Output = Result<R, ConvoyError>> + Send + 'static,
        R: Send + 'static,
    {
        let sub = self.subtask();
        debug!(ctx = sub.label(), "subtask:begin");
        let result = match tokio::spawn(f(sub.clone(), arg)).await {
            Ok(result) => result,
            Err(join) => Err(ConvoyError::Panicked(join.to_string())),
        };
        if !sub.is_finished() {
            sub.failsafe_finalize("subtask returned without finishing").await;
        }
        debug!(ctx = sub.label(), ok = result.is_ok(), "subtask:end");
        result
    }

    /// Lock one record in a subtask, replace it with `f(current)` and commit.
    /// `f` returning `None` leaves the record untouched.
    pub async fn spawn_simple_mutation_subtask<F>(
        &self,
        namespace: &str,
        id: &str,
        f: F,
    ) -> Result<Option<Value>, ConvoyError>
    where
        F: FnOnce(Option<Value>) -> Option<Value> + Send + 'static,
    {
        let target = (namespace.to_string(), id.to_string());
        self.spawn_subtask(
            |sub, (namespace, id): (String, String)| async move {
                let current = sub.mutate_single(&namespace, &id).await?;
                let next = f(current);
                let data = match &next {
                    Some(value) => FinishData::new().update(&namespace, id.clone(), value.clone()),
                    None => FinishData::new(),
                };
                sub.finish_task(data).await?;
                Ok(next)
            },
            target,
        )
        .await
    }

    pub fn announce_overlay_change(&self, namespace: &str, id: &str) {
        if let Some(overlays) = &self.shared.overlays {
            overlays.announce_update(namespace, id);
        }
    }

    /// Join (creating if needed) the named group. Tasks this one spawns join it too.
    pub fn track_in_group(&self, name: &str) -> GroupCompletion {
        self.shared.ensure_named_group(name, self.id())
    }

    pub fn root_task_group_id(&self) -> Option<GroupId> {
        self.shared.root_group_for(self.id())
    }

    /// Schedule `task` once this task's root group fully drains.
    pub fn ensure_follow_on_task_on_group_completion(&self, task: RawTask) -> GroupId {
        self.shared.ensure_root_follow_on(self.id(), task)
    }

    /// Synchronously ask another task implementation a question.
    pub fn consult(&self, target: &ConsultTarget, args: &Value) -> Result<Value, ConvoyError> {
        self.shared.registry.consult(self, target, args)
    }

    /// Renew the liveness lease during long-running work.
    pub fn heartbeat(&self, why: &str) {
        self.shared.renew_lease(why);
    }
}
