//! Task implementation traits.
//!
//! Two shapes, dispatched explicitly by the registry:
//! - [`SimpleTask`]: stateless. `plan` and an optional `execute`.
//! - [`ComplexTask`]: one instance per account with a persisted state blob
//!   (`Persistent`) and derived in-memory state (`Memory`). Represents pending
//!   work with [`TaskMarker`]s instead of persisted wrapped tasks.
//!
//! Complex tasks publish overlay and trigger callbacks through [`Contributions`],
//! which the registry binds to the live state at bring-up.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::TaskContext;
use crate::domain::{AccountId, FinishData, PlannedTask, RawTask, TaskMarker, TaskType, ThingId};
use crate::error::ConvoyError;
use crate::ports::FoldersView;

/// What a plan/execute call resolves with; surfaced to awaiting callers.
pub type TaskResult = Result<Option<Value>, ConvoyError>;

/// Answers "which resources is this thing parked on?" against the live gate.
pub type BlockedChecker = Arc<dyn Fn(&ThingId) -> Option<Vec<String>> + Send + Sync>;

#[async_trait]
pub trait SimpleTask: Send + Sync + 'static {
    fn task_type(&self) -> TaskType;

    fn priority_tags(&self, _raw: &RawTask) -> Vec<String> {
        Vec::new()
    }

    fn rel_priority(&self, _raw: &RawTask) -> i64 {
        0
    }

    fn resources(&self, _raw: &RawTask) -> Vec<String> {
        Vec::new()
    }

    /// Default planning copies the raw task, decorates it with the hooks above
    /// and keeps it planned.
    async fn plan(&self, ctx: &TaskContext, raw: &RawTask) -> TaskResult {
        let planned = PlannedTask::from_raw(raw)
            .with_priority_tags(self.priority_tags(raw))
            .with_rel_priority(self.rel_priority(raw))
            .with_resources(self.resources(raw));
        ctx.finish_task(FinishData::new().keep_planned(planned)).await?;
        Ok(None)
    }

    /// Tasks that only exist to be planned can leave this alone: the task is
    /// finished with nothing to commit.
    async fn execute(&self, ctx: &TaskContext, _planned: &PlannedTask) -> TaskResult {
        ctx.finish_task(FinishData::new()).await?;
        Ok(None)
    }
}

/// Account a task implementation is brought up for. `account_id: None` is the
/// global sentinel.
#[derive(Clone, Default)]
pub struct AccountBinding {
    pub account_id: Option<AccountId>,
    pub account_type: Option<String>,
    pub account_info: Value,
    pub folders: Option<Arc<dyn FoldersView>>,
}

impl AccountBinding {
    pub fn global() -> Self {
        Self::default()
    }

    pub fn account(account_id: AccountId, account_type: impl Into<String>) -> Self {
        Self {
            account_id: Some(account_id),
            account_type: Some(account_type.into()),
            account_info: Value::Null,
            folders: None,
        }
    }

    pub fn with_info(mut self, info: Value) -> Self {
        self.account_info = info;
        self
    }

    pub fn with_folders(mut self, folders: Arc<dyn FoldersView>) -> Self {
        self.folders = Some(folders);
        self
    }

    pub fn label(&self) -> String {
        match &self.account_id {
            Some(id) => id.to_string(),
            None => "global".to_string(),
        }
    }
}

/// Memory state derived at bring-up plus the markers for work already pending.
pub struct Derived<M> {
    pub memory_state: M,
    pub markers: Vec<TaskMarker>,
}

impl<M> Derived<M> {
    pub fn new(memory_state: M) -> Self {
        Self {
            memory_state,
            markers: Vec::new(),
        }
    }

    pub fn with_markers(mut self, markers: Vec<TaskMarker>) -> Self {
        self.markers = markers;
        self
    }
}

/// Shared handle to one complex task instance's state.
///
/// Guards are plain `std` locks: take them for short synchronous sections and
/// drop them before awaiting.
pub struct ComplexState<P, M> {
    persistent: Arc<RwLock<P>>,
    memory: Arc<RwLock<M>>,
}

impl<P, M> Clone for ComplexState<P, M> {
    fn clone(&self) -> Self {
        Self {
            persistent: Arc::clone(&self.persistent),
            memory: Arc::clone(&self.memory),
        }
    }
}

impl<P, M> ComplexState<P, M> {
    pub fn new(persistent: P, memory: M) -> Self {
        Self {
            persistent: Arc::new(RwLock::new(persistent)),
            memory: Arc::new(RwLock::new(memory)),
        }
    }

    pub fn persistent(&self) -> RwLockReadGuard<'_, P> {
        self.persistent.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn persistent_mut(&self) -> RwLockWriteGuard<'_, P> {
        self.persistent.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn memory(&self) -> RwLockReadGuard<'_, M> {
        self.memory.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn memory_mut(&self) -> RwLockWriteGuard<'_, M> {
        self.memory.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P: Serialize, M> ComplexState<P, M> {
    /// Serialized persistent state, ready for `FinishData::complex_state`.
    pub fn snapshot(&self) -> Result<Value, ConvoyError> {
        Ok(serde_json::to_value(&*self.persistent())?)
    }
}

pub type OverlayFn<P, M> =
    Arc<dyn Fn(&ComplexState<P, M>, &BlockedChecker, &str) -> Option<Value> + Send + Sync>;

pub type TriggerFn<P, M> = Arc<dyn Fn(&ComplexState<P, M>, &Value) + Send + Sync>;

/// Overlay and trigger callbacks a complex task contributes.
pub struct Contributions<P, M> {
    pub(crate) overlays: Vec<(String, OverlayFn<P, M>)>,
    pub(crate) triggers: Vec<(String, TriggerFn<P, M>)>,
}

impl<P, M> Default for Contributions<P, M> {
    fn default() -> Self {
        Self {
            overlays: Vec::new(),
            triggers: Vec::new(),
        }
    }
}

impl<P, M> Contributions<P, M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contribute overlay data for records in `namespace`.
    pub fn overlay<F>(mut self, namespace: &str, f: F) -> Self
    where
        F: Fn(&ComplexState<P, M>, &BlockedChecker, &str) -> Option<Value> + Send + Sync + 'static,
    {
        self.overlays.push((namespace.to_string(), Arc::new(f)));
        self
    }

    /// Handle the store trigger event `event`.
    pub fn trigger<F>(mut self, event: &str, f: F) -> Self
    where
        F: Fn(&ComplexState<P, M>, &Value) + Send + Sync + 'static,
    {
        self.triggers.push((event.to_string(), Arc::new(f)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty() && self.triggers.is_empty()
    }
}

#[async_trait]
pub trait ComplexTask: Send + Sync + 'static {
    type Persistent: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Memory: Send + Sync + 'static;

    fn task_type(&self) -> TaskType;

    fn init_persistent_state(&self) -> Self::Persistent;

    async fn derive_memory_state(
        &self,
        persistent: &Self::Persistent,
        binding: &AccountBinding,
    ) -> Result<Derived<Self::Memory>, ConvoyError>;

    async fn plan(
        &self,
        ctx: &TaskContext,
        state: &ComplexState<Self::Persistent, Self::Memory>,
        raw: &RawTask,
    ) -> TaskResult;

    async fn execute(
        &self,
        ctx: &TaskContext,
        state: &ComplexState<Self::Persistent, Self::Memory>,
        marker: &TaskMarker,
    ) -> TaskResult;

    /// `None` means this task does not answer consultations.
    fn consult(
        &self,
        _ctx: &TaskContext,
        _state: &ComplexState<Self::Persistent, Self::Memory>,
        _args: &Value,
    ) -> Option<Result<Value, ConvoyError>> {
        None
    }

    fn contributions(&self) -> Contributions<Self::Persistent, Self::Memory> {
        Contributions::new()
    }
}
