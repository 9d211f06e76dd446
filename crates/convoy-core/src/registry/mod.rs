//! Task type registry and dispatch.
//!
//! Design:
//! - Implementations are registered during initialization, either globally or
//!   per account type (`imap`, `gmail`, ...). Registration takes `&mut self`.
//! - Bring-up binds implementations to a concrete account (or to the global
//!   sentinel `None`). Complex tasks load their saved state at that point and
//!   get their overlay/trigger contributions wired into the collaborators.
//! - Lookups resolve against the global bindings first, then the account's.
//!   An unknown type or account is a logged local failure, never fatal.
//! - Every plan/execute call runs on its own tokio task so a panicking
//!   implementation is contained; afterwards the context is force-finalized if
//!   the implementation did not finish it.

pub mod at_most_once;
pub mod erased;
pub mod task;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::TaskContext;
use crate::domain::{
    AccountId, ComplexStateRow, PlannedTask, TaskMarker, TaskThing, TaskType, ThingId, WrappedTask,
};
use crate::error::ConvoyError;
use crate::ports::{OverlaySink, TriggerSink};

pub use at_most_once::{
    AtMostOnce, AtMostOnceTask, BinMarkers, BinProgress, BinView, Helped, HelpedOverlays,
    HelpedPlan,
};
pub use erased::{BoundComplexTask, BroughtUp, DynComplexTask, TypedComplexTask};
pub use task::{
    AccountBinding, BlockedChecker, ComplexState, ComplexTask, Contributions, Derived, OverlayFn,
    SimpleTask, TaskResult, TriggerFn,
};

/// A registered implementation: one of the two task shapes.
#[derive(Clone)]
pub enum TaskImpl {
    Simple(Arc<dyn SimpleTask>),
    Complex(Arc<dyn DynComplexTask>),
}

impl TaskImpl {
    pub fn simple<T: SimpleTask>(task: T) -> Self {
        TaskImpl::Simple(Arc::new(task))
    }

    pub fn complex<T: ComplexTask>(task: T) -> Self {
        TaskImpl::Complex(Arc::new(TypedComplexTask::new(task)))
    }

    /// A task that merges repeated requests for the same bin into one marker.
    pub fn at_most_once<T: AtMostOnceTask>(task: T) -> Self {
        Self::complex(AtMostOnce::new(task))
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            TaskImpl::Simple(task) => task.task_type(),
            TaskImpl::Complex(task) => task.task_type(),
        }
    }
}

#[derive(Clone)]
enum BoundTask {
    Simple(Arc<dyn SimpleTask>),
    Complex(Arc<dyn BoundComplexTask>),
}

impl BoundTask {
    fn kind(&self) -> &'static str {
        match self {
            BoundTask::Simple(_) => "simple",
            BoundTask::Complex(_) => "complex",
        }
    }
}

/// Target of a synchronous consultation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsultTarget {
    pub task_type: TaskType,
    pub account_id: Option<AccountId>,
}

impl ConsultTarget {
    pub fn new(task_type: impl Into<TaskType>, account_id: Option<AccountId>) -> Self {
        Self {
            task_type: task_type.into(),
            account_id,
        }
    }
}

/// Outcome of one plan or execute dispatch.
#[derive(Debug)]
pub enum Dispatch {
    /// No implementation could be resolved; nothing ran.
    Skipped(ConvoyError),
    Completed(Option<Value>),
    Failed(ConvoyError),
}

impl Dispatch {
    pub fn result(&self) -> Option<Value> {
        match self {
            Dispatch::Completed(value) => value.clone(),
            Dispatch::Skipped(_) | Dispatch::Failed(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("task type '{0}' is already registered")]
    AlreadyRegistered(String),
}

#[derive(Default)]
struct Tables {
    global_impls: HashMap<TaskType, TaskImpl>,
    account_type_impls: HashMap<String, HashMap<TaskType, TaskImpl>>,
    /// Bound implementations; `None` is the global sentinel.
    bound: HashMap<Option<AccountId>, HashMap<TaskType, BoundTask>>,
    /// Saved complex state waiting for bring-up.
    saved_state: HashMap<Option<AccountId>, HashMap<TaskType, Value>>,
    /// Scopes whose implementations are live; bring-up runs once per scope.
    brought_up: HashSet<Option<AccountId>>,
}

/// Collaborators complex task contributions are wired into.
#[derive(Clone)]
pub(crate) struct Wiring {
    pub overlays: Option<Arc<dyn OverlaySink>>,
    pub triggers: Option<Arc<dyn TriggerSink>>,
    pub checker: BlockedChecker,
}

impl Default for Wiring {
    fn default() -> Self {
        Self {
            overlays: None,
            triggers: None,
            checker: Arc::new(|_: &ThingId| None),
        }
    }
}

#[derive(Default)]
pub struct TaskTypeRegistry {
    tables: RwLock<Tables>,
    wiring: Wiring,
}

impl TaskTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_wiring(&mut self, wiring: Wiring) {
        self.wiring = wiring;
    }

    fn tables_mut(&mut self) -> &mut Tables {
        self.tables.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_tables<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.tables.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn with_tables_mut<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        f(&mut self.tables.write().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn register_global_task_type(&mut self, task: TaskImpl) -> Result<(), RegistryError> {
        let task_type = task.task_type();
        let tables = self.tables_mut();
        if tables.global_impls.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type.to_string()));
        }
        // stateless global tasks need no bring-up to be dispatchable
        if let TaskImpl::Simple(simple) = &task {
            tables
                .bound
                .entry(None)
                .or_default()
                .insert(task_type.clone(), BoundTask::Simple(Arc::clone(simple)));
        }
        tables.global_impls.insert(task_type, task);
        Ok(())
    }

    pub fn register_account_type_task_type(
        &mut self,
        account_type: &str,
        task: TaskImpl,
    ) -> Result<(), RegistryError> {
        let task_type = task.task_type();
        let impls = self
            .tables_mut()
            .account_type_impls
            .entry(account_type.to_string())
            .or_default();
        if impls.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(format!(
                "{account_type}/{task_type}"
            )));
        }
        impls.insert(task_type, task);
        Ok(())
    }

    /// Every registered task type, global and per account type.
    pub fn registered_types(&self) -> Vec<String> {
        self.with_tables(|tables| {
            let mut types: Vec<String> = tables
                .global_impls
                .keys()
                .chain(tables.account_type_impls.values().flat_map(HashMap::keys))
                .map(ToString::to_string)
                .collect();
            types.sort();
            types.dedup();
            types
        })
    }

    /// Stash saved complex state until the owning account is brought up.
    ///
    /// Rows carrying a `key` are parts of a multi-valued state and are
    /// collected into one JSON object keyed by `key`.
    pub fn initialize_complex_state(&self, rows: Vec<ComplexStateRow>) {
        self.with_tables_mut(|tables| {
            for row in rows {
                let by_type = tables.saved_state.entry(row.account_id).or_default();
                match row.key {
                    None => {
                        by_type.insert(row.task_type, row.value);
                    }
                    Some(key) => {
                        let slot = by_type
                            .entry(row.task_type)
                            .or_insert_with(|| Value::Object(Map::new()));
                        if !slot.is_object() {
                            *slot = Value::Object(Map::new());
                        }
                        if let Value::Object(map) = slot {
                            map.insert(key, row.value);
                        }
                    }
                }
            }
        });
    }

    pub async fn bring_up_global(&self) -> Vec<TaskMarker> {
        self.bring_up_account(&AccountBinding::global()).await
    }

    /// Bind the implementations for `binding`'s account type to that account
    /// and return the markers of work its complex tasks already have pending.
    ///
    /// An account that is already up keeps its live state and yields no
    /// markers; drop it first to bring it up afresh.
    pub async fn bring_up_account(&self, binding: &AccountBinding) -> Vec<TaskMarker> {
        let key = binding.account_id.clone();
        let claimed = self.with_tables_mut(|tables| tables.brought_up.insert(key.clone()));
        if !claimed {
            warn!(account = %binding.label(), "account is already brought up");
            return Vec::new();
        }
        let (impls, mut saved) = self.with_tables_mut(|tables| {
            let impls: Option<Vec<TaskImpl>> = match &binding.account_type {
                None => Some(tables.global_impls.values().cloned().collect()),
                Some(account_type) => tables
                    .account_type_impls
                    .get(account_type)
                    .map(|m| m.values().cloned().collect()),
            };
            (impls, tables.saved_state.remove(&key).unwrap_or_default())
        });
        let Some(impls) = impls else {
            warn!(
                account = %binding.label(),
                account_type = ?binding.account_type,
                "no task implementations for account type"
            );
            self.with_tables_mut(|tables| tables.brought_up.remove(&key));
            return Vec::new();
        };

        let mut bound = HashMap::new();
        let mut markers = Vec::new();
        for task in impls {
            let task_type = task.task_type();
            match task {
                TaskImpl::Simple(task) => {
                    bound.insert(task_type, BoundTask::Simple(task));
                }
                TaskImpl::Complex(task) => {
                    let saved = saved.remove(&task_type);
                    match task
                        .bring_up(saved, binding, Arc::clone(&self.wiring.checker))
                        .await
                    {
                        Ok(up) => {
                            self.wire_contributions(&task_type, binding, &up);
                            markers.extend(up.markers);
                            bound.insert(task_type, BoundTask::Complex(up.instance));
                        }
                        Err(err) => {
                            error!(
                                task_type = %task_type,
                                account = %binding.label(),
                                error = %err,
                                "complex task bring-up failed"
                            );
                        }
                    }
                }
            }
        }

        info!(
            account = %binding.label(),
            task_types = bound.len(),
            markers = markers.len(),
            "brought up task implementations"
        );
        self.with_tables_mut(|tables| {
            tables.bound.insert(key, bound);
        });
        markers
    }

    fn wire_contributions(&self, task_type: &TaskType, binding: &AccountBinding, up: &BroughtUp) {
        let name = provider_name(task_type, binding.account_id.as_ref());
        if let Some(overlays) = &self.wiring.overlays {
            for (namespace, provider) in &up.overlays {
                overlays.register_provider(namespace, &name, Arc::clone(provider));
            }
        }
        if let Some(triggers) = &self.wiring.triggers {
            for (event, handler) in &up.triggers {
                triggers.register_trigger(event, &name, Arc::clone(handler));
            }
        }
    }

    /// Forget an account's bound implementations and unregister their
    /// contributions. Returns whether the account was known.
    pub fn drop_account(&self, account_id: &AccountId) -> bool {
        let key = Some(account_id.clone());
        let removed = self.with_tables_mut(|tables| {
            tables.brought_up.remove(&key);
            tables.bound.remove(&key)
        });
        let Some(bound) = removed else {
            return false;
        };
        for (task_type, task) in bound {
            if let BoundTask::Complex(_) = task {
                let name = provider_name(&task_type, Some(account_id));
                if let Some(overlays) = &self.wiring.overlays {
                    overlays.unregister_provider(&name);
                }
                if let Some(triggers) = &self.wiring.triggers {
                    triggers.unregister_triggers(&name);
                }
            }
        }
        true
    }

    fn resolve(
        &self,
        task_type: &TaskType,
        account_id: Option<&AccountId>,
    ) -> Result<BoundTask, ConvoyError> {
        self.with_tables(|tables| {
            if let Some(task) = tables.bound.get(&None).and_then(|m| m.get(task_type)) {
                return Ok(task.clone());
            }
            let Some(account_id) = account_id else {
                return Err(ConvoyError::UnknownTaskType {
                    task_type: task_type.clone(),
                    account_id: None,
                });
            };
            let per_account = tables
                .bound
                .get(&Some(account_id.clone()))
                .ok_or_else(|| ConvoyError::UnknownAccount(account_id.clone()))?;
            per_account
                .get(task_type)
                .cloned()
                .ok_or_else(|| ConvoyError::UnknownTaskType {
                    task_type: task_type.clone(),
                    account_id: Some(account_id.clone()),
                })
        })
    }

    pub async fn plan(&self, ctx: &TaskContext, wrapped: &WrappedTask) -> Dispatch {
        let raw = wrapped.raw_task.clone();
        let bound = match self.resolve(&raw.task_type, raw.account_id.as_ref()) {
            Ok(bound) => bound,
            Err(err) => {
                warn!(task_id = %wrapped.id, error = %err, "plan skipped");
                return Dispatch::Skipped(err);
            }
        };

        let call_ctx = ctx.clone();
        let handle: JoinHandle<TaskResult> = match bound {
            BoundTask::Simple(task) => {
                tokio::spawn(async move { task.plan(&call_ctx, &raw).await })
            }
            BoundTask::Complex(task) => {
                tokio::spawn(async move { task.plan(&call_ctx, &raw).await })
            }
        };
        settle(ctx, "plan", handle).await
    }

    pub async fn execute(&self, ctx: &TaskContext, thing: &TaskThing) -> Dispatch {
        let bound = match self.resolve(thing.task_type(), thing.account_id()) {
            Ok(bound) => bound,
            Err(err) => {
                warn!(thing = %thing.id(), error = %err, "execute skipped");
                return Dispatch::Skipped(err);
            }
        };

        let call_ctx = ctx.clone();
        let handle: JoinHandle<TaskResult> = match (thing, bound) {
            (TaskThing::Task(wrapped), BoundTask::Simple(task)) => {
                let planned = wrapped
                    .planned_task
                    .clone()
                    .unwrap_or_else(|| PlannedTask::from_raw(&wrapped.raw_task));
                tokio::spawn(async move { task.execute(&call_ctx, &planned).await })
            }
            (TaskThing::Marker(marker), BoundTask::Complex(task)) => {
                let marker = marker.clone();
                tokio::spawn(async move { task.execute(&call_ctx, &marker).await })
            }
            (thing, bound) => {
                let err = ConvoyError::KindMismatch {
                    task_type: thing.task_type().clone(),
                    dispatched: if thing.is_marker() { "marker" } else { "wrapped task" },
                    implemented: bound.kind(),
                };
                error!(thing = %thing.id(), error = %err, "execute dispatch mismatch");
                ctx.failsafe_finalize("dispatch mismatch").await;
                return Dispatch::Failed(err);
            }
        };
        settle(ctx, "execute", handle).await
    }

    /// Synchronous cross-task question, answered by a complex task's `consult`.
    pub fn consult(
        &self,
        ctx: &TaskContext,
        target: &ConsultTarget,
        args: &Value,
    ) -> Result<Value, ConvoyError> {
        match self.resolve(&target.task_type, target.account_id.as_ref())? {
            BoundTask::Complex(task) => task
                .consult(ctx, args)
                .unwrap_or_else(|| Err(ConvoyError::NoConsult(target.task_type.clone()))),
            BoundTask::Simple(_) => Err(ConvoyError::NoConsult(target.task_type.clone())),
        }
    }
}

fn provider_name(task_type: &TaskType, account_id: Option<&AccountId>) -> String {
    match account_id {
        Some(account_id) => format!("{task_type}:{account_id}"),
        None => format!("{task_type}:global"),
    }
}

/// Wait for a dispatched call and make sure its context is finished.
async fn settle(
    ctx: &TaskContext,
    phase: &'static str,
    handle: JoinHandle<TaskResult>,
) -> Dispatch {
    let outcome = match handle.await {
        Ok(Ok(value)) => Dispatch::Completed(value),
        Ok(Err(err)) => {
            warn!(
                ctx = ctx.label(),
                task_type = %ctx.info().task_type,
                account_id = ?ctx.account_id(),
                phase,
                error = %err,
                "task implementation failed"
            );
            Dispatch::Failed(err)
        }
        Err(join) => {
            let msg = panic_message(join);
            error!(
                ctx = ctx.label(),
                task_type = %ctx.info().task_type,
                account_id = ?ctx.account_id(),
                phase,
                panic = %msg,
                "task implementation panicked"
            );
            Dispatch::Failed(ConvoyError::Panicked(msg))
        }
    };

    if !ctx.is_finished() {
        let reason = match &outcome {
            Dispatch::Completed(_) => "returned without finishing",
            _ => "failed before finishing",
        };
        ctx.failsafe_finalize(reason).await;
    } else {
        debug!(ctx = ctx.label(), phase, "dispatch settled");
    }
    outcome
}

fn panic_message(join: tokio::task::JoinError) -> String {
    if join.is_cancelled() {
        return "cancelled".to_string();
    }
    let payload = join.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
