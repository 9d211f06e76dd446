//! Type erasure for complex tasks.
//!
//! `ComplexTask` has associated state types, so it cannot be stored as a trait
//! object directly. [`TypedComplexTask`] wraps a concrete implementation as a
//! [`DynComplexTask`]; bringing it up for an account produces a
//! [`BoundComplexTask`] that owns the account's state and forwards calls with
//! it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::task::{AccountBinding, BlockedChecker, ComplexState, ComplexTask, TaskResult};
use crate::context::TaskContext;
use crate::domain::{RawTask, TaskMarker, TaskType};
use crate::error::ConvoyError;
use crate::ports::{OverlayProvider, TriggerHandler};

/// Result of bringing a complex task up for one account.
pub struct BroughtUp {
    pub instance: Arc<dyn BoundComplexTask>,
    pub markers: Vec<TaskMarker>,
    pub overlays: Vec<(String, OverlayProvider)>,
    pub triggers: Vec<(String, TriggerHandler)>,
}

/// Object-safe view of a registered complex task type.
#[async_trait]
pub trait DynComplexTask: Send + Sync {
    fn task_type(&self) -> TaskType;

    /// Load (or initialise) persistent state, derive memory state and bind
    /// contributions to it.
    async fn bring_up(
        &self,
        saved: Option<Value>,
        binding: &AccountBinding,
        checker: BlockedChecker,
    ) -> Result<BroughtUp, ConvoyError>;
}

/// A complex task bound to one account's state.
#[async_trait]
pub trait BoundComplexTask: Send + Sync {
    async fn plan(&self, ctx: &TaskContext, raw: &RawTask) -> TaskResult;

    async fn execute(&self, ctx: &TaskContext, marker: &TaskMarker) -> TaskResult;

    fn consult(&self, ctx: &TaskContext, args: &Value) -> Option<Result<Value, ConvoyError>>;
}

pub struct TypedComplexTask<T: ComplexTask> {
    inner: Arc<T>,
}

impl<T: ComplexTask> TypedComplexTask<T> {
    pub fn new(task: T) -> Self {
        Self {
            inner: Arc::new(task),
        }
    }
}

#[async_trait]
impl<T: ComplexTask> DynComplexTask for TypedComplexTask<T> {
    fn task_type(&self) -> TaskType {
        self.inner.task_type()
    }

    async fn bring_up(
        &self,
        saved: Option<Value>,
        binding: &AccountBinding,
        checker: BlockedChecker,
    ) -> Result<BroughtUp, ConvoyError> {
        let persistent = match saved {
            Some(value) => match serde_json::from_value::<T::Persistent>(value) {
                Ok(state) => state,
                Err(err) => {
                    warn!(
                        task_type = %self.inner.task_type(),
                        account = %binding.label(),
                        error = %err,
                        "saved complex state unreadable, reinitialising"
                    );
                    self.inner.init_persistent_state()
                }
            },
            None => self.inner.init_persistent_state(),
        };

        let derived = self.inner.derive_memory_state(&persistent, binding).await?;
        let state = ComplexState::new(persistent, derived.memory_state);
        let contributions = self.inner.contributions();

        let overlays = contributions
            .overlays
            .into_iter()
            .map(|(namespace, f)| {
                let state = state.clone();
                let checker = Arc::clone(&checker);
                let provider: OverlayProvider = Arc::new(move |id: &str| f(&state, &checker, id));
                (namespace, provider)
            })
            .collect();
        let triggers = contributions
            .triggers
            .into_iter()
            .map(|(event, f)| {
                let state = state.clone();
                let handler: TriggerHandler = Arc::new(move |payload: &Value| f(&state, payload));
                (event, handler)
            })
            .collect();

        Ok(BroughtUp {
            instance: Arc::new(BoundTyped {
                inner: Arc::clone(&self.inner),
                state,
            }),
            markers: derived.markers,
            overlays,
            triggers,
        })
    }
}

struct BoundTyped<T: ComplexTask> {
    inner: Arc<T>,
    state: ComplexState<T::Persistent, T::Memory>,
}

#[async_trait]
impl<T: ComplexTask> BoundComplexTask for BoundTyped<T> {
    async fn plan(&self, ctx: &TaskContext, raw: &RawTask) -> TaskResult {
        self.inner.plan(ctx, &self.state, raw).await
    }

    async fn execute(&self, ctx: &TaskContext, marker: &TaskMarker) -> TaskResult {
        self.inner.execute(ctx, &self.state, marker).await
    }

    fn consult(&self, ctx: &TaskContext, args: &Value) -> Option<Result<Value, ConvoyError>> {
        self.inner.consult(ctx, &self.state, args)
    }
}
