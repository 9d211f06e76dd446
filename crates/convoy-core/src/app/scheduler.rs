//! Scheduler - the public scheduling API and the driving loop's lifecycle.
//!
//! ```ignore
//! let scheduler = SchedulerBuilder::new(store)
//!     .register_global(TaskImpl::simple(SyncRefresh))?
//!     .build()?;
//! scheduler.restore(&accounts).await?;
//! let results = scheduler
//!     .schedule_tasks_and_await_executed(vec![raw], "user-refresh")
//!     .await?;
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::shared::{Await, Shared};
use crate::domain::{
    AccountId, RawTask, SchedulerEvent, TaskId, TaskMarker, TaskThing, ThingId, WrappedState,
};
use crate::error::ConvoyError;
use crate::observability::QueueCounts;
use crate::queue::TagBoosts;
use crate::registry::AccountBinding;

/// Cheap, cloneable handle to a running scheduler.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

async fn collect(
    receivers: Vec<oneshot::Receiver<Option<Value>>>,
) -> Result<Vec<Option<Value>>, ConvoyError> {
    let mut results = Vec::with_capacity(receivers.len());
    for rx in receivers {
        results.push(rx.await.map_err(|_| ConvoyError::Shutdown)?);
    }
    Ok(results)
}

fn markers_to_things(markers: Vec<TaskMarker>) -> Vec<TaskThing> {
    markers.into_iter().map(TaskThing::Marker).collect()
}

impl Scheduler {
    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared,
            shutdown_tx,
            handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn the driving loop. Idempotent. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            return;
        }
        let rx = self.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(Arc::clone(&self.shared).run(rx)));
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop after the in-flight unit of work. Outstanding awaits
    /// fail with [`ConvoyError::Shutdown`], and so does every schedule call
    /// made afterwards.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            warn!(error = %err, "scheduler loop ended abnormally");
        }
        self.shared.close();
    }

    /// Bring the scheduler up from the store: load persisted tasks and complex
    /// state, bring up task implementations for the global scope and every
    /// account, queue what was pending, then start the loop.
    pub async fn restore(&self, accounts: &[AccountBinding]) -> Result<(), ConvoyError> {
        let persisted = self.shared.store.load().await?;
        let registry = &self.shared.registry;
        registry.initialize_complex_state(persisted.complex_states);

        let mut markers = registry.bring_up_global().await;
        for binding in accounts {
            markers.extend(registry.bring_up_account(binding).await);
        }

        self.shared
            .observe_ids(persisted.tasks.iter().map(|t| &t.id));
        let mut unplanned = Vec::new();
        let mut planned = Vec::new();
        for task in persisted.tasks {
            match task.state {
                WrappedState::Unplanned => unplanned.push(task),
                WrappedState::Planned => planned.push(TaskThing::Task(task)),
                WrappedState::Removed => {}
            }
        }
        info!(
            unplanned = unplanned.len(),
            planned = planned.len(),
            markers = markers.len(),
            accounts = accounts.len(),
            "restored scheduler state"
        );
        self.shared.enqueue_for_planning(unplanned, None);
        self.shared.queue_things(planned, None);
        self.shared.queue_things(markers_to_things(markers), None);

        self.start();
        Ok(())
    }

    /// Durably record `tasks` and queue them for planning.
    pub async fn schedule_tasks(
        &self,
        tasks: Vec<RawTask>,
        why: &str,
    ) -> Result<Vec<TaskId>, ConvoyError> {
        let prepared = self.shared.prepare(&tasks, false, Await::Nothing)?;
        self.shared.commit(prepared.tasks, why).await
    }

    pub async fn schedule_tasks_and_await_planned(
        &self,
        tasks: Vec<RawTask>,
        why: &str,
    ) -> Result<Vec<Option<Value>>, ConvoyError> {
        self.schedule_awaiting(tasks, why, false, Await::Planned).await
    }

    pub async fn schedule_tasks_and_await_executed(
        &self,
        tasks: Vec<RawTask>,
        why: &str,
    ) -> Result<Vec<Option<Value>>, ConvoyError> {
        self.schedule_awaiting(tasks, why, false, Await::Executed).await
    }

    /// Schedule request-scoped tasks that are never written to the store.
    pub async fn schedule_ephemeral_tasks(
        &self,
        tasks: Vec<RawTask>,
        why: &str,
    ) -> Result<Vec<TaskId>, ConvoyError> {
        let prepared = self.shared.prepare(&tasks, true, Await::Nothing)?;
        self.shared.commit(prepared.tasks, why).await
    }

    pub async fn schedule_ephemeral_tasks_and_await_planned(
        &self,
        tasks: Vec<RawTask>,
        why: &str,
    ) -> Result<Vec<Option<Value>>, ConvoyError> {
        self.schedule_awaiting(tasks, why, true, Await::Planned).await
    }

    pub async fn schedule_ephemeral_tasks_and_await_executed(
        &self,
        tasks: Vec<RawTask>,
        why: &str,
    ) -> Result<Vec<Option<Value>>, ConvoyError> {
        self.schedule_awaiting(tasks, why, true, Await::Executed).await
    }

    async fn schedule_awaiting(
        &self,
        tasks: Vec<RawTask>,
        why: &str,
        ephemeral: bool,
        what: Await,
    ) -> Result<Vec<Option<Value>>, ConvoyError> {
        let prepared = self.shared.prepare(&tasks, ephemeral, what)?;
        self.shared.commit(prepared.tasks, why).await?;
        collect(prepared.results).await
    }

    /// Schedule one task and resolve with the undo tasks it produced (empty
    /// when it produced none).
    pub async fn schedule_task_and_await_undo_tasks(
        &self,
        task: RawTask,
        why: &str,
    ) -> Result<Vec<RawTask>, ConvoyError> {
        let prepared = self
            .shared
            .prepare(std::slice::from_ref(&task), false, Await::Undo)?;
        self.shared.commit(prepared.tasks, why).await?;
        match prepared.undo.into_iter().next() {
            Some(rx) => rx.await.map_err(|_| ConvoyError::Shutdown),
            None => Ok(Vec::new()),
        }
    }

    /// Run previously returned undo tasks as ordinary work.
    pub async fn undo(&self, undo_tasks: Vec<RawTask>) -> Result<Vec<TaskId>, ConvoyError> {
        self.schedule_tasks(undo_tasks, "undo").await
    }

    pub fn resource_available(&self, resource: &str) -> usize {
        self.shared.resource_available(resource)
    }

    pub fn resources_revoked<I, S>(&self, resources: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let resources: Vec<String> = resources.into_iter().map(Into::into).collect();
        self.shared.resources_revoked(&resources)
    }

    /// Make `resource` available again after `after` unless it is restored
    /// (or re-scheduled) first.
    pub fn restore_resource_after_timeout(&self, resource: &str, after: Duration) {
        self.shared.restore_resource_after_timeout(resource, after);
    }

    pub fn blocking_resources_for(&self, id: &ThingId) -> Option<Vec<String>> {
        self.shared.blocking_resources_for(id)
    }

    /// Replace `owner`'s tag boosts; `None` clears them.
    pub fn reprioritize_owner_tags(&self, owner: &str, boosts: Option<TagBoosts>) {
        self.shared
            .engine()
            .gate
            .queue_mut()
            .reprioritize_owner_tags(owner, boosts);
    }

    /// Bring up an account that appeared after startup and queue its markers.
    pub async fn account_added(&self, binding: &AccountBinding) {
        let markers = self.shared.registry.bring_up_account(binding).await;
        self.shared.queue_things(markers_to_things(markers), None);
    }

    /// Forget an account: drop its task implementations and every pending
    /// task thing that belongs to it. Returns how many things were dropped.
    pub fn account_removed(&self, account_id: &AccountId) -> usize {
        if !self.shared.registry.drop_account(account_id) {
            warn!(account_id = %account_id, "removing an account that was never brought up");
        }
        let removed = self
            .shared
            .remove_pending(|owner| owner == Some(account_id));
        info!(account_id = %account_id, removed, "account removed");
        removed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.shared.subscribe()
    }

    pub fn counts(&self) -> QueueCounts {
        self.shared.counts()
    }

    pub fn holds_lease(&self) -> bool {
        self.shared.holds_lease()
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.shared.registry.registered_types()
    }
}
