//! Engine state shared by the driving loop, the public API and task contexts.
//!
//! All queue, gate and group state lives in one [`Engine`] behind a plain
//! mutex. It is only ever locked for short synchronous sections and never
//! across an `.await`, which is what makes bulk reprioritization and
//! revocation atomic with respect to the loop.
//!
//! The loop is single-flight: at most one plan or one execute call is in
//! flight at any instant.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Notify, broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::config::{LoopPolicy, SchedulerConfig};
use crate::context::TaskContext;
use crate::domain::{
    AccountId, GroupId, RawTask, SchedulerEvent, TaskId, TaskIdAllocator, TaskThing, ThingId,
    WrappedTask,
};
use crate::error::ConvoyError;
use crate::group::{GroupCompletion, ResolvedGroup, TaskGroupTracker};
use crate::observability::QueueCounts;
use crate::ports::{Lease, LeaseProvider, OverlaySink, Store};
use crate::queue::ResourceGate;
use crate::registry::{Dispatch, TaskTypeRegistry};

pub(crate) type ResultWaiter = oneshot::Sender<Option<Value>>;
pub(crate) type UndoWaiter = oneshot::Sender<Vec<RawTask>>;

/// What a schedule call waits for once its batch is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Await {
    Nothing,
    Planned,
    Executed,
    Undo,
}

/// A schedule batch with ids allocated and its waiters registered.
pub(crate) struct Prepared {
    pub(crate) tasks: Vec<WrappedTask>,
    pub(crate) results: Vec<oneshot::Receiver<Option<Value>>>,
    pub(crate) undo: Vec<oneshot::Receiver<Vec<RawTask>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Turn {
    Plan,
    Execute,
}

enum Work {
    Plan(WrappedTask),
    Execute(TaskThing),
}

pub(crate) struct Engine {
    ids: TaskIdAllocator,
    to_plan: VecDeque<WrappedTask>,
    pub(crate) gate: ResourceGate,
    groups: TaskGroupTracker,
    /// Schedule batches allocated but not yet durably recorded.
    pending_plan_writes: usize,
    planned_waiters: HashMap<TaskId, ResultWaiter>,
    executed_waiters: HashMap<TaskId, ResultWaiter>,
    undo_waiters: HashMap<TaskId, UndoWaiter>,
    last_turn: Option<Turn>,
    /// Set once work is accepted; cleared when the loop reports a drain.
    busy: bool,
    /// Set by shutdown; no new batches or waiters are accepted afterwards.
    closed: bool,
}

impl Engine {
    pub(crate) fn new(config: &SchedulerConfig) -> Self {
        Self {
            ids: TaskIdAllocator::from_clock(),
            to_plan: VecDeque::new(),
            gate: ResourceGate::with_available(config.initial_resources.iter().cloned()),
            groups: TaskGroupTracker::new(),
            pending_plan_writes: 0,
            planned_waiters: HashMap::new(),
            executed_waiters: HashMap::new(),
            undo_waiters: HashMap::new(),
            last_turn: None,
            busy: false,
            closed: false,
        }
    }

    fn next_work(&mut self, policy: LoopPolicy) -> Option<Work> {
        let plan_first = match (policy, self.last_turn) {
            (LoopPolicy::PlanFirst, _) => true,
            (LoopPolicy::Alternate, Some(Turn::Plan)) => false,
            (LoopPolicy::Alternate, _) => true,
        };
        let work = if plan_first {
            self.to_plan
                .pop_front()
                .map(Work::Plan)
                .or_else(|| self.gate.pop_highest_priority().map(Work::Execute))
        } else {
            self.gate
                .pop_highest_priority()
                .map(Work::Execute)
                .or_else(|| self.to_plan.pop_front().map(Work::Plan))
        };
        if let Some(work) = &work {
            self.busy = true;
            self.last_turn = Some(match work {
                Work::Plan(_) => Turn::Plan,
                Work::Execute(_) => Turn::Execute,
            });
        }
        work
    }

    fn is_idle(&self) -> bool {
        self.to_plan.is_empty() && self.gate.queue().is_empty() && self.pending_plan_writes == 0
    }

    fn wrap(&mut self, raws: &[RawTask], ephemeral: bool) -> Vec<WrappedTask> {
        raws.iter()
            .map(|raw| {
                let wrapped = WrappedTask::new(self.ids.allocate(), raw.clone());
                if ephemeral { wrapped.ephemeral() } else { wrapped }
            })
            .collect()
    }

    /// Allocate ids for a schedule batch and count its pending write.
    fn prepare(&mut self, raws: &[RawTask], ephemeral: bool) -> Vec<WrappedTask> {
        let wrapped = self.wrap(raws, ephemeral);
        if wrapped.iter().any(|t| !t.nonpersistent) {
            self.pending_plan_writes += 1;
            // the lease taken for this write is released by the next drain
            self.busy = true;
        }
        wrapped
    }

    fn register(&mut self, ids: &[TaskId], what: Await) -> Prepared {
        let mut prepared = Prepared {
            tasks: Vec::new(),
            results: Vec::new(),
            undo: Vec::new(),
        };
        for id in ids {
            match what {
                Await::Nothing => {}
                Await::Planned | Await::Executed => {
                    let (tx, rx) = oneshot::channel();
                    let waiters = if what == Await::Planned {
                        &mut self.planned_waiters
                    } else {
                        &mut self.executed_waiters
                    };
                    waiters.insert(*id, tx);
                    prepared.results.push(rx);
                }
                Await::Undo => {
                    let (tx, rx) = oneshot::channel();
                    self.undo_waiters.insert(*id, tx);
                    prepared.undo.push(rx);
                }
            }
        }
        prepared
    }

    fn drop_waiters(&mut self, ids: &[TaskId]) {
        for id in ids {
            self.planned_waiters.remove(id);
            self.executed_waiters.remove(id);
            self.undo_waiters.remove(id);
        }
    }
}

/// Holds one count of `pending_plan_writes` for a batch being written.
/// Dropping it gives the count back, including when the caller abandons the
/// schedule future mid-write; an unrecorded batch also loses its waiters.
struct PendingWrite<'a> {
    shared: &'a Shared,
    ids: &'a [TaskId],
    recorded: bool,
}

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        {
            let mut engine = self.shared.engine();
            engine.pending_plan_writes = engine.pending_plan_writes.saturating_sub(1);
            if !self.recorded {
                engine.drop_waiters(self.ids);
            }
        }
        self.shared.wake();
    }
}

/// Follow-on tasks of resolved groups, ready to be recorded.
struct FollowOns {
    why: String,
    tasks: Vec<WrappedTask>,
}

pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) registry: TaskTypeRegistry,
    pub(crate) overlays: Option<Arc<dyn OverlaySink>>,
    engine: Arc<Mutex<Engine>>,
    lease_provider: Arc<dyn LeaseProvider>,
    lease: Mutex<Option<Box<dyn Lease>>>,
    kick: Notify,
    events: broadcast::Sender<SchedulerEvent>,
}

impl Shared {
    pub(crate) fn new(
        config: SchedulerConfig,
        store: Arc<dyn Store>,
        registry: TaskTypeRegistry,
        overlays: Option<Arc<dyn OverlaySink>>,
        engine: Arc<Mutex<Engine>>,
        lease_provider: Arc<dyn LeaseProvider>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            store,
            registry,
            overlays,
            engine,
            lease_provider,
            lease: Mutex::new(None),
            kick: Notify::new(),
            events,
        }
    }

    pub(crate) fn engine(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SchedulerEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    fn wake(&self) {
        self.kick.notify_one();
    }

    // ---- scheduling ----------------------------------------------------

    /// Wrap raw tasks spawned by a finishing context. They are recorded by
    /// that context's commit.
    pub(crate) fn wrap_tasks(&self, raws: &[RawTask]) -> Vec<WrappedTask> {
        if raws.is_empty() {
            return Vec::new();
        }
        self.engine().wrap(raws, false)
    }

    /// Allocate ids for a schedule batch and register its waiters, or refuse
    /// once the scheduler has shut down.
    pub(crate) fn prepare(
        &self,
        raws: &[RawTask],
        ephemeral: bool,
        what: Await,
    ) -> Result<Prepared, ConvoyError> {
        let mut engine = self.engine();
        if engine.closed {
            return Err(ConvoyError::Shutdown);
        }
        let tasks = engine.prepare(raws, ephemeral);
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        let mut prepared = engine.register(&ids, what);
        prepared.tasks = tasks;
        Ok(prepared)
    }

    /// Durably record a prepared batch, then hand it to the loop for planning.
    pub(crate) async fn commit(
        &self,
        wrapped: Vec<WrappedTask>,
        why: &str,
    ) -> Result<Vec<TaskId>, ConvoyError> {
        let ids: Vec<TaskId> = wrapped.iter().map(|t| t.id).collect();
        if wrapped.is_empty() {
            return Ok(ids);
        }
        self.ensure_lease(why);

        let persistent: Vec<WrappedTask> =
            wrapped.iter().filter(|t| !t.nonpersistent).cloned().collect();
        let mut pending = (!persistent.is_empty()).then(|| PendingWrite {
            shared: self,
            ids: &ids,
            recorded: false,
        });
        if pending.is_some()
            && let Err(err) = self.store.add_tasks(&persistent).await
        {
            drop(pending);
            error!(why, count = ids.len(), error = %err, "failed to record scheduled tasks");
            return Err(ConvoyError::Persist(err.to_string()));
        }

        debug!(why, count = ids.len(), "scheduled tasks");
        self.enqueue_for_planning(wrapped, None);
        if let Some(pending) = pending.as_mut() {
            pending.recorded = true;
        }
        drop(pending);
        Ok(ids)
    }

    pub(crate) fn enqueue_for_planning(&self, tasks: Vec<WrappedTask>, origin: Option<&ThingId>) {
        if tasks.is_empty() {
            return;
        }
        {
            let mut engine = self.engine();
            for task in tasks {
                let id = task.id;
                engine.groups.will_plan(&ThingId::Task(id), origin);
                engine.to_plan.push_back(task);
                self.emit(SchedulerEvent::WillPlan {
                    id,
                    origin: origin.cloned(),
                });
            }
        }
        self.ensure_lease("enqueue");
        self.wake();
    }

    /// Pass planned things and markers through the gate.
    pub(crate) fn queue_things(&self, things: Vec<TaskThing>, origin: Option<&ThingId>) {
        if things.is_empty() {
            return;
        }
        {
            let mut engine = self.engine();
            for thing in things {
                let id = thing.id();
                engine.groups.will_execute(&id, origin);
                engine.gate.own_or_relay(thing);
                self.emit(SchedulerEvent::WillExecute {
                    id,
                    origin: origin.cloned(),
                });
            }
        }
        self.ensure_lease("queue");
        self.wake();
    }

    /// Drop a queued or parked thing. A thing that is currently running is
    /// not found here and finishes normally.
    pub(crate) fn remove_thing(self: &Arc<Self>, id: &ThingId) {
        let follow_ons = {
            let mut engine = self.engine();
            if engine.gate.remove_thing(id).is_none() {
                return;
            }
            let resolved = engine.groups.abandon(id);
            self.collect_follow_ons(&mut engine, resolved)
        };
        self.spawn_follow_ons(follow_ons);
    }

    /// Remove every pending thing matching `filter`, from both the plan queue
    /// and the gate. Returns how many were removed.
    pub(crate) fn remove_pending<F>(self: &Arc<Self>, mut filter: F) -> usize
    where
        F: FnMut(Option<&AccountId>) -> bool,
    {
        let (count, follow_ons) = {
            let mut engine = self.engine();
            let mut dropped: Vec<ThingId> = Vec::new();
            engine.to_plan.retain(|t| {
                let keep = !filter(t.account_id());
                if !keep {
                    dropped.push(ThingId::Task(t.id));
                }
                keep
            });
            dropped.extend(
                engine
                    .gate
                    .remove_matching(|t| filter(t.account_id()))
                    .iter()
                    .map(TaskThing::id),
            );
            let mut resolved = Vec::new();
            for id in &dropped {
                resolved.extend(engine.groups.abandon(id));
                if let Some(task_id) = id.as_task() {
                    engine.drop_waiters(&[task_id]);
                }
            }
            (dropped.len(), self.collect_follow_ons(&mut engine, resolved))
        };
        self.spawn_follow_ons(follow_ons);
        count
    }

    fn collect_follow_ons(
        &self,
        engine: &mut Engine,
        resolved: Vec<ResolvedGroup>,
    ) -> Vec<FollowOns> {
        resolved
            .into_iter()
            .filter(|g| !g.follow_ons.is_empty())
            .map(|g| {
                info!(
                    group = %g.name,
                    follow_ons = g.follow_ons.len(),
                    "scheduling group follow-on tasks"
                );
                FollowOns {
                    why: format!("deferred-group:{}", g.name),
                    tasks: engine.prepare(&g.follow_ons, false),
                }
            })
            .collect()
    }

    fn spawn_follow_ons(self: &Arc<Self>, batches: Vec<FollowOns>) {
        for batch in batches {
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = shared.commit(batch.tasks, &batch.why).await {
                    warn!(why = %batch.why, error = %err, "follow-on scheduling failed");
                }
            });
        }
    }

    pub(crate) fn deliver_undo(&self, origin: &ThingId, tasks: Vec<RawTask>) {
        if let Some(id) = origin.as_task()
            && let Some(waiter) = self.engine().undo_waiters.remove(&id)
        {
            let _ = waiter.send(tasks.clone());
        }
        self.emit(SchedulerEvent::UndoTasks {
            id: origin.clone(),
            tasks,
        });
    }

    fn finish_planning(self: &Arc<Self>, id: TaskId, result: Option<Value>, requeued: bool) {
        let follow_ons = {
            let mut engine = self.engine();
            let resolved = engine.groups.planned(&ThingId::Task(id));
            if let Some(waiter) = engine.planned_waiters.remove(&id) {
                let _ = waiter.send(result.clone());
            }
            if !requeued {
                // concluded at planning time; nothing will execute
                if let Some(waiter) = engine.executed_waiters.remove(&id) {
                    let _ = waiter.send(None);
                }
                if let Some(waiter) = engine.undo_waiters.remove(&id) {
                    let _ = waiter.send(Vec::new());
                }
            }
            self.collect_follow_ons(&mut engine, resolved)
        };
        self.emit(SchedulerEvent::Planned { id, result });
        self.spawn_follow_ons(follow_ons);
    }

    fn finish_execution(self: &Arc<Self>, id: ThingId, result: Option<Value>) {
        let follow_ons = {
            let mut engine = self.engine();
            let resolved = engine.groups.executed(&id);
            if let Some(task_id) = id.as_task() {
                if let Some(waiter) = engine.executed_waiters.remove(&task_id) {
                    let _ = waiter.send(result.clone());
                }
                if let Some(waiter) = engine.undo_waiters.remove(&task_id) {
                    let _ = waiter.send(Vec::new());
                }
            }
            self.collect_follow_ons(&mut engine, resolved)
        };
        self.emit(SchedulerEvent::Executed { id, result });
        self.spawn_follow_ons(follow_ons);
    }

    /// Refuse further schedule calls and fail every outstanding waiter; their
    /// receivers observe a shutdown.
    pub(crate) fn close(&self) {
        let mut engine = self.engine();
        engine.closed = true;
        engine.planned_waiters.clear();
        engine.executed_waiters.clear();
        engine.undo_waiters.clear();
    }

    pub(crate) fn observe_ids<'a>(&self, ids: impl IntoIterator<Item = &'a TaskId>) {
        let mut engine = self.engine();
        for id in ids {
            engine.ids.observe(*id);
        }
    }

    // ---- lease ---------------------------------------------------------

    pub(crate) fn ensure_lease(&self, why: &str) {
        let mut lease = self.lease.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = lease.as_ref().map(|held| held.is_expired());
        match (expired, lease.take()) {
            (Some(false), Some(held)) => {
                held.renew(why);
                *lease = Some(held);
            }
            (_, Some(stale)) => {
                warn!(why, "liveness lease expired while work was pending; reacquiring");
                stale.release("expired");
                *lease = Some(self.lease_provider.acquire(why));
            }
            (_, None) => {
                debug!(why, "acquiring liveness lease");
                *lease = Some(self.lease_provider.acquire(why));
            }
        }
    }

    pub(crate) fn renew_lease(&self, why: &str) {
        let lease = self.lease.lock().unwrap_or_else(PoisonError::into_inner);
        match lease.as_ref() {
            Some(held) if held.is_expired() => {
                warn!(why, "heartbeat on an expired liveness lease");
            }
            Some(held) => held.renew(why),
            None => {}
        }
    }

    fn release_lease(&self, why: &str) {
        let taken = self.lease.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(lease) = taken {
            debug!(why, "releasing liveness lease");
            lease.release(why);
        }
    }

    pub(crate) fn holds_lease(&self) -> bool {
        self.lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|l| !l.is_expired())
    }

    // ---- groups --------------------------------------------------------

    pub(crate) fn ensure_named_group(&self, name: &str, member: &ThingId) -> GroupCompletion {
        self.engine().groups.ensure_named_group(name, member)
    }

    pub(crate) fn root_group_for(&self, member: &ThingId) -> Option<GroupId> {
        self.engine().groups.root_group_for(member)
    }

    pub(crate) fn ensure_root_follow_on(&self, member: &ThingId, task: RawTask) -> GroupId {
        self.engine().groups.ensure_root_follow_on(member, task)
    }

    // ---- resources -----------------------------------------------------

    pub(crate) fn resource_available(&self, resource: &str) -> usize {
        let runnable = self.engine().gate.resource_available(resource);
        if runnable > 0 {
            self.wake();
        }
        runnable
    }

    pub(crate) fn resources_revoked(&self, resources: &[String]) -> usize {
        self.engine().gate.resources_revoked(resources)
    }

    pub(crate) fn restore_resource_after_timeout(
        self: &Arc<Self>,
        resource: &str,
        after: Duration,
    ) {
        let weak: Weak<Shared> = Arc::downgrade(self);
        let name = resource.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(shared) = weak.upgrade() {
                info!(resource = %name, "restoring resource after timeout");
                shared.resource_available(&name);
            }
        });
        self.engine()
            .gate
            .set_restore_timer(resource, timer.abort_handle());
    }

    pub(crate) fn blocking_resources_for(&self, id: &ThingId) -> Option<Vec<String>> {
        self.engine().gate.blocking_resources_for(id)
    }

    pub(crate) fn counts(&self) -> QueueCounts {
        let engine = self.engine();
        QueueCounts {
            to_plan: engine.to_plan.len(),
            runnable: engine.gate.queue().len(),
            parked: engine.gate.parked_count(),
            pending_plan_writes: engine.pending_plan_writes,
            live_groups: engine.groups.live_groups(),
        }
    }

    // ---- loop ----------------------------------------------------------

    pub(crate) async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(policy = ?self.config.loop_policy, "scheduler loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let work = self.engine().next_work(self.config.loop_policy);
            match work {
                Some(Work::Plan(task)) => self.plan_task(task).await,
                Some(Work::Execute(thing)) => self.execute_task(thing).await,
                None => {
                    self.went_idle();
                    tokio::select! {
                        _ = self.kick.notified() => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        info!("scheduler loop stopped");
    }

    fn went_idle(&self) {
        let drained = {
            let mut engine = self.engine();
            if engine.busy && engine.is_idle() {
                engine.busy = false;
                true
            } else {
                false
            }
        };
        if drained {
            debug!("queue drained");
            self.release_lease("drained");
            self.emit(SchedulerEvent::QueueDrained);
        }
    }

    async fn plan_task(self: &Arc<Self>, task: WrappedTask) {
        let id = task.id;
        debug!(
            task_id = %id,
            task_type = %task.task_type(),
            account_id = ?task.account_id(),
            "plan:begin"
        );
        let ctx = TaskContext::for_planning(Arc::clone(self), task.clone());
        let outcome = self.registry.plan(&ctx, &task).await;
        debug!(task_id = %id, outcome = outcome_name(&outcome), "plan:end");
        self.finish_planning(id, outcome.result(), ctx.was_requeued());
    }

    async fn execute_task(self: &Arc<Self>, thing: TaskThing) {
        let id = thing.id();
        debug!(
            task_id = %id,
            task_type = %thing.task_type(),
            account_id = ?thing.account_id(),
            "execute:begin"
        );
        let ctx = TaskContext::for_execution(Arc::clone(self), thing.clone());
        let outcome = self.registry.execute(&ctx, &thing).await;
        debug!(task_id = %id, outcome = outcome_name(&outcome), "execute:end");
        self.finish_execution(id, outcome.result());
    }
}

fn outcome_name(outcome: &Dispatch) -> &'static str {
    match outcome {
        Dispatch::Skipped(_) => "skipped",
        Dispatch::Completed(_) => "completed",
        Dispatch::Failed(_) => "failed",
    }
}
