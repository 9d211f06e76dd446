use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use convoy_core::app::{LoopPolicy, Scheduler, SchedulerBuilder, SchedulerConfig};
use convoy_core::context::{ContextInfo, TaskContext};
use convoy_core::domain::{
    AccountId, COMPLEX_STATE_NAMESPACE, FinishData, FinishMeta, MarkerId, PlannedTask, RawTask,
    ReadRequest, ReadResults, SchedulerEvent, TaskId, TaskMarker, TaskType, ThingId, WrappedTask,
    resources,
};
use convoy_core::error::ConvoyError;
use convoy_core::impls::{InMemoryStore, RecordingOverlays};
use convoy_core::ports::{PersistedState, Store};
use convoy_core::queue::TagBoosts;
use convoy_core::registry::{
    AccountBinding, AtMostOnceTask, ComplexState, ComplexTask, Contributions, Derived, Helped,
    HelpedOverlays, HelpedPlan, SimpleTask, TaskImpl, TaskResult,
};
use rstest::rstest;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;

async fn eventually<F: Fn() -> bool>(what: &str, f: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !f() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn next_matching<F>(rx: &mut broadcast::Receiver<SchedulerEvent>, pred: F) -> SchedulerEvent
where
    F: Fn(&SchedulerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event feed closed"),
            }
        }
    })
    .await
    .expect("event did not arrive")
}

/// Needs the network; records the refresh in `syncStates`.
struct SyncRefresh;

#[async_trait]
impl SimpleTask for SyncRefresh {
    fn task_type(&self) -> TaskType {
        TaskType::new("sync_refresh")
    }

    fn priority_tags(&self, raw: &RawTask) -> Vec<String> {
        raw.account_id
            .iter()
            .map(|a| format!("acct:{a}"))
            .collect()
    }

    fn resources(&self, _raw: &RawTask) -> Vec<String> {
        vec![resources::ONLINE.to_string()]
    }

    async fn execute(&self, ctx: &TaskContext, planned: &PlannedTask) -> TaskResult {
        let account = planned
            .account_id
            .clone()
            .ok_or_else(|| ConvoyError::implementation("sync_refresh needs an account"))?;
        let fresh = json!({ "fresh": true });
        ctx.finish_task(FinishData::new().update("syncStates", account.as_str(), fresh))
            .await?;
        Ok(Some(json!("synced")))
    }
}

/// Writes a `touched` record named after its context.
struct Touch;

#[async_trait]
impl SimpleTask for Touch {
    fn task_type(&self) -> TaskType {
        TaskType::new("touch")
    }

    async fn execute(&self, ctx: &TaskContext, _planned: &PlannedTask) -> TaskResult {
        ctx.finish_task(FinishData::new().update("touched", ctx.label(), json!(true)))
            .await?;
        Ok(Some(json!(ctx.label())))
    }
}

/// Locks `messages/m1` and then fails without finishing.
struct Flaky {
    panic: bool,
}

#[async_trait]
impl SimpleTask for Flaky {
    fn task_type(&self) -> TaskType {
        TaskType::new(if self.panic { "panicky" } else { "flaky" })
    }

    async fn execute(&self, ctx: &TaskContext, _planned: &PlannedTask) -> TaskResult {
        ctx.mutate_single("messages", "m1").await?;
        if self.panic {
            panic!("lost the connection");
        }
        Err(ConvoyError::implementation("lost the connection"))
    }
}

/// Locks `messages/m1` and marks it read.
struct MarkRead;

#[async_trait]
impl SimpleTask for MarkRead {
    fn task_type(&self) -> TaskType {
        TaskType::new("mark_read")
    }

    async fn execute(&self, ctx: &TaskContext, _planned: &PlannedTask) -> TaskResult {
        let mut message = ctx
            .mutate_single("messages", "m1")
            .await?
            .unwrap_or_else(|| json!({}));
        message["unread"] = json!(false);
        ctx.finish_task(FinishData::new().update("messages", "m1", message))
            .await?;
        Ok(Some(json!("read")))
    }
}

/// Concludes at planning time.
struct PlanOnly;

#[async_trait]
impl SimpleTask for PlanOnly {
    fn task_type(&self) -> TaskType {
        TaskType::new("plan_only")
    }

    async fn plan(&self, ctx: &TaskContext, _raw: &RawTask) -> TaskResult {
        ctx.finish_task(FinishData::new()).await?;
        Ok(Some(json!("nothing to do")))
    }
}

/// Joins group "G", spawns three children and a follow-on for when they drain.
struct FanOut;

#[async_trait]
impl SimpleTask for FanOut {
    fn task_type(&self) -> TaskType {
        TaskType::new("fan_out")
    }

    async fn plan(&self, ctx: &TaskContext, _raw: &RawTask) -> TaskResult {
        let completion = ctx.track_in_group("G");
        let root = ctx.ensure_follow_on_task_on_group_completion(RawTask::new("after"));
        assert_eq!(ctx.root_task_group_id(), Some(completion.group_id()));
        assert_eq!(root, completion.group_id());
        let mut data = FinishData::new();
        for n in 0..3 {
            data = data.spawn_task(RawTask::new("child").with_field("n", json!(n)));
        }
        ctx.finish_task(data).await?;
        Ok(None)
    }
}

struct Child;

#[async_trait]
impl SimpleTask for Child {
    fn task_type(&self) -> TaskType {
        TaskType::new("child")
    }

    async fn execute(&self, ctx: &TaskContext, planned: &PlannedTask) -> TaskResult {
        let n = planned.fields.get("n").cloned().unwrap_or(Value::Null);
        ctx.finish_task(FinishData::new().update("children", n.to_string(), json!(true)))
            .await?;
        Ok(None)
    }
}

/// Records how many children had finished when it ran.
struct After;

#[async_trait]
impl SimpleTask for After {
    fn task_type(&self) -> TaskType {
        TaskType::new("after")
    }

    async fn execute(&self, ctx: &TaskContext, _planned: &PlannedTask) -> TaskResult {
        let mut seen = 0;
        for n in 0..3 {
            if ctx.read_single("children", &n.to_string()).await?.is_some() {
                seen += 1;
            }
        }
        ctx.finish_task(FinishData::new().update("log", "after", json!(seen)))
            .await?;
        Ok(None)
    }
}

/// Produces an undo task when it runs.
struct Archive;

#[async_trait]
impl SimpleTask for Archive {
    fn task_type(&self) -> TaskType {
        TaskType::new("archive")
    }

    async fn execute(&self, ctx: &TaskContext, _planned: &PlannedTask) -> TaskResult {
        ctx.finish_task(FinishData::new().undo_with(vec![RawTask::new("unarchive")]))
            .await?;
        Ok(None)
    }
}

/// Appends its `name` field to a shared log when it runs.
struct Ordered {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl SimpleTask for Ordered {
    fn task_type(&self) -> TaskType {
        TaskType::new("ordered")
    }

    fn priority_tags(&self, raw: &RawTask) -> Vec<String> {
        raw.field("tag")
            .and_then(Value::as_str)
            .map(|t| vec![t.to_string()])
            .unwrap_or_default()
    }

    fn rel_priority(&self, raw: &RawTask) -> i64 {
        raw.field("rel").and_then(Value::as_i64).unwrap_or(0)
    }

    fn resources(&self, _raw: &RawTask) -> Vec<String> {
        vec![resources::ONLINE.to_string()]
    }

    async fn execute(&self, ctx: &TaskContext, planned: &PlannedTask) -> TaskResult {
        let name = planned
            .fields
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.log.lock().unwrap().push(name);
        ctx.finish_task(FinishData::new()).await?;
        Ok(None)
    }
}

#[derive(Default, Serialize, Deserialize)]
struct OutboxState {
    queued: Vec<String>,
}

/// Queues messages for sending; each queued message is a marker gated on `online`.
struct Outbox;

fn outbox_marker(account: &AccountId, message: &str) -> TaskMarker {
    TaskMarker::new(MarkerId::new(format!("outbox:{message}")), "outbox")
        .for_account(account.clone())
        .with_resources([resources::ONLINE])
        .with_field("message", json!(message))
}

#[async_trait]
impl ComplexTask for Outbox {
    type Persistent = OutboxState;
    type Memory = ();

    fn task_type(&self) -> TaskType {
        TaskType::new("outbox")
    }

    fn init_persistent_state(&self) -> OutboxState {
        OutboxState::default()
    }

    async fn derive_memory_state(
        &self,
        persistent: &OutboxState,
        binding: &AccountBinding,
    ) -> Result<Derived<()>, ConvoyError> {
        let Some(account) = &binding.account_id else {
            return Ok(Derived::new(()));
        };
        let markers = persistent
            .queued
            .iter()
            .map(|m| outbox_marker(account, m))
            .collect();
        Ok(Derived::new(()).with_markers(markers))
    }

    async fn plan(
        &self,
        ctx: &TaskContext,
        state: &ComplexState<OutboxState, ()>,
        raw: &RawTask,
    ) -> TaskResult {
        let message = raw
            .field("message")
            .and_then(Value::as_str)
            .ok_or_else(|| ConvoyError::implementation("outbox needs a message"))?
            .to_string();
        let account = raw
            .account_id
            .clone()
            .ok_or_else(|| ConvoyError::implementation("outbox needs an account"))?;
        state.persistent_mut().queued.push(message.clone());
        let snapshot = state.snapshot()?;
        ctx.finish_task(
            FinishData::new()
                .complex_state(snapshot)
                .upsert_marker(outbox_marker(&account, &message)),
        )
        .await?;
        Ok(None)
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        state: &ComplexState<OutboxState, ()>,
        marker: &TaskMarker,
    ) -> TaskResult {
        let message = marker
            .fields
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        state.persistent_mut().queued.retain(|m| m != &message);
        let snapshot = state.snapshot()?;
        ctx.announce_overlay_change("messages", &message);
        ctx.finish_task(FinishData::new().complex_state(snapshot)).await?;
        Ok(Some(json!({ "sent": message })))
    }

    fn contributions(&self) -> Contributions<OutboxState, ()> {
        Contributions::new().overlay("messages", |state: &ComplexState<OutboxState, ()>, checker, id| {
            if !state.persistent().queued.iter().any(|m| m == id) {
                return None;
            }
            let blocked = checker(&ThingId::Marker(MarkerId::new(format!("outbox:{id}"))));
            Some(json!({ "sending": true, "blockedOn": blocked }))
        })
    }
}

/// Refreshes one folder; any number of requests for a folder collapse
/// into a single pending refresh.
struct SyncFolder;

#[async_trait]
impl AtMostOnceTask for SyncFolder {
    fn task_type(&self) -> TaskType {
        TaskType::new("sync_folder")
    }

    fn bin_by(&self) -> Option<&str> {
        Some("folder_id")
    }

    async fn plan(&self, _ctx: &TaskContext, raw: &RawTask) -> Result<HelpedPlan, ConvoyError> {
        let planned = PlannedTask::from_raw(raw).with_resources([resources::ONLINE]);
        Ok(HelpedPlan::marker(planned).with_helped(Helped::new().with_result(json!("planned"))))
    }

    async fn already_planned(
        &self,
        _ctx: &TaskContext,
        _raw: &RawTask,
    ) -> Result<Helped, ConvoyError> {
        Ok(Helped::new().with_result(json!("merged")))
    }

    async fn execute(
        &self,
        _ctx: &TaskContext,
        marker: &TaskMarker,
    ) -> Result<Helped, ConvoyError> {
        let folder = marker
            .fields
            .get("folder_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ConvoyError::implementation("sync_folder needs a folder"))?
            .to_string();
        let synced =
            FinishData::new().update("folders", folder.as_str(), json!({ "synced": true }));
        Ok(Helped::new().with_data(synced).with_result(json!("synced")))
    }

    fn overlays(&self) -> HelpedOverlays {
        HelpedOverlays::new().overlay("folders", |view| {
            (view.marker.is_some() || view.in_progress).then(|| {
                json!({ "inProgress": view.in_progress, "blockedOn": view.blocked_on })
            })
        })
    }

    fn invalidate_overlays(&self, ctx: &TaskContext, bin: &str) {
        ctx.announce_overlay_change("folders", bin);
    }
}

/// Delegates to an [`InMemoryStore`], optionally stalling task writes.
struct StallingStore {
    inner: Arc<InMemoryStore>,
    stall: AtomicBool,
}

impl StallingStore {
    fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            stall: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Store for StallingStore {
    async fn load(&self) -> Result<PersistedState, ConvoyError> {
        self.inner.load().await
    }

    async fn add_tasks(&self, tasks: &[WrappedTask]) -> Result<(), ConvoyError> {
        if self.stall.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        self.inner.add_tasks(tasks).await
    }

    async fn read(
        &self,
        ctx: &ContextInfo,
        request: &ReadRequest,
    ) -> Result<ReadResults, ConvoyError> {
        self.inner.read(ctx, request).await
    }

    async fn begin_mutate(
        &self,
        ctx: &ContextInfo,
        request: &ReadRequest,
    ) -> Result<ReadResults, ConvoyError> {
        self.inner.begin_mutate(ctx, request).await
    }

    async fn finish_mutate(
        &self,
        ctx: &ContextInfo,
        data: &FinishData,
        meta: &FinishMeta,
    ) -> Result<(), ConvoyError> {
        self.inner.finish_mutate(ctx, data, meta).await
    }
}

fn base_builder(store: Arc<dyn Store>) -> SchedulerBuilder {
    SchedulerBuilder::new(store)
        .register_global(TaskImpl::simple(SyncRefresh))
        .unwrap()
        .register_global(TaskImpl::simple(Touch))
        .unwrap()
        .register_global(TaskImpl::simple(MarkRead))
        .unwrap()
        .register_global(TaskImpl::simple(Flaky { panic: false }))
        .unwrap()
        .register_global(TaskImpl::simple(Flaky { panic: true }))
        .unwrap()
        .register_global(TaskImpl::simple(PlanOnly))
        .unwrap()
        .register_global(TaskImpl::simple(FanOut))
        .unwrap()
        .register_global(TaskImpl::simple(Child))
        .unwrap()
        .register_global(TaskImpl::simple(After))
        .unwrap()
        .register_global(TaskImpl::simple(Archive))
        .unwrap()
}

fn started(store: Arc<InMemoryStore>, config: SchedulerConfig) -> Scheduler {
    let scheduler = base_builder(store).config(config).build().unwrap();
    scheduler.start();
    scheduler
}

fn account(id: &str) -> AccountId {
    AccountId::new(id)
}

#[tokio::test]
async fn sync_refresh_waits_for_online() {
    let store = Arc::new(InMemoryStore::new());
    let scheduler = started(Arc::clone(&store), SchedulerConfig::default());
    let mut events = scheduler.subscribe();

    let ids = scheduler
        .schedule_tasks(vec![RawTask::new("sync_refresh").for_account(account("A"))], "test")
        .await
        .unwrap();
    let id = ids[0];
    next_matching(&mut events, |e| {
        matches!(e, SchedulerEvent::Planned { id: p, .. } if *p == id)
    })
    .await;

    let counts = scheduler.counts();
    assert_eq!(counts.parked, 1);
    assert_eq!(counts.runnable, 0);
    assert_eq!(
        scheduler.blocking_resources_for(&ThingId::Task(id)),
        Some(vec!["online".to_string()])
    );
    assert!(store.task(id).is_some_and(|t| t.planned_task.is_some()));

    assert_eq!(scheduler.resource_available("online"), 1);
    assert_eq!(scheduler.resource_available("online"), 0);
    let executed =
        next_matching(&mut events, |e| matches!(e, SchedulerEvent::Executed { .. })).await;
    assert_eq!(
        executed,
        SchedulerEvent::Executed {
            id: ThingId::Task(id),
            result: Some(json!("synced")),
        }
    );
    assert_eq!(store.record("syncStates", "A"), Some(json!({ "fresh": true })));
    assert!(store.task(id).is_none());
    scheduler.shutdown().await;
}

#[rstest]
#[case("flaky")]
#[case("panicky")]
#[tokio::test]
async fn failing_task_is_finalized_once_and_releases_its_locks(#[case] task_type: &str) {
    let store =
        Arc::new(InMemoryStore::new().with_record("messages", "m1", json!({ "unread": true })));
    let scheduler = started(Arc::clone(&store), SchedulerConfig::default());

    let failed = scheduler
        .schedule_tasks_and_await_executed(vec![RawTask::new(task_type)], "test")
        .await
        .unwrap();
    assert_eq!(failed, vec![None]);
    // one finish for planning, one from the failsafe
    assert_eq!(store.finish_count(), 2);
    assert_eq!(store.held_locks(), 0);
    assert_eq!(store.task_count(), 0);

    let read = scheduler
        .schedule_tasks_and_await_executed(vec![RawTask::new("mark_read")], "test")
        .await
        .unwrap();
    assert_eq!(read, vec![Some(json!("read"))]);
    assert_eq!(store.record("messages", "m1"), Some(json!({ "unread": false })));
    assert_eq!(store.finish_count(), 4);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn follow_on_runs_after_the_group_drains() {
    let store = Arc::new(InMemoryStore::new());
    let scheduler = started(Arc::clone(&store), SchedulerConfig::default());

    scheduler
        .schedule_tasks(vec![RawTask::new("fan_out")], "test")
        .await
        .unwrap();
    eventually("follow-on", || store.record("log", "after").is_some()).await;
    assert_eq!(store.record("log", "after"), Some(json!(3)));
    eventually("quiet queue", || scheduler.counts().is_quiet()).await;
    assert_eq!(scheduler.counts().live_groups, 0);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn awaited_results_follow_the_task_lifecycle() {
    let store = Arc::new(InMemoryStore::new());
    let scheduler = started(Arc::clone(&store), SchedulerConfig::default());

    let planned = scheduler
        .schedule_tasks_and_await_planned(vec![RawTask::new("plan_only")], "test")
        .await
        .unwrap();
    assert_eq!(planned, vec![Some(json!("nothing to do"))]);

    // concluded at planning time, so there is no execution to wait for
    let executed = scheduler
        .schedule_tasks_and_await_executed(
            vec![RawTask::new("plan_only"), RawTask::new("touch")],
            "test",
        )
        .await
        .unwrap();
    assert_eq!(executed.len(), 2);
    assert_eq!(executed[0], None);
    let label = executed[1].as_ref().and_then(Value::as_str);
    assert!(label.is_some_and(|s| s.starts_with("task-")));
    scheduler.shutdown().await;
}

#[tokio::test]
async fn unknown_task_types_do_not_stall_the_loop() {
    let store = Arc::new(InMemoryStore::new());
    let scheduler = started(Arc::clone(&store), SchedulerConfig::default());

    let planned = scheduler
        .schedule_tasks_and_await_planned(
            vec![RawTask::new("nope"), RawTask::new("plan_only")],
            "test",
        )
        .await
        .unwrap();
    assert_eq!(planned, vec![None, Some(json!("nothing to do"))]);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn ephemeral_tasks_never_reach_the_store() {
    let store = Arc::new(InMemoryStore::new());
    let scheduler = started(Arc::clone(&store), SchedulerConfig::default());

    let results = scheduler
        .schedule_ephemeral_tasks_and_await_executed(vec![RawTask::new("touch")], "request")
        .await
        .unwrap();
    assert!(results[0].is_some());
    assert_eq!(store.task_count(), 0);
    // records written by the task are still committed
    assert_eq!(store.changes().len(), 1);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn queue_drained_fires_and_the_lease_is_released() {
    let store = Arc::new(InMemoryStore::new());
    let scheduler = started(Arc::clone(&store), SchedulerConfig::default());
    let mut events = scheduler.subscribe();

    scheduler
        .schedule_tasks(vec![RawTask::new("touch")], "test")
        .await
        .unwrap();
    next_matching(&mut events, |e| matches!(e, SchedulerEvent::QueueDrained)).await;
    assert!(!scheduler.holds_lease());
    assert!(scheduler.counts().is_quiet());
    scheduler.shutdown().await;
}

#[tokio::test]
async fn undo_tasks_are_handed_back() {
    let store = Arc::new(InMemoryStore::new());
    let scheduler = started(Arc::clone(&store), SchedulerConfig::default());

    let undo = scheduler
        .schedule_task_and_await_undo_tasks(RawTask::new("archive"), "test")
        .await
        .unwrap();
    assert_eq!(undo.len(), 1);
    assert_eq!(undo[0].task_type, TaskType::new("unarchive"));

    let none = scheduler
        .schedule_task_and_await_undo_tasks(RawTask::new("touch"), "test")
        .await
        .unwrap();
    assert!(none.is_empty());

    let ids = scheduler.undo(undo).await.unwrap();
    assert_eq!(ids.len(), 1);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn restore_queues_persisted_work_before_starting() {
    let touch = RawTask::new("touch");
    let unplanned = WrappedTask::new(TaskId::new(5), touch.clone());
    let mut planned = WrappedTask::new(TaskId::new(6), touch.clone());
    planned.mark_planned(PlannedTask::from_raw(&touch));
    let store = Arc::new(InMemoryStore::new().with_task(unplanned).with_task(planned));

    let scheduler = base_builder(Arc::clone(&store) as Arc<dyn Store>).build().unwrap();
    assert!(!scheduler.is_running());
    scheduler.restore(&[]).await.unwrap();
    assert!(scheduler.is_running());

    eventually("restored tasks to run", || store.task_count() == 0).await;
    assert_eq!(store.record("touched", "task-5"), Some(json!(true)));
    assert_eq!(store.record("touched", "task-6"), Some(json!(true)));

    let ids = scheduler
        .schedule_tasks(vec![RawTask::new("touch")], "test")
        .await
        .unwrap();
    assert!(ids[0] > TaskId::new(6));
    scheduler.shutdown().await;
}

#[tokio::test]
async fn complex_task_markers_overlays_and_state() {
    let store = Arc::new(
        InMemoryStore::new().with_record(
            COMPLEX_STATE_NAMESPACE,
            "A|outbox",
            json!({ "queued": ["m1"] }),
        ),
    );
    let overlays = Arc::new(RecordingOverlays::new());
    let scheduler = SchedulerBuilder::new(store.clone())
        .register_account_type("imap", TaskImpl::complex(Outbox))
        .unwrap()
        .overlays(overlays.clone())
        .build()
        .unwrap();
    scheduler
        .restore(&[AccountBinding::account(account("A"), "imap")])
        .await
        .unwrap();

    assert_eq!(scheduler.counts().parked, 1);
    let overlay = overlays.query("messages", "m1");
    assert_eq!(
        overlay.get("outbox:A"),
        Some(&json!({ "sending": true, "blockedOn": ["online"] }))
    );

    scheduler
        .schedule_tasks_and_await_planned(
            vec![
                RawTask::new("outbox")
                    .for_account(account("A"))
                    .with_field("message", json!("m2")),
            ],
            "send",
        )
        .await
        .unwrap();
    assert_eq!(scheduler.counts().parked, 2);
    assert_eq!(
        store.record(COMPLEX_STATE_NAMESPACE, "A|outbox"),
        Some(json!({ "queued": ["m1", "m2"] }))
    );

    assert_eq!(scheduler.resource_available("online"), 2);
    eventually("outbox to drain", || {
        store.record(COMPLEX_STATE_NAMESPACE, "A|outbox") == Some(json!({ "queued": [] }))
    })
    .await;
    assert!(overlays.query("messages", "m1").is_empty());
    let announced = overlays.announcements();
    assert!(announced.contains(&("messages".to_string(), "m1".to_string())));
    assert!(announced.contains(&("messages".to_string(), "m2".to_string())));
    scheduler.shutdown().await;
}

#[tokio::test]
async fn boosted_tags_run_first_and_clearing_restores_order() {
    let store = Arc::new(InMemoryStore::new());
    let log = Arc::new(Mutex::new(Vec::new()));
    let scheduler = SchedulerBuilder::new(store)
        .register_global(TaskImpl::simple(Ordered { log: Arc::clone(&log) }))
        .unwrap()
        .build()
        .unwrap();
    scheduler.start();

    let ordered = |name: &str, rel: i64, tag: Option<&str>| {
        let raw = RawTask::new("ordered")
            .with_field("name", json!(name))
            .with_field("rel", json!(rel));
        match tag {
            Some(tag) => raw.with_field("tag", json!(tag)),
            None => raw,
        }
    };

    scheduler
        .schedule_tasks_and_await_planned(
            vec![ordered("visible", 0, Some("visible:folder1")), ordered("background", 5, None)],
            "test",
        )
        .await
        .unwrap();
    let boosts: TagBoosts = [("visible:folder1".to_string(), 100)].into_iter().collect();
    scheduler.reprioritize_owner_tags("ui", Some(boosts));
    scheduler.resource_available("online");
    eventually("both to run", || log.lock().unwrap().len() == 2).await;
    assert_eq!(*log.lock().unwrap(), vec!["visible", "background"]);

    log.lock().unwrap().clear();
    scheduler.resources_revoked(["online"]);
    scheduler.reprioritize_owner_tags("ui", None);
    scheduler
        .schedule_tasks_and_await_planned(
            vec![ordered("visible", 0, Some("visible:folder1")), ordered("background", 5, None)],
            "test",
        )
        .await
        .unwrap();
    scheduler.resource_available("online");
    eventually("both to run again", || log.lock().unwrap().len() == 2).await;
    assert_eq!(*log.lock().unwrap(), vec!["background", "visible"]);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn revoked_resource_comes_back_after_timeout() {
    let store = Arc::new(InMemoryStore::new());
    let config = SchedulerConfig::default().with_initial_resources(["online"]);
    let scheduler = started(Arc::clone(&store), config);

    assert_eq!(scheduler.resources_revoked(["online"]), 0);
    scheduler.restore_resource_after_timeout("online", Duration::from_millis(150));
    scheduler
        .schedule_tasks_and_await_planned(
            vec![RawTask::new("sync_refresh").for_account(account("A"))],
            "test",
        )
        .await
        .unwrap();
    assert_eq!(scheduler.counts().parked, 1);

    eventually("timed restore", || store.record("syncStates", "A").is_some()).await;
    assert_eq!(scheduler.counts().parked, 0);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn removing_an_account_drops_its_pending_work() {
    let store = Arc::new(InMemoryStore::new());
    let scheduler = started(Arc::clone(&store), SchedulerConfig::default());

    scheduler
        .schedule_tasks_and_await_planned(
            vec![
                RawTask::new("sync_refresh").for_account(account("A")),
                RawTask::new("sync_refresh").for_account(account("B")),
            ],
            "test",
        )
        .await
        .unwrap();
    assert_eq!(scheduler.counts().parked, 2);

    assert_eq!(scheduler.account_removed(&account("A")), 1);
    assert_eq!(scheduler.counts().parked, 1);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn failed_task_writes_surface_to_the_caller() {
    let store = Arc::new(InMemoryStore::new());
    let scheduler = started(Arc::clone(&store), SchedulerConfig::default());
    store.fail_task_writes(true);

    let err = scheduler
        .schedule_tasks_and_await_executed(vec![RawTask::new("touch")], "test")
        .await
        .unwrap_err();
    assert!(matches!(err, ConvoyError::Persist(_)));
    assert_eq!(scheduler.counts().pending_plan_writes, 0);
    assert_eq!(scheduler.counts().to_plan, 0);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn alternate_policy_still_runs_everything() {
    let store = Arc::new(InMemoryStore::new());
    let config = SchedulerConfig::default().with_loop_policy(LoopPolicy::Alternate);
    let scheduler = started(Arc::clone(&store), config);

    let results = scheduler
        .schedule_tasks_and_await_executed(
            vec![RawTask::new("touch"), RawTask::new("touch"), RawTask::new("touch")],
            "test",
        )
        .await
        .unwrap();
    assert!(results.iter().all(Option::is_some));
    assert_eq!(store.task_count(), 0);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn shutdown_fails_outstanding_waiters() {
    let store = Arc::new(InMemoryStore::new());
    let scheduler = started(Arc::clone(&store), SchedulerConfig::default());

    let waiting = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler
                .schedule_tasks_and_await_executed(
                    vec![RawTask::new("sync_refresh").for_account(AccountId::new("A"))],
                    "test",
                )
                .await
        })
    };
    eventually("task to park", || scheduler.counts().parked == 1).await;
    scheduler.shutdown().await;
    let result = waiting.await.unwrap();
    assert!(matches!(result, Err(ConvoyError::Shutdown)));
}

#[tokio::test]
async fn cancelled_schedule_releases_its_pending_write() {
    let store = Arc::new(InMemoryStore::new());
    let stalling = Arc::new(StallingStore::new(Arc::clone(&store)));
    let scheduler = base_builder(stalling.clone()).build().unwrap();
    scheduler.start();
    let mut events = scheduler.subscribe();

    // dropped while the store is still writing the batch
    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        scheduler.schedule_tasks(vec![RawTask::new("touch")], "test"),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(scheduler.counts().pending_plan_writes, 0);
    next_matching(&mut events, |e| matches!(e, SchedulerEvent::QueueDrained)).await;
    assert!(!scheduler.holds_lease());

    // the loop still takes new work and drains again afterwards
    stalling.stall.store(false, Ordering::Release);
    let results = scheduler
        .schedule_tasks_and_await_executed(vec![RawTask::new("touch")], "test")
        .await
        .unwrap();
    assert!(results[0].is_some());
    next_matching(&mut events, |e| matches!(e, SchedulerEvent::QueueDrained)).await;
    assert!(!scheduler.holds_lease());
    assert!(scheduler.counts().is_quiet());
    assert_eq!(store.task_count(), 0);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn schedule_calls_after_shutdown_are_rejected() {
    let store = Arc::new(InMemoryStore::new());
    let scheduler = started(Arc::clone(&store), SchedulerConfig::default());
    scheduler.shutdown().await;

    let within = Duration::from_secs(1);
    let executed = tokio::time::timeout(
        within,
        scheduler.schedule_tasks_and_await_executed(vec![RawTask::new("touch")], "late"),
    )
    .await
    .expect("await_executed after shutdown returned");
    assert!(matches!(executed, Err(ConvoyError::Shutdown)));

    let planned = tokio::time::timeout(
        within,
        scheduler.schedule_ephemeral_tasks_and_await_planned(vec![RawTask::new("touch")], "late"),
    )
    .await
    .expect("await_planned after shutdown returned");
    assert!(matches!(planned, Err(ConvoyError::Shutdown)));

    let undo = tokio::time::timeout(
        within,
        scheduler.schedule_task_and_await_undo_tasks(RawTask::new("archive"), "late"),
    )
    .await
    .expect("await_undo after shutdown returned");
    assert!(matches!(undo, Err(ConvoyError::Shutdown)));

    let queued = scheduler.schedule_tasks(vec![RawTask::new("touch")], "late").await;
    assert!(matches!(queued, Err(ConvoyError::Shutdown)));
    assert_eq!(store.task_count(), 0);
    assert_eq!(scheduler.counts().pending_plan_writes, 0);
    assert!(!scheduler.holds_lease());
}

#[tokio::test]
async fn at_most_once_requests_merge_into_the_pending_bin() {
    let store = Arc::new(InMemoryStore::new());
    let overlays = Arc::new(RecordingOverlays::new());
    let scheduler = SchedulerBuilder::new(store.clone())
        .register_account_type("imap", TaskImpl::at_most_once(SyncFolder))
        .unwrap()
        .overlays(overlays.clone())
        .build()
        .unwrap();
    scheduler
        .restore(&[AccountBinding::account(account("A"), "imap")])
        .await
        .unwrap();

    let folder = |id: &str| {
        RawTask::new("sync_folder")
            .for_account(account("A"))
            .with_field("folder_id", json!(id))
    };
    let planned = scheduler
        .schedule_tasks_and_await_planned(
            vec![folder("inbox"), folder("inbox"), folder("sent"), folder("inbox")],
            "refresh",
        )
        .await
        .unwrap();
    assert_eq!(
        planned,
        vec![
            Some(json!("planned")),
            Some(json!("merged")),
            Some(json!("planned")),
            Some(json!("merged")),
        ]
    );

    // one marker per folder, however many requests were made
    assert_eq!(scheduler.counts().parked, 2);
    let bins = || {
        store
            .record(COMPLEX_STATE_NAMESPACE, "A|sync_folder")
            .and_then(|state| {
                state["bin_to_marker"]
                    .as_object()
                    .map(|bins| bins.keys().cloned().collect::<Vec<_>>())
            })
            .unwrap_or_default()
    };
    assert_eq!(bins(), vec!["inbox".to_string(), "sent".to_string()]);
    assert_eq!(
        overlays.query("folders", "inbox").get("sync_folder:A"),
        Some(&json!({ "inProgress": false, "blockedOn": ["online"] }))
    );
    assert_eq!(store.task_count(), 0);

    assert_eq!(scheduler.resource_available(resources::ONLINE), 2);
    eventually("both folders to sync", || {
        store.record("folders", "inbox").is_some() && store.record("folders", "sent").is_some()
    })
    .await;
    eventually("bins to be released", || bins().is_empty()).await;
    assert!(overlays.query("folders", "inbox").is_empty());
    assert!(
        overlays
            .announcements()
            .contains(&("folders".to_string(), "inbox".to_string()))
    );

    // with the bin released, the next request plans afresh
    let again = scheduler
        .schedule_tasks_and_await_planned(vec![folder("inbox")], "refresh")
        .await
        .unwrap();
    assert_eq!(again, vec![Some(json!("planned"))]);
    eventually("the fresh bin to run", || bins().is_empty()).await;
    scheduler.shutdown().await;
}
