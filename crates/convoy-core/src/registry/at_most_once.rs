//! At-most-once tasks.
//!
//! Requests are binned by one raw-task field. While a bin has work pending,
//! further requests for it are merged into the existing marker instead of
//! queueing more work. Sync tasks are the usual case: one refresh brings a
//! folder up to date no matter how many refreshes were asked for.
//!
//! [`AtMostOnce`] turns an [`AtMostOnceTask`] into a [`ComplexTask`] whose
//! persistent state is one marker per bin and whose memory state tracks which
//! bins are being worked on, so overlays can report progress.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::task::{AccountBinding, ComplexState, ComplexTask, Contributions, Derived, TaskResult};
use crate::context::{FinishOutcome, TaskContext};
use crate::domain::{
    AccountId, FinishData, MarkerId, PlannedTask, RawTask, TaskMarker, TaskType, ThingId,
};
use crate::error::ConvoyError;
use crate::group::GroupCompletion;

/// Bin used by tasks that do not bin by a field.
pub const ONLY_BIN: &str = "only";

/// What a helped step hands back. The adapter finishes the context with it,
/// so helped steps never call `finish_task` themselves.
#[derive(Debug, Default)]
pub struct Helped {
    pub data: FinishData,
    pub result: Option<Value>,
    /// Overlay changes announced after the commit, once bin bookkeeping is current.
    pub announce: Vec<(String, String)>,
}

impl Helped {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(mut self, data: FinishData) -> Self {
        self.data = data;
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn announce(mut self, namespace: impl Into<String>, id: impl Into<String>) -> Self {
        self.announce.push((namespace.into(), id.into()));
        self
    }
}

/// Outcome of a helped plan.
#[derive(Debug, Default)]
pub struct HelpedPlan {
    pub helped: Helped,
    /// The bin's pending work. `None` concludes the request without a marker.
    pub planned: Option<PlannedTask>,
    /// Keep reporting the bin as in progress until this group drains.
    pub remain_in_progress_until: Option<GroupCompletion>,
}

impl HelpedPlan {
    /// Queue `planned` as the bin's marker.
    pub fn marker(planned: PlannedTask) -> Self {
        Self {
            planned: Some(planned),
            ..Self::default()
        }
    }

    /// Nothing to run for this request.
    pub fn concluded() -> Self {
        Self::default()
    }

    pub fn with_helped(mut self, helped: Helped) -> Self {
        self.helped = helped;
        self
    }

    pub fn remain_in_progress_until(mut self, completion: GroupCompletion) -> Self {
        self.remain_in_progress_until = Some(completion);
        self
    }
}

/// One overlay query as seen by a helped overlay function.
#[derive(Debug)]
pub struct BinView<'a> {
    /// Record id the overlay was asked about.
    pub id: &'a str,
    pub bin: &'a str,
    pub marker: Option<&'a TaskMarker>,
    pub in_progress: bool,
    /// Resources the bin's marker is parked on, when it is parked.
    pub blocked_on: Option<Vec<String>>,
}

type BinOverlayFn = Arc<dyn Fn(&BinView<'_>) -> Option<Value> + Send + Sync>;
type BinExtractor = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Overlay functions fed with bin bookkeeping instead of raw task state.
#[derive(Default)]
pub struct HelpedOverlays {
    entries: Vec<(String, Option<BinExtractor>, BinOverlayFn)>,
}

impl HelpedOverlays {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay for records whose id is the bin id.
    pub fn overlay<F>(mut self, namespace: &str, f: F) -> Self
    where
        F: Fn(&BinView<'_>) -> Option<Value> + Send + Sync + 'static,
    {
        self.entries.push((namespace.to_string(), None, Arc::new(f)));
        self
    }

    /// Overlay for records whose bin is derived from the record id.
    pub fn prefix_overlay<E, F>(mut self, namespace: &str, extract: E, f: F) -> Self
    where
        E: Fn(&str) -> String + Send + Sync + 'static,
        F: Fn(&BinView<'_>) -> Option<Value> + Send + Sync + 'static,
    {
        self.entries
            .push((namespace.to_string(), Some(Arc::new(extract)), Arc::new(f)));
        self
    }
}

#[async_trait]
pub trait AtMostOnceTask: Send + Sync + 'static {
    fn task_type(&self) -> TaskType;

    /// Raw-task field requests are binned by. `None` keeps a single bin.
    fn bin_by(&self) -> Option<&str> {
        None
    }

    async fn plan(&self, ctx: &TaskContext, raw: &RawTask) -> Result<HelpedPlan, ConvoyError>;

    /// A request arrived for a bin that already has a marker.
    async fn already_planned(
        &self,
        _ctx: &TaskContext,
        _raw: &RawTask,
    ) -> Result<Helped, ConvoyError> {
        Ok(Helped::default())
    }

    async fn execute(&self, ctx: &TaskContext, marker: &TaskMarker) -> Result<Helped, ConvoyError>;

    fn overlays(&self) -> HelpedOverlays {
        HelpedOverlays::new()
    }

    /// A bin's marker or in-progress status may have changed.
    fn invalidate_overlays(&self, _ctx: &TaskContext, _bin: &str) {}
}

/// Persistent state: the pending marker of every bin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BinMarkers {
    #[serde(default)]
    pub bin_to_marker: BTreeMap<String, TaskMarker>,
}

/// Memory state: bins being executed, or held in progress after planning.
#[derive(Debug, Default)]
pub struct BinProgress {
    pub account_id: Option<AccountId>,
    pub in_progress: HashSet<String>,
    pub remain_in_progress: HashSet<String>,
}

impl BinProgress {
    pub fn is_in_progress(&self, bin: &str) -> bool {
        self.in_progress.contains(bin) || self.remain_in_progress.contains(bin)
    }
}

pub struct AtMostOnce<T> {
    inner: Arc<T>,
}

impl<T: AtMostOnceTask> AtMostOnce<T> {
    pub fn new(task: T) -> Self {
        Self {
            inner: Arc::new(task),
        }
    }

    fn bin_for(&self, raw: &RawTask) -> Result<String, ConvoyError> {
        let Some(field) = self.inner.bin_by() else {
            return Ok(ONLY_BIN.to_string());
        };
        match raw.field(field) {
            Some(Value::String(bin)) => Ok(bin.clone()),
            Some(Value::Null) | None => Err(ConvoyError::implementation(format!(
                "{} requests need a `{field}` field",
                self.inner.task_type()
            ))),
            Some(other) => Ok(other.to_string()),
        }
    }
}

/// Marker ids are scoped by account so equal bins of two accounts never collide.
fn marker_id(task_type: &TaskType, account_id: Option<&AccountId>, bin: &str) -> MarkerId {
    match account_id {
        Some(account_id) => MarkerId::new(format!("{task_type}:{account_id}:{bin}")),
        None => MarkerId::new(format!("{task_type}:{bin}")),
    }
}

fn bin_of(persistent: &BinMarkers, marker: &TaskMarker) -> Option<String> {
    persistent
        .bin_to_marker
        .iter()
        .find(|(_, pending)| pending.id == marker.id)
        .map(|(bin, _)| bin.clone())
}

/// The bin's marker carries the planned task, under the bin's id and the
/// instance's account.
fn marker_from_planned(
    task_type: TaskType,
    bin: &str,
    account_id: Option<AccountId>,
    planned: PlannedTask,
) -> TaskMarker {
    let account_id = account_id.or(planned.account_id);
    TaskMarker {
        id: marker_id(&task_type, account_id.as_ref(), bin),
        task_type,
        account_id,
        priority_tags: planned.priority_tags,
        rel_priority: planned.rel_priority,
        resources: planned.resources,
        fields: planned.fields,
    }
}

async fn finish(ctx: &TaskContext, helped: Helped) -> TaskResult {
    let Helped {
        data,
        result,
        announce,
    } = helped;
    ctx.finish_task(data).await?;
    for (namespace, id) in &announce {
        ctx.announce_overlay_change(namespace, id);
    }
    Ok(result)
}

#[async_trait]
impl<T: AtMostOnceTask> ComplexTask for AtMostOnce<T> {
    type Persistent = BinMarkers;
    type Memory = BinProgress;

    fn task_type(&self) -> TaskType {
        self.inner.task_type()
    }

    fn init_persistent_state(&self) -> BinMarkers {
        BinMarkers::default()
    }

    async fn derive_memory_state(
        &self,
        persistent: &BinMarkers,
        binding: &AccountBinding,
    ) -> Result<Derived<BinProgress>, ConvoyError> {
        let progress = BinProgress {
            account_id: binding.account_id.clone(),
            ..BinProgress::default()
        };
        let markers = persistent.bin_to_marker.values().cloned().collect();
        Ok(Derived::new(progress).with_markers(markers))
    }

    async fn plan(
        &self,
        ctx: &TaskContext,
        state: &ComplexState<BinMarkers, BinProgress>,
        raw: &RawTask,
    ) -> TaskResult {
        let bin = self.bin_for(raw)?;
        let merged = state.persistent().bin_to_marker.contains_key(&bin);
        if merged {
            debug!(task_type = %raw.task_type, bin = %bin, "bin already planned, merging request");
            let helped = self.inner.already_planned(ctx, raw).await?;
            return finish(ctx, helped).await;
        }

        let HelpedPlan {
            mut helped,
            planned,
            remain_in_progress_until,
        } = self.inner.plan(ctx, raw).await?;
        // the bin's marker stands in for a planned task
        helped.data.task_state = None;
        if let Some(planned) = planned {
            let account_id = state.memory().account_id.clone();
            let marker = marker_from_planned(self.inner.task_type(), &bin, account_id, planned);
            state
                .persistent_mut()
                .bin_to_marker
                .insert(bin.clone(), marker.clone());
            let snapshot = state.snapshot()?;
            helped.data = helped.data.upsert_marker(marker).complex_state(snapshot);
        }

        if let Some(until) = remain_in_progress_until {
            state.memory_mut().remain_in_progress.insert(bin.clone());
            let state = state.clone();
            let inner = Arc::clone(&self.inner);
            let ctx = ctx.clone();
            let bin = bin.clone();
            tokio::spawn(async move {
                until.wait().await;
                state.memory_mut().remain_in_progress.remove(&bin);
                inner.invalidate_overlays(&ctx, &bin);
            });
        }

        self.inner.invalidate_overlays(ctx, &bin);
        finish(ctx, helped).await
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        state: &ComplexState<BinMarkers, BinProgress>,
        marker: &TaskMarker,
    ) -> TaskResult {
        let pending = bin_of(&state.persistent(), marker);
        let Some(bin) = pending else {
            // superseded or already run; nothing is pending for it any more
            warn!(marker = %marker.id, "no pending bin for marker");
            ctx.finish_task(FinishData::new()).await?;
            return Ok(None);
        };
        state.memory_mut().in_progress.insert(bin.clone());
        {
            // a failed execution releases its bin too, so later requests can plan again
            let state = state.clone();
            let bin = bin.clone();
            ctx.on_finish(move |data, outcome| {
                state.memory_mut().in_progress.remove(&bin);
                state.persistent_mut().bin_to_marker.remove(&bin);
                match state.snapshot() {
                    Ok(snapshot) => data.complex_task_state = Some(snapshot),
                    Err(err) => warn!(bin = %bin, error = %err, "bin state snapshot failed"),
                }
                if outcome == FinishOutcome::Failed {
                    debug!(bin = %bin, "execution failed, bin released");
                }
            });
        }
        self.inner.invalidate_overlays(ctx, &bin);

        let outcome = match self.inner.execute(ctx, marker).await {
            Ok(helped) => finish(ctx, helped).await,
            Err(err) => Err(err),
        };
        if outcome.is_err() && !ctx.is_finished() {
            ctx.failsafe_finalize("at-most-once execute failed").await;
        }
        self.inner.invalidate_overlays(ctx, &bin);
        outcome
    }

    fn contributions(&self) -> Contributions<BinMarkers, BinProgress> {
        let task_type = self.inner.task_type();
        self.inner
            .overlays()
            .entries
            .into_iter()
            .fold(Contributions::new(), |contributions, (namespace, extract, f)| {
                let task_type = task_type.clone();
                contributions.overlay(&namespace, move |state, checker, id| {
                    let bin = match &extract {
                        Some(extract) => extract(id),
                        None => id.to_string(),
                    };
                    let marker = state.persistent().bin_to_marker.get(&bin).cloned();
                    let (in_progress, account_id) = {
                        let memory = state.memory();
                        (memory.is_in_progress(&bin), memory.account_id.clone())
                    };
                    let parked = ThingId::Marker(marker_id(&task_type, account_id.as_ref(), &bin));
                    let blocked_on = checker(&parked);
                    f(&BinView {
                        id,
                        bin: &bin,
                        marker: marker.as_ref(),
                        in_progress,
                        blocked_on,
                    })
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::resources;
    use serde_json::json;

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
            Ok(HelpedPlan::marker(PlannedTask::from_raw(raw)))
        }

        async fn execute(
            &self,
            _ctx: &TaskContext,
            _marker: &TaskMarker,
        ) -> Result<Helped, ConvoyError> {
            Ok(Helped::new())
        }
    }

    struct SyncAll;

    #[async_trait]
    impl AtMostOnceTask for SyncAll {
        fn task_type(&self) -> TaskType {
            TaskType::new("sync_all")
        }

        async fn plan(
            &self,
            _ctx: &TaskContext,
            _raw: &RawTask,
        ) -> Result<HelpedPlan, ConvoyError> {
            Ok(HelpedPlan::concluded())
        }

        async fn execute(
            &self,
            _ctx: &TaskContext,
            _marker: &TaskMarker,
        ) -> Result<Helped, ConvoyError> {
            Ok(Helped::new())
        }
    }

    #[test]
    fn requests_are_binned_by_the_configured_field() {
        let task = AtMostOnce::new(SyncFolder);
        let raw = RawTask::new("sync_folder").with_field("folder_id", json!("inbox"));
        assert_eq!(task.bin_for(&raw).unwrap(), "inbox");

        let numbered = RawTask::new("sync_folder").with_field("folder_id", json!(7));
        assert_eq!(task.bin_for(&numbered).unwrap(), "7");

        let err = task.bin_for(&RawTask::new("sync_folder")).unwrap_err();
        assert!(err.to_string().contains("folder_id"));

        let single = AtMostOnce::new(SyncAll);
        assert_eq!(single.bin_for(&RawTask::new("sync_all")).unwrap(), ONLY_BIN);
    }

    #[test]
    fn markers_carry_the_planned_task_under_the_bin_id() {
        let raw = RawTask::new("sync_folder")
            .for_account(AccountId::new("other"))
            .with_field("folder_id", json!("inbox"));
        let planned = PlannedTask::from_raw(&raw)
            .with_resources([resources::ONLINE])
            .with_rel_priority(3);
        let marker = marker_from_planned(
            TaskType::new("sync_folder"),
            "inbox",
            Some(AccountId::new("A")),
            planned,
        );
        assert_eq!(marker.id, MarkerId::new("sync_folder:A:inbox"));
        assert_eq!(marker.account_id, Some(AccountId::new("A")));
        assert_eq!(marker.resources, vec!["online".to_string()]);
        assert_eq!(marker.rel_priority, 3);
        assert_eq!(marker.fields.get("folder_id"), Some(&json!("inbox")));

        let persistent = BinMarkers {
            bin_to_marker: [("inbox".to_string(), marker.clone())].into_iter().collect(),
        };
        assert_eq!(bin_of(&persistent, &marker).as_deref(), Some("inbox"));
        assert_eq!(bin_of(&BinMarkers::default(), &marker), None);
    }

    #[tokio::test]
    async fn bring_up_requeues_every_pending_bin() {
        let task = AtMostOnce::new(SyncFolder);
        let marker = |bin: &str| {
            TaskMarker::new(marker_id(&TaskType::new("sync_folder"), None, bin), "sync_folder")
                .with_field("folder_id", json!(bin))
        };
        let persistent = BinMarkers {
            bin_to_marker: ["inbox", "sent"]
                .into_iter()
                .map(|bin| (bin.to_string(), marker(bin)))
                .collect(),
        };
        let binding = AccountBinding::account(AccountId::new("A"), "imap");
        let derived = task.derive_memory_state(&persistent, &binding).await.unwrap();
        assert_eq!(derived.markers.len(), 2);
        assert_eq!(derived.memory_state.account_id, Some(AccountId::new("A")));
        assert!(!derived.memory_state.is_in_progress("inbox"));

        let saved = serde_json::to_value(&persistent).unwrap();
        let back: BinMarkers = serde_json::from_value(saved).unwrap();
        assert_eq!(back, persistent);
    }
}
