use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use convoy_core::domain::{
    AccountId, FinishData, PlannedTask, RawTask, SchedulerEvent, TaskType, resources,
};
use convoy_core::impls::InMemoryStore;
use convoy_core::registry::TaskResult;
use convoy_core::{SchedulerBuilder, SchedulerConfig, SimpleTask, TaskContext, TaskImpl};

#[derive(Debug, Deserialize)]
struct HelloFields {
    name: String,
}

/// Greets and records who it greeted.
struct HelloTask;

#[async_trait]
impl SimpleTask for HelloTask {
    fn task_type(&self) -> TaskType {
        TaskType::new("hello")
    }

    async fn execute(&self, ctx: &TaskContext, planned: &PlannedTask) -> TaskResult {
        let fields: HelloFields = serde_json::from_value(planned.fields.clone().into())?;
        println!("Hello, {}!", fields.name);
        ctx.finish_task(FinishData::new().update("greetings", fields.name.as_str(), true.into()))
            .await?;
        Ok(Some(format!("greeted {}", fields.name).into()))
    }
}

/// Needs the network, so it waits until `online` is available.
struct SendDraftTask {
    sent: AtomicU32,
}

#[async_trait]
impl SimpleTask for SendDraftTask {
    fn task_type(&self) -> TaskType {
        TaskType::new("send_draft")
    }

    fn priority_tags(&self, raw: &RawTask) -> Vec<String> {
        raw.account_id.iter().map(|a| format!("account:{a}")).collect()
    }

    fn resources(&self, _raw: &RawTask) -> Vec<String> {
        vec![resources::ONLINE.to_string()]
    }

    async fn execute(&self, ctx: &TaskContext, _planned: &PlannedTask) -> TaskResult {
        let n = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        ctx.finish_task(FinishData::new()).await?;
        Ok(Some(format!("sent draft #{n}").into()))
    }
}

fn load_config() -> Result<SchedulerConfig, Box<dyn std::error::Error>> {
    match std::env::args().nth(1) {
        Some(path) => Ok(SchedulerConfig::load(path)?),
        None => Ok(SchedulerConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // (A) store + task implementations
    let store = Arc::new(InMemoryStore::new());
    let scheduler = SchedulerBuilder::new(store.clone())
        .register_global(TaskImpl::simple(HelloTask))?
        .register_global(TaskImpl::simple(SendDraftTask {
            sent: AtomicU32::new(0),
        }))?
        .expect_tasks(&["hello", "send_draft"])
        .config(load_config()?)
        .build()?;

    // (B) restore persisted work (none here) and start the loop
    scheduler.restore(&[]).await?;

    // (C) work with no resource requirements runs straight through
    let hello = RawTask::new("hello").with_field("name", "convoy".into());
    let results = scheduler
        .schedule_tasks_and_await_executed(vec![hello], "demo")
        .await?;
    println!("hello results: {results:?}");

    // (D) network work parks until `online` shows up
    let drafts = (0..2)
        .map(|_| RawTask::new("send_draft").for_account(AccountId::new("acct-1")))
        .collect::<Vec<_>>();
    let expected = drafts.len();
    let planned = scheduler
        .schedule_tasks_and_await_planned(drafts, "demo")
        .await?;
    println!("planned drafts: {planned:?}");
    println!("counts while offline: {:?}", scheduler.counts());

    let mut events = scheduler.subscribe();
    let woken = scheduler.resource_available(resources::ONLINE);
    info!(woken, "went online");

    // (E) watch the drafts go out
    let mut executed = 0;
    while executed < expected {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(SchedulerEvent::Executed { id, result })) => {
                executed += 1;
                println!("executed {id}: {result:?}");
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                println!("timed out waiting for drafts to send");
                break;
            }
        }
    }
    println!("final counts: {:?}", scheduler.counts());
    println!("greetings written: {:?}", store.record("greetings", "convoy"));

    scheduler.shutdown().await;
    Ok(())
}
