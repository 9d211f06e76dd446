//! Scheduler lifecycle events.
//!
//! The group tracker is driven by direct calls from the scheduler; these events
//! are a copy of the same lifecycle broadcast for operational tooling (logging,
//! test harnesses, debug UIs). Nothing in the engine depends on them being read.

use serde_json::Value;

use super::ids::{TaskId, ThingId};
use super::task::RawTask;

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    WillPlan {
        id: TaskId,
        origin: Option<ThingId>,
    },
    WillExecute {
        id: ThingId,
        origin: Option<ThingId>,
    },
    Planned {
        id: TaskId,
        result: Option<Value>,
    },
    Executed {
        id: ThingId,
        result: Option<Value>,
    },
    UndoTasks {
        id: ThingId,
        tasks: Vec<RawTask>,
    },
    QueueDrained,
}

impl SchedulerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SchedulerEvent::WillPlan { .. } => "willPlan",
            SchedulerEvent::WillExecute { .. } => "willExecute",
            SchedulerEvent::Planned { .. } => "planned",
            SchedulerEvent::Executed { .. } => "executed",
            SchedulerEvent::UndoTasks { .. } => "undoTasks",
            SchedulerEvent::QueueDrained => "queueDrained",
        }
    }
}
