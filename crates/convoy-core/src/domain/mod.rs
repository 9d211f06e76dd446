//! Domain model: ids, task shapes, finish payloads and lifecycle events.

pub mod events;
pub mod finish;
pub mod ids;
pub mod task;

pub use events::SchedulerEvent;
pub use finish::{
    COMPLEX_STATE_NAMESPACE, ComplexStateRow, FinishData, FinishMeta, MarkerUpdate, ReadRequest,
    ReadResults, RevisedTask, complex_state_key,
};
pub use ids::{AccountId, GroupId, MarkerId, TaskId, TaskIdAllocator, ThingId};
pub use task::{
    PlannedTask, RawTask, TaskMarker, TaskThing, TaskType, WrappedState, WrappedTask, resources,
};
