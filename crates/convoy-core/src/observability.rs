use serde::{Deserialize, Serialize};

/// Point-in-time view of the scheduler's queues.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Wrapped tasks waiting to be planned.
    pub to_plan: usize,
    /// Things in the priority queue, ready to execute.
    pub runnable: usize,
    /// Things parked on a missing resource.
    pub parked: usize,
    pub pending_plan_writes: usize,
    pub live_groups: usize,
}

impl QueueCounts {
    /// Nothing is waiting to be planned, run or recorded.
    pub fn is_quiet(&self) -> bool {
        self.to_plan == 0 && self.runnable == 0 && self.pending_plan_writes == 0
    }
}
