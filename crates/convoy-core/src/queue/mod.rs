//! Readiness and ordering of task things.
//!
//! - `priority`: the runnable set, ordered by tag-boosted priority.
//! - `resources`: the gate in front of it, parking things whose resources are missing.

pub mod priority;
pub mod resources;

pub use priority::{PriorityQueue, TagBoosts};
pub use resources::ResourceGate;
