//! convoy-core
//!
//! Task scheduling and execution core for a local-first mail backend.
//!
//! # Modules
//! - **domain**: ids, task shapes (raw / wrapped / planned / marker), finish payloads, events
//! - **queue**: tag-boosted priority queue and the resource gate in front of it
//! - **registry**: task type registry, simple/complex task traits and dispatch
//! - **context**: per-invocation task context and its store protocol
//! - **group**: hierarchical task group completion tracking
//! - **ports**: store, overlay/trigger and lease collaborators
//! - **app**: builder, configuration, the scheduler and its driving loop
//! - **impls**: in-memory implementations of the ports

pub mod app;
pub mod context;
pub mod domain;
pub mod error;
pub mod group;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod registry;

pub use app::{BuildError, LoopPolicy, Scheduler, SchedulerBuilder, SchedulerConfig};
pub use context::TaskContext;
pub use error::ConvoyError;
pub use registry::{ComplexTask, SimpleTask, TaskImpl};
