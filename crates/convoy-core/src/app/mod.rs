//! App - wiring and the driving loop.
//!
//! # Components
//! - **SchedulerBuilder**: registers task implementations and collaborators
//! - **Scheduler**: public scheduling API, owns the loop's lifecycle
//! - **Shared / Engine**: queue, gate and group state plus the loop itself
//! - **SchedulerConfig**: TOML-loadable settings

pub mod builder;
pub mod config;
pub mod scheduler;
pub(crate) mod shared;

pub use self::builder::{BuildError, SchedulerBuilder};
pub use self::config::{ConfigError, LoopPolicy, SchedulerConfig};
pub use self::scheduler::Scheduler;
