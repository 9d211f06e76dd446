//! Impls - in-process implementations of the ports.
//!
//! Used by the demo driver and the test suites; a production embedding
//! supplies its own store, overlay/trigger registries and wake lock.
//!
//! # Included
//! - **InMemoryStore**: records, wrapped tasks, per-record write locks
//! - **RecordingOverlays / RecordingTriggers**: sinks that remember registrations
//! - **TimedLeaseProvider**: liveness lease with a deadline

pub mod memory_store;
pub mod recording;
pub mod timed_lease;

pub use self::memory_store::{Change, InMemoryStore};
pub use self::recording::{RecordingOverlays, RecordingTriggers};
pub use self::timed_lease::{TimedLease, TimedLeaseProvider};
