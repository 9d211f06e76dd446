//! Ports - interfaces to the collaborators the scheduler drives but does not own.
//!
//! - `store`: transactional record store (reads, write intents, commits).
//! - `overlay`: overlay/trigger registries and the folders view for complex tasks.
//! - `lease`: liveness lease held while work is pending.

pub mod lease;
pub mod overlay;
pub mod store;

pub use self::lease::{Lease, LeaseProvider};
pub use self::overlay::{FoldersView, OverlayProvider, OverlaySink, TriggerHandler, TriggerSink};
pub use self::store::{PersistedState, Store};
