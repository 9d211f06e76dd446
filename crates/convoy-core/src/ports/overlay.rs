//! Overlay, trigger and folder collaborators used by complex tasks.
//!
//! Complex tasks contribute callbacks through an explicit `Contributions`
//! table; the registry binds them to the task's live state at bring-up and
//! registers them here.

use std::sync::Arc;

use serde_json::Value;

/// Returns overlay data for one record id in the provider's namespace.
pub type OverlayProvider = Arc<dyn Fn(&str) -> Option<Value> + Send + Sync>;

/// Handles one trigger event payload.
pub type TriggerHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Receives overlay providers and overlay change announcements.
pub trait OverlaySink: Send + Sync {
    fn register_provider(&self, namespace: &str, provider_name: &str, provider: OverlayProvider);

    /// Drop every provider registered under `provider_name`.
    fn unregister_provider(&self, provider_name: &str);

    /// Overlay data for (`namespace`, `id`) changed and should be re-queried.
    fn announce_update(&self, namespace: &str, id: &str);
}

/// Receives trigger handlers for store change events.
pub trait TriggerSink: Send + Sync {
    fn register_trigger(&self, event: &str, handler_name: &str, handler: TriggerHandler);

    fn unregister_triggers(&self, handler_name: &str);
}

/// Read-only view of an account's folders, handed to complex tasks when their
/// memory state is derived.
pub trait FoldersView: Send + Sync {
    fn folder_ids(&self) -> Vec<String>;
}
