//! Recording overlay and trigger sinks.
//!
//! Both keep what was registered so it can be queried or fired directly,
//! which is how the demo driver and tests observe complex task contributions.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::ports::{OverlayProvider, OverlaySink, TriggerHandler, TriggerSink};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct RecordingOverlays {
    /// namespace -> (provider name, provider)
    providers: Mutex<HashMap<String, Vec<(String, OverlayProvider)>>>,
    announcements: Mutex<Vec<(String, String)>>,
}

impl RecordingOverlays {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay data for one record, keyed by provider name.
    pub fn query(&self, namespace: &str, id: &str) -> HashMap<String, Value> {
        let providers: Vec<(String, OverlayProvider)> = lock(&self.providers)
            .get(namespace)
            .cloned()
            .unwrap_or_default();
        // providers may read scheduler state; call them without our lock held
        providers
            .into_iter()
            .filter_map(|(name, provider)| provider(id).map(|v| (name, v)))
            .collect()
    }

    pub fn provider_count(&self) -> usize {
        lock(&self.providers).values().map(Vec::len).sum()
    }

    pub fn announcements(&self) -> Vec<(String, String)> {
        lock(&self.announcements).clone()
    }
}

impl OverlaySink for RecordingOverlays {
    fn register_provider(&self, namespace: &str, provider_name: &str, provider: OverlayProvider) {
        let mut providers = lock(&self.providers);
        let list = providers.entry(namespace.to_string()).or_default();
        list.retain(|(name, _)| name != provider_name);
        list.push((provider_name.to_string(), provider));
    }

    fn unregister_provider(&self, provider_name: &str) {
        for list in lock(&self.providers).values_mut() {
            list.retain(|(name, _)| name != provider_name);
        }
    }

    fn announce_update(&self, namespace: &str, id: &str) {
        lock(&self.announcements).push((namespace.to_string(), id.to_string()));
    }
}

#[derive(Default)]
pub struct RecordingTriggers {
    /// event -> (handler name, handler)
    handlers: Mutex<HashMap<String, Vec<(String, TriggerHandler)>>>,
}

impl RecordingTriggers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `payload` to every handler of `event`. Returns how many ran.
    pub fn fire(&self, event: &str, payload: &Value) -> usize {
        let handlers: Vec<TriggerHandler> = lock(&self.handlers)
            .get(event)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }

    pub fn handler_count(&self) -> usize {
        lock(&self.handlers).values().map(Vec::len).sum()
    }
}

impl TriggerSink for RecordingTriggers {
    fn register_trigger(&self, event: &str, handler_name: &str, handler: TriggerHandler) {
        let mut handlers = lock(&self.handlers);
        let list = handlers.entry(event.to_string()).or_default();
        list.retain(|(name, _)| name != handler_name);
        list.push((handler_name.to_string(), handler));
    }

    fn unregister_triggers(&self, handler_name: &str) {
        for list in lock(&self.handlers).values_mut() {
            list.retain(|(name, _)| name != handler_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use serde_json::json;

    #[test]
    fn providers_are_replaced_by_name_and_unregistered() {
        let overlays = RecordingOverlays::new();
        overlays.register_provider("messages", "outbox:A", Arc::new(|_: &str| Some(json!(1))));
        overlays.register_provider("messages", "outbox:A", Arc::new(|_: &str| Some(json!(2))));
        assert_eq!(overlays.provider_count(), 1);
        assert_eq!(overlays.query("messages", "m1").get("outbox:A"), Some(&json!(2)));

        overlays.unregister_provider("outbox:A");
        assert!(overlays.query("messages", "m1").is_empty());
    }

    #[test]
    fn fire_reaches_every_handler_for_the_event() {
        let triggers = RecordingTriggers::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b"] {
            let hits = Arc::clone(&hits);
            triggers.register_trigger(
                "msgChanged",
                name,
                Arc::new(move |_: &Value| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        assert_eq!(triggers.fire("msgChanged", &json!({})), 2);
        assert_eq!(triggers.fire("other", &json!({})), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
