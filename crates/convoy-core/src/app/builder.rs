//! SchedulerBuilder - wiring and startup validation.
//!
//! Collects task implementations and collaborators, then wires them into a
//! [`Scheduler`]. `expect_tasks` makes `build` fail fast when a task type the
//! caller relies on was never registered.

use std::sync::{Arc, Mutex, PoisonError};

use super::config::SchedulerConfig;
use super::scheduler::Scheduler;
use super::shared::{Engine, Shared};
use crate::domain::ThingId;
use crate::impls::TimedLeaseProvider;
use crate::ports::{LeaseProvider, OverlaySink, Store, TriggerSink};
use crate::registry::{BlockedChecker, RegistryError, TaskImpl, TaskTypeRegistry, Wiring};

/// Builds a [`Scheduler`].
///
/// # Example
/// ```ignore
/// let scheduler = SchedulerBuilder::new(store)
///     .register_global(TaskImpl::simple(SyncRefresh))?
///     .register_account_type("imap", TaskImpl::complex(Outbox))?
///     .expect_tasks(&["sync_refresh", "outbox"])
///     .build()?;
/// ```
pub struct SchedulerBuilder {
    store: Arc<dyn Store>,
    registry: TaskTypeRegistry,
    expected_tasks: Option<Vec<String>>,
    config: SchedulerConfig,
    overlays: Option<Arc<dyn OverlaySink>>,
    triggers: Option<Arc<dyn TriggerSink>>,
    lease_provider: Option<Arc<dyn LeaseProvider>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),
}

impl SchedulerBuilder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            registry: TaskTypeRegistry::new(),
            expected_tasks: None,
            config: SchedulerConfig::default(),
            overlays: None,
            triggers: None,
            lease_provider: None,
        }
    }

    pub fn register_global(mut self, task: TaskImpl) -> Result<Self, RegistryError> {
        self.registry.register_global_task_type(task)?;
        Ok(self)
    }

    pub fn register_account_type(
        mut self,
        account_type: &str,
        task: TaskImpl,
    ) -> Result<Self, RegistryError> {
        self.registry.register_account_type_task_type(account_type, task)?;
        Ok(self)
    }

    /// Task types that must be registered for `build` to succeed.
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn overlays(mut self, overlays: Arc<dyn OverlaySink>) -> Self {
        self.overlays = Some(overlays);
        self
    }

    pub fn triggers(mut self, triggers: Arc<dyn TriggerSink>) -> Self {
        self.triggers = Some(triggers);
        self
    }

    /// Defaults to a [`TimedLeaseProvider`] using the configured timeout.
    pub fn lease_provider(mut self, provider: Arc<dyn LeaseProvider>) -> Self {
        self.lease_provider = Some(provider);
        self
    }

    /// Validate expectations and wire everything together. The loop is not
    /// started; call [`Scheduler::restore`] or [`Scheduler::start`].
    pub fn build(mut self) -> Result<Scheduler, BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let registered_types = self.registry.registered_types();
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|x| !registered_types.contains(x))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }

        let engine = Arc::new(Mutex::new(Engine::new(&self.config)));
        let gate_view = Arc::clone(&engine);
        let checker: BlockedChecker = Arc::new(move |id: &ThingId| {
            gate_view
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .gate
                .blocking_resources_for(id)
        });
        self.registry.set_wiring(Wiring {
            overlays: self.overlays.clone(),
            triggers: self.triggers,
            checker,
        });

        let lease_provider = self
            .lease_provider
            .unwrap_or_else(|| Arc::new(TimedLeaseProvider::new(self.config.lease_timeout())));
        let shared = Shared::new(
            self.config,
            self.store,
            self.registry,
            self.overlays,
            engine,
            lease_provider,
        );
        Ok(Scheduler::from_shared(Arc::new(shared)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskType;
    use crate::impls::InMemoryStore;
    use crate::registry::SimpleTask;

    struct Named(&'static str);

    impl SimpleTask for Named {
        fn task_type(&self) -> TaskType {
            TaskType::new(self.0)
        }
    }

    fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new(Arc::new(InMemoryStore::new()))
    }

    #[test]
    fn test_build_success() {
        let scheduler = builder()
            .register_global(TaskImpl::simple(Named("sync_refresh")))
            .unwrap()
            .register_account_type("imap", TaskImpl::simple(Named("fetch_body")))
            .unwrap()
            .expect_tasks(&["sync_refresh", "fetch_body"])
            .build();
        assert!(scheduler.is_ok());
    }

    #[test]
    fn test_build_missing_task_types() {
        let scheduler = builder()
            .register_global(TaskImpl::simple(Named("sync_refresh")))
            .unwrap()
            .expect_tasks(&["sync_refresh", "outbox"])
            .build();
        assert!(matches!(
            scheduler,
            Err(BuildError::MissingTaskTypes(missing)) if missing == vec!["outbox".to_string()]
        ));
    }

    #[test]
    fn test_build_no_expect_tasks() {
        assert!(builder().build().is_ok());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let result = builder()
            .register_global(TaskImpl::simple(Named("sync_refresh")))
            .unwrap()
            .register_global(TaskImpl::simple(Named("sync_refresh")));
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(t)) if t == "sync_refresh"));
    }
}
