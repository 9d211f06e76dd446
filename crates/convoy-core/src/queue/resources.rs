//! Resource gating in front of the priority queue.
//!
//! A task thing lists the resources it needs (`online`, `credentials!A`, ...).
//! `own_or_relay` is the only way in: a thing whose resources are all available
//! goes to the priority queue, anything else is parked under the first missing
//! resource in declaration order.
//!
//! Invariant: a thing is either parked on exactly one resource or present in
//! the queue, never both.

use std::collections::{HashMap, HashSet};

use tokio::task::AbortHandle;
use tracing::{debug, info};

use super::priority::PriorityQueue;
use crate::domain::{TaskThing, ThingId};

#[derive(Debug, Default)]
pub struct ResourceGate {
    queue: PriorityQueue,
    available: HashSet<String>,
    /// Parked things per resource, in arrival order.
    blocked_by_resource: HashMap<String, Vec<TaskThing>>,
    /// Which resource each parked thing is waiting on.
    blocked_by_id: HashMap<ThingId, String>,
    /// Pending restore-after-timeout timers.
    restore_timers: HashMap<String, AbortHandle>,
}

impl ResourceGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_available<I, S>(resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            available: resources.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn queue(&self) -> &PriorityQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut PriorityQueue {
        &mut self.queue
    }

    pub fn is_available(&self, resource: &str) -> bool {
        self.available.contains(resource)
    }

    pub fn parked_count(&self) -> usize {
        self.blocked_by_id.len()
    }

    pub fn pop_highest_priority(&mut self) -> Option<TaskThing> {
        self.queue.pop_highest_priority()
    }

    /// Admit `thing` to the queue, or park it under its first missing
    /// resource. Returns whether it was admitted.
    pub fn own_or_relay(&mut self, thing: TaskThing) -> bool {
        let id = thing.id();
        self.unpark(&id);

        let missing = thing
            .resources()
            .iter()
            .find(|r| !self.available.contains(r.as_str()))
            .cloned();

        match missing {
            Some(resource) => {
                self.queue.remove(&id);
                debug!(thing = %id, resource = %resource, "parked on missing resource");
                self.blocked_by_id.insert(id, resource.clone());
                self.blocked_by_resource
                    .entry(resource)
                    .or_default()
                    .push(thing);
                false
            }
            None => {
                self.queue.insert(thing);
                true
            }
        }
    }

    /// Mark `resource` available and relay everything parked on it.
    ///
    /// Returns how many things became runnable; 0 when it was already available.
    /// Any pending restore timer for the resource is cancelled.
    pub fn resource_available(&mut self, resource: &str) -> usize {
        self.cancel_restore_timer(resource);
        if !self.available.insert(resource.to_string()) {
            return 0;
        }

        let parked = self.blocked_by_resource.remove(resource).unwrap_or_default();
        let mut runnable = 0;
        for thing in parked {
            self.blocked_by_id.remove(&thing.id());
            if self.own_or_relay(thing) {
                runnable += 1;
            }
        }
        info!(resource, runnable, "resource available");
        runnable
    }

    /// Mark resources unavailable and pull every runnable thing that depends
    /// on one of them back out of the queue.
    ///
    /// O(n) over the queue; returns how many things were re-parked.
    pub fn resources_revoked(&mut self, resources: &[String]) -> usize {
        let revoked: HashSet<&str> = resources
            .iter()
            .filter(|r| self.available.remove(r.as_str()))
            .map(String::as_str)
            .collect();
        if revoked.is_empty() {
            return 0;
        }

        let displaced = self.queue.remove_matching(|thing| {
            thing
                .resources()
                .iter()
                .any(|r| revoked.contains(r.as_str()))
        });
        let count = displaced.len();
        for thing in displaced {
            self.own_or_relay(thing);
        }
        info!(resources = ?revoked, reparked = count, "resources revoked");
        count
    }

    /// Track the timer that will restore `resource`, replacing any older one.
    pub fn set_restore_timer(&mut self, resource: &str, handle: AbortHandle) {
        if let Some(old) = self.restore_timers.insert(resource.to_string(), handle) {
            old.abort();
        }
    }

    pub fn cancel_restore_timer(&mut self, resource: &str) {
        if let Some(handle) = self.restore_timers.remove(resource) {
            handle.abort();
        }
    }

    /// Missing resources of a parked thing, in declaration order. `None` when
    /// the thing is not parked.
    pub fn blocking_resources_for(&self, id: &ThingId) -> Option<Vec<String>> {
        let resource = self.blocked_by_id.get(id)?;
        let thing = self
            .blocked_by_resource
            .get(resource)?
            .iter()
            .find(|t| &t.id() == id)?;
        Some(
            thing
                .resources()
                .iter()
                .filter(|r| !self.available.contains(r.as_str()))
                .cloned()
                .collect(),
        )
    }

    /// Remove a thing from wherever it currently sits.
    pub fn remove_thing(&mut self, id: &ThingId) -> Option<TaskThing> {
        self.unpark(id).or_else(|| self.queue.remove(id))
    }

    /// Remove every queued or parked thing matching `filter`.
    pub fn remove_matching<F>(&mut self, mut filter: F) -> Vec<TaskThing>
    where
        F: FnMut(&TaskThing) -> bool,
    {
        let mut removed = self.queue.remove_matching(&mut filter);
        let parked: Vec<ThingId> = self
            .blocked_by_resource
            .values()
            .flatten()
            .filter(|&t| filter(t))
            .map(TaskThing::id)
            .collect();
        removed.extend(parked.iter().filter_map(|id| self.unpark(id)));
        removed
    }

    fn unpark(&mut self, id: &ThingId) -> Option<TaskThing> {
        let resource = self.blocked_by_id.remove(id)?;
        let list = self.blocked_by_resource.get_mut(&resource)?;
        let pos = list.iter().position(|t| &t.id() == id)?;
        let thing = list.remove(pos);
        if list.is_empty() {
            self.blocked_by_resource.remove(&resource);
        }
        Some(thing)
    }
}
