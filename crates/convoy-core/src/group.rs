//! Hierarchical completion tracking for related task things.
//!
//! Design:
//! - A group is created on first reference by name and counts its pending
//!   members. It resolves when the count reaches zero, and is removed from the
//!   name table at that instant so a later request for the same name starts fresh.
//! - Membership propagates: a task planned or queued with an origin that belongs
//!   to a group joins that group (`will_plan` / `will_execute`).
//! - A member is counted once while it is pending and decremented once when it
//!   finishes planning or execution. A thing re-queued under its own id (plan
//!   then execute, or a marker re-armed by its own execution) is recorded in
//!   `pending_id_reuses` so the finish that handed it on does not decrement.
//! - When a member moves into a child group, its slot in the old group is
//!   carried by the child and released when the child resolves. The first such
//!   group is the child's parent, which forms the tree.
//! - Follow-on tasks attach to the root group and are handed back to the caller
//!   when that group resolves.

use std::collections::{HashMap, HashSet};

use tokio::sync::watch;
use tracing::debug;

use crate::domain::{GroupId, RawTask, ThingId};

/// Future-like handle resolved when a group drains.
#[derive(Debug, Clone)]
pub struct GroupCompletion {
    group_id: GroupId,
    rx: watch::Receiver<bool>,
}

impl GroupCompletion {
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn is_done(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the group to drain. Also returns if the tracker was dropped.
    pub async fn wait(mut self) {
        let _ = self.rx.wait_for(|done| *done).await;
    }
}

/// A group that just drained.
#[derive(Debug)]
pub struct ResolvedGroup {
    pub id: GroupId,
    pub name: String,
    pub total: usize,
    pub follow_ons: Vec<RawTask>,
}

#[derive(Debug)]
struct TaskGroup {
    name: String,
    pending: usize,
    total: usize,
    parent: Option<GroupId>,
    /// Groups whose slots this group carries, released once each on resolution.
    carried: Vec<GroupId>,
    done: watch::Sender<bool>,
    follow_ons: Vec<RawTask>,
}

impl TaskGroup {
    fn new(name: &str) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            name: name.to_string(),
            pending: 0,
            total: 0,
            parent: None,
            carried: Vec::new(),
            done,
            follow_ons: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct TaskGroupTracker {
    next_group_id: u64,
    groups: HashMap<GroupId, TaskGroup>,
    by_name: HashMap<String, GroupId>,
    membership: HashMap<ThingId, GroupId>,
    pending_id_reuses: HashSet<ThingId>,
}

impl TaskGroupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn group_of(&self, member: &ThingId) -> Option<GroupId> {
        self.membership.get(member).copied()
    }

    /// `(pending, total)` of a live group.
    pub fn counts(&self, group_id: GroupId) -> Option<(usize, usize)> {
        self.groups.get(&group_id).map(|g| (g.pending, g.total))
    }

    /// Get or create the group called `name` and make `member` part of it.
    pub fn ensure_named_group(&mut self, name: &str, member: &ThingId) -> GroupCompletion {
        let existing = self.membership.get(member).copied();
        let group_id = match self.by_name.get(name) {
            Some(&id) => id,
            None => {
                let id = GroupId::new(self.next_group_id);
                self.next_group_id += 1;
                self.by_name.insert(name.to_string(), id);
                id
            }
        };
        let group = self
            .groups
            .entry(group_id)
            .or_insert_with(|| TaskGroup::new(name));

        if existing != Some(group_id) {
            if let Some(owner) = existing {
                if group.parent.is_none() {
                    group.parent = Some(owner);
                }
                group.carried.push(owner);
            }
            group.pending += 1;
            group.total += 1;
            self.membership.insert(member.clone(), group_id);
            debug!(group = name, member = %member, pending = group.pending, "joined task group");
        }

        GroupCompletion {
            group_id,
            rx: group.done.subscribe(),
        }
    }

    /// Root ancestor of the group `member` belongs to.
    pub fn root_group_for(&self, member: &ThingId) -> Option<GroupId> {
        let mut current = *self.membership.get(member)?;
        while let Some(parent) = self.groups.get(&current).and_then(|g| g.parent) {
            if !self.groups.contains_key(&parent) {
                break;
            }
            current = parent;
        }
        Some(current)
    }

    /// Attach `task` to run once `member`'s root group drains, creating an
    /// anonymous group around `member` if it has none.
    pub fn ensure_root_follow_on(&mut self, member: &ThingId, task: RawTask) -> GroupId {
        let root = match self.root_group_for(member) {
            Some(root) => root,
            None => {
                let name = format!("ensured:{}", self.next_group_id);
                self.ensure_named_group(&name, member).group_id()
            }
        };
        if let Some(group) = self.groups.get_mut(&root) {
            group.follow_ons.push(task);
        }
        root
    }

    /// A task is about to be planned on behalf of `origin`.
    pub fn will_plan(&mut self, id: &ThingId, origin: Option<&ThingId>) {
        self.inherit(id, origin);
    }

    /// A thing is about to be queued for execution on behalf of `origin`.
    pub fn will_execute(&mut self, id: &ThingId, origin: Option<&ThingId>) {
        if origin == Some(id) {
            if self.membership.contains_key(id) {
                self.pending_id_reuses.insert(id.clone());
            }
            return;
        }
        self.inherit(id, origin);
    }

    pub fn planned(&mut self, id: &ThingId) -> Vec<ResolvedGroup> {
        self.finished(id)
    }

    pub fn executed(&mut self, id: &ThingId) -> Vec<ResolvedGroup> {
        self.finished(id)
    }

    /// A pending member left without finishing (e.g. its account was removed).
    pub fn abandon(&mut self, id: &ThingId) -> Vec<ResolvedGroup> {
        self.pending_id_reuses.remove(id);
        self.finished(id)
    }

    fn inherit(&mut self, id: &ThingId, origin: Option<&ThingId>) {
        let Some(group_id) = origin.and_then(|o| self.membership.get(o)).copied() else {
            return;
        };
        if self.membership.contains_key(id) {
            return;
        }
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.pending += 1;
            group.total += 1;
            self.membership.insert(id.clone(), group_id);
        }
    }

    fn finished(&mut self, id: &ThingId) -> Vec<ResolvedGroup> {
        if self.pending_id_reuses.remove(id) {
            return Vec::new();
        }
        match self.membership.remove(id) {
            Some(group_id) => self.decrement(group_id),
            None => Vec::new(),
        }
    }

    fn decrement(&mut self, group_id: GroupId) -> Vec<ResolvedGroup> {
        let mut resolved = Vec::new();
        let mut work = vec![group_id];
        while let Some(id) = work.pop() {
            let Some(group) = self.groups.get_mut(&id) else {
                continue;
            };
            group.pending = group.pending.saturating_sub(1);
            if group.pending > 0 {
                continue;
            }
            let Some(group) = self.groups.remove(&id) else {
                continue;
            };
            if self.by_name.get(&group.name) == Some(&id) {
                self.by_name.remove(&group.name);
            }
            group.done.send_replace(true);
            debug!(group = %group.name, total = group.total, "task group resolved");
            work.extend(group.carried.iter().copied());
            resolved.push(ResolvedGroup {
                id,
                name: group.name,
                total: group.total,
                follow_ons: group.follow_ons,
            });
        }
        resolved
    }

}
