//! Priority queue of runnable task things.
//!
//! Design:
//! - Min-heap keyed by negated priority, so the highest priority is always the
//!   extractable minimum.
//! - `positions` maps each id to its heap slot for O(log n) removal and re-keying.
//! - `tag_index` maps a priority tag to the ids carrying it so a boost change
//!   only touches the k affected nodes.
//! - Boosts are contributed per owner and summed into one total per tag. A tag
//!   whose total drops back to zero is removed from the sum table.
//!
//! Priority of a thing = `rel_priority + sum(summed boost of each distinct tag)`.
//! Ties are broken by heap order; there is no FIFO guarantee.

use std::collections::{HashMap, HashSet};

use crate::domain::{TaskThing, ThingId};

#[derive(Debug, Clone)]
struct HeapSlot {
    /// Negated priority.
    key: i64,
    id: ThingId,
}

/// Per-tag boost contributed by one owner (e.g. "what the UI is showing").
pub type TagBoosts = HashMap<String, i64>;

#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: Vec<HeapSlot>,
    positions: HashMap<ThingId, usize>,
    things: HashMap<ThingId, TaskThing>,
    tag_index: HashMap<String, HashSet<ThingId>>,
    owner_boosts: HashMap<String, TagBoosts>,
    summed_boosts: HashMap<String, i64>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: &ThingId) -> bool {
        self.positions.contains_key(id)
    }

    pub fn get(&self, id: &ThingId) -> Option<&TaskThing> {
        self.things.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskThing> {
        self.things.values()
    }

    /// Current summed boost for a tag (0 when nobody boosts it).
    pub fn tag_boost(&self, tag: &str) -> i64 {
        self.summed_boosts.get(tag).copied().unwrap_or(0)
    }

    /// Effective priority of `thing` under the current boosts.
    pub fn priority_of(&self, thing: &TaskThing) -> i64 {
        let mut seen = HashSet::new();
        thing.rel_priority()
            + thing
                .priority_tags()
                .iter()
                .filter(|tag| seen.insert(tag.as_str()))
                .map(|tag| self.tag_boost(tag))
                .sum::<i64>()
    }

    /// Insert a thing, or replace the value of one already present and move it
    /// to its new position.
    pub fn insert(&mut self, thing: TaskThing) {
        let id = thing.id();
        let key = -self.priority_of(&thing);
        let tags = distinct_tags(&thing);

        if let Some(old) = self.things.insert(id.clone(), thing) {
            self.untrack_tags(&id, &distinct_tags(&old));
            if let Some(&pos) = self.positions.get(&id) {
                self.rekey(pos, key);
            }
        } else {
            self.heap.push(HeapSlot {
                key,
                id: id.clone(),
            });
            let pos = self.heap.len() - 1;
            self.positions.insert(id.clone(), pos);
            self.sift_up(pos);
        }
        self.track_tags(&id, &tags);
    }

    pub fn remove(&mut self, id: &ThingId) -> Option<TaskThing> {
        let pos = *self.positions.get(id)?;
        self.remove_slot(pos);
        let thing = self.things.remove(id)?;
        self.untrack_tags(id, &distinct_tags(&thing));
        Some(thing)
    }

    pub fn pop_highest_priority(&mut self) -> Option<TaskThing> {
        let id = self.heap.first()?.id.clone();
        self.remove(&id)
    }

    /// Remove every thing matching `filter`. O(n) over the queue.
    pub fn remove_matching<F>(&mut self, mut filter: F) -> Vec<TaskThing>
    where
        F: FnMut(&TaskThing) -> bool,
    {
        let doomed: Vec<ThingId> = self
            .things
            .iter()
            .filter(|(_, thing)| filter(thing))
            .map(|(id, _)| id.clone())
            .collect();
        doomed.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Replace `owner`'s boost map (`None` clears it) and re-key every thing
    /// carrying an affected tag.
    ///
    /// Deltas are accumulated per thing first so a thing carrying several
    /// changed tags is moved once.
    pub fn reprioritize_owner_tags(&mut self, owner: &str, boosts: Option<TagBoosts>) {
        let old = self.owner_boosts.remove(owner).unwrap_or_default();
        let new = boosts.unwrap_or_default();

        let mut tag_deltas: Vec<(String, i64)> = Vec::new();
        for (tag, &value) in &new {
            let delta = value - old.get(tag).copied().unwrap_or(0);
            if delta != 0 {
                tag_deltas.push((tag.clone(), delta));
            }
        }
        for (tag, &value) in &old {
            if !new.contains_key(tag) && value != 0 {
                tag_deltas.push((tag.clone(), -value));
            }
        }

        let mut thing_deltas: HashMap<ThingId, i64> = HashMap::new();
        for (tag, delta) in &tag_deltas {
            let total = self.summed_boosts.entry(tag.clone()).or_insert(0);
            *total += delta;
            if *total == 0 {
                self.summed_boosts.remove(tag);
            }
            if let Some(ids) = self.tag_index.get(tag) {
                for id in ids {
                    *thing_deltas.entry(id.clone()).or_insert(0) += delta;
                }
            }
        }

        for (id, delta) in thing_deltas {
            if delta == 0 {
                continue;
            }
            if let Some(&pos) = self.positions.get(&id) {
                let key = self.heap[pos].key - delta;
                self.rekey(pos, key);
            }
        }

        if !new.is_empty() {
            self.owner_boosts.insert(owner.to_string(), new);
        }
    }

    /// Move the slot at `pos` to reflect `key`: in-place decrease-key when the
    /// priority rose, remove-then-reinsert when it fell, nothing on a tie.
    fn rekey(&mut self, pos: usize, key: i64) {
        let old = self.heap[pos].key;
        if key < old {
            self.heap[pos].key = key;
            self.sift_up(pos);
        } else if key > old {
            if let Some(mut slot) = self.remove_slot(pos) {
                slot.key = key;
                self.heap.push(slot);
                let new_pos = self.heap.len() - 1;
                self.positions.insert(self.heap[new_pos].id.clone(), new_pos);
                self.sift_up(new_pos);
            }
        }
    }

    fn remove_slot(&mut self, pos: usize) -> Option<HeapSlot> {
        let last = self.heap.len().checked_sub(1)?;
        self.swap(pos, last);
        let slot = self.heap.pop()?;
        self.positions.remove(&slot.id);
        if pos < self.heap.len() {
            if pos > 0 && self.heap[pos].key < self.heap[(pos - 1) / 2].key {
                self.sift_up(pos);
            } else {
                self.sift_down(pos);
            }
        }
        Some(slot)
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.heap[pos].key >= self.heap[parent].key {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;
            if left < len && self.heap[left].key < self.heap[smallest].key {
                smallest = left;
            }
            if right < len && self.heap[right].key < self.heap[smallest].key {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        if let Some(p) = self.positions.get_mut(&self.heap[a].id) {
            *p = a;
        }
        if let Some(p) = self.positions.get_mut(&self.heap[b].id) {
            *p = b;
        }
    }

    fn track_tags(&mut self, id: &ThingId, tags: &[String]) {
        for tag in tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(id.clone());
        }
    }

    fn untrack_tags(&mut self, id: &ThingId, tags: &[String]) {
        for tag in tags {
            if let Some(ids) = self.tag_index.get_mut(tag) {
                ids.remove(id);
                if ids.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
    }
}

fn distinct_tags(thing: &TaskThing) -> Vec<String> {
    let mut seen = HashSet::new();
    thing
        .priority_tags()
        .iter()
        .filter(|tag| seen.insert(tag.as_str()))
        .cloned()
        .collect()
}
