//! The resource cache: slot storage with a key index and an LRU list under a
//! dual count/byte budget.
//!
//! Entries live simultaneously in a hash index (key to slot indices; a
//! scratch key may own several) and in an index-linked doubly-linked recency
//! list (head = most recently used). Purging walks the list from the tail,
//! deleting purgeable entries until the budget holds; if that is not enough,
//! an owner-supplied overbudget callback gets one chance to free more (for
//! example by flushing enqueued GPU work) before the scan repeats once.
//!
//! The cache may legitimately stay over budget when every resident entry is
//! externally referenced; that is expected behavior, not a failure.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::invalidation::{InvalidationInbox, InvalidationSender};
use crate::key::ResourceKey;
use crate::ownership::{RefCounts, RefTransition};
use crate::resource::{Resource, ResourceId};
use crate::scratch::PendingIoPolicy;

type KeyIndex = HashMap<ResourceKey, Vec<u32>, ahash::RandomState>;

/// Budget and policy knobs for a [ResourceCache].
#[derive(Debug, Clone, derive_builder::Builder)]
pub struct ResourceCacheConfig {
    /// Maximum number of resident resources.
    pub max_count: usize,
    /// Maximum total bytes of resident resources.
    pub max_bytes: u64,
    /// Keep scratch containers resident for reuse once they become
    /// purgeable. When false they are deleted the moment their external
    /// references drop; some backends recycle poorly enough that holding
    /// them is a net loss.
    #[builder(default = "true")]
    pub reuse_scratch: bool,
}

/// Callback invoked when a purge scan alone cannot bring the cache within
/// budget. Returning true signals that resources may have been freed (for
/// example by flushing pending GPU work, which completes pending I/O) and
/// earns exactly one more scan.
///
/// The callback runs inside the active purge pass, so it may release
/// references and complete I/O on the cache it is handed, but it must not
/// add resources.
pub type OverbudgetCallback<R> = Box<dyn FnMut(&mut ResourceCache<R>) -> bool>;

struct Entry<R> {
    resource: R,
    key: ResourceKey,
    refs: RefCounts,
    /// Snapshot of `gpu_memory_size()`, kept in sync through
    /// [ResourceCache::did_change_resource_size].
    cached_size: u64,
    /// Toward the head (more recently used).
    prev: Option<u32>,
    /// Toward the tail (less recently used).
    next: Option<u32>,
}

enum SlotState<R> {
    /// Vacant, possibly pointing at the next vacant slot.
    Empty { next_empty: Option<u32> },
    /// Holds a resident entry, doubly linked into the recency list.
    Occupied(Entry<R>),
}

struct Slot<R> {
    /// Bumped every time the slot is vacated, so stale ids are caught.
    generation: u32,
    state: SlotState<R>,
}

impl<R> Slot<R> {
    fn entry(&self) -> &Entry<R> {
        match &self.state {
            SlotState::Occupied(entry) => entry,
            SlotState::Empty { .. } => panic!("slot should be occupied"),
        }
    }

    fn entry_mut(&mut self) -> &mut Entry<R> {
        match &mut self.state {
            SlotState::Occupied(entry) => entry,
            SlotState::Empty { .. } => panic!("slot should be occupied"),
        }
    }
}

/// Cache of GPU resources under a dual (count + byte) budget.
///
/// The cache owns its resources outright. External holders address them
/// through [ResourceId] handles and the ref/pending-I/O operations; an entry
/// becomes eligible for eviction only when the cache's own reference is the
/// last one and no enqueued GPU work remains.
pub struct ResourceCache<R: Resource> {
    slots: Vec<Slot<R>>,
    index: KeyIndex,
    lru_head: Option<u32>,
    lru_tail: Option<u32>,
    empty_head: Option<u32>,
    entry_count: usize,
    entry_bytes: u64,
    max_count: usize,
    max_bytes: u64,
    reuse_scratch: bool,
    /// Deleting one entry can release references on others; the guard folds
    /// such nested purge requests into the active pass.
    purging: bool,
    overbudget_cb: Option<OverbudgetCallback<R>>,
    inbox: InvalidationInbox,
}

impl<R: Resource> ResourceCache<R> {
    pub fn new(config: ResourceCacheConfig) -> ResourceCache<R> {
        ResourceCache {
            slots: Vec::new(),
            index: KeyIndex::default(),
            lru_head: None,
            lru_tail: None,
            empty_head: None,
            entry_count: 0,
            entry_bytes: 0,
            max_count: config.max_count,
            max_bytes: config.max_bytes,
            reuse_scratch: config.reuse_scratch,
            purging: false,
            overbudget_cb: None,
            inbox: InvalidationInbox::new(),
        }
    }

    /// Insert a freshly created resource under `key`.
    ///
    /// The returned id carries the creator's reference; the cache holds its
    /// own for as long as the entry is resident. Inserting may immediately
    /// purge other entries to stay within budget.
    pub fn add_resource(&mut self, key: ResourceKey, resource: R) -> ResourceId {
        // New resources while a purge pass is deleting entries could keep the
        // pass from ever converging.
        assert!(!self.purging, "add_resource during a purge pass");
        if !key.is_scratch() {
            assert!(
                !self.index.contains_key(&key),
                "content key is already resident"
            );
        }
        self.debug_validate();

        let cached_size = resource.gpu_memory_size();
        let index = self.find_empty();
        let mut refs = RefCounts::new();
        // The creator's reference travels out through the returned id; this
        // second one is the cache's own.
        refs.add_ref();
        self.slots[index as usize].state = SlotState::Occupied(Entry {
            resource,
            key,
            refs,
            cached_size,
            prev: None,
            next: None,
        });
        self.attach_to_head(index);
        self.index.entry(key).or_insert_with(Vec::new).push(index);
        self.entry_count += 1;
        self.entry_bytes += cached_size;
        debug!(?key, bytes = cached_size, "added resource");

        self.purge_as_needed(0, 0);
        ResourceId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    /// Look up a content key.
    ///
    /// On a hit the entry becomes the most recently used and the returned id
    /// carries a new external reference; a miss has no side effects.
    pub fn find(&mut self, key: &ResourceKey) -> Option<ResourceId> {
        assert!(!key.is_scratch(), "content lookup with a scratch key");
        self.debug_validate();

        let index = self.index.get(key)?[0];
        self.make_most_recent(index);
        self.slots[index as usize].entry_mut().refs.add_ref();
        trace!(?key, "content hit");
        Some(ResourceId {
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    /// Look up a scratch key.
    ///
    /// Only containers held by nobody but the cache are candidates; `policy`
    /// decides whether outstanding GPU work disqualifies them. On a hit the
    /// entry becomes the most recently used and the returned id carries a new
    /// external reference; a miss has no side effects.
    pub fn find_and_ref_scratch(
        &mut self,
        key: &ResourceKey,
        policy: PendingIoPolicy,
    ) -> Option<ResourceId> {
        assert!(key.is_scratch(), "scratch lookup with a content key");
        self.debug_validate();

        let bucket = self.index.get(key)?;
        let mut chosen = None;
        let mut fallback = None;
        for &index in bucket {
            let entry = self.slots[index as usize].entry();
            if !entry.refs.reffed_only_by_cache() {
                continue;
            }
            if entry.refs.has_pending_io() {
                match policy {
                    PendingIoPolicy::RequireNone => continue,
                    PendingIoPolicy::PreferNone => {
                        fallback.get_or_insert(index);
                        continue;
                    }
                    PendingIoPolicy::Any => {}
                }
            }
            chosen = Some(index);
            break;
        }

        let index = chosen.or(fallback)?;
        self.make_most_recent(index);
        self.slots[index as usize].entry_mut().refs.add_ref();
        trace!(?key, "scratch hit");
        Some(ResourceId {
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    /// Take an additional strong reference on `id`.
    pub fn ref_resource(&mut self, id: ResourceId) {
        self.entry_of_mut(id).refs.add_ref();
    }

    /// Release a strong reference on `id`.
    pub fn unref_resource(&mut self, id: ResourceId) {
        let transition = self.entry_of_mut(id).refs.unref();
        self.apply_transition(id, transition);
    }

    /// Record that a GPU read of `id` has been enqueued but not executed.
    pub fn add_pending_read(&mut self, id: ResourceId) {
        self.entry_of_mut(id).refs.add_pending_read();
    }

    /// The enqueued read of `id` has executed.
    pub fn completed_read(&mut self, id: ResourceId) {
        let transition = self.entry_of_mut(id).refs.completed_read();
        self.apply_transition(id, transition);
    }

    /// Record that a GPU write to `id` has been enqueued but not executed.
    pub fn add_pending_write(&mut self, id: ResourceId) {
        self.entry_of_mut(id).refs.add_pending_write();
    }

    /// The enqueued write to `id` has executed.
    pub fn completed_write(&mut self, id: ResourceId) {
        let transition = self.entry_of_mut(id).refs.completed_write();
        self.apply_transition(id, transition);
    }

    pub fn is_purgeable(&self, id: ResourceId) -> bool {
        self.entry_of(id).refs.is_purgeable()
    }

    pub fn reffed_only_by_cache(&self, id: ResourceId) -> bool {
        self.entry_of(id).refs.reffed_only_by_cache()
    }

    pub fn has_pending_io(&self, id: ResourceId) -> bool {
        self.entry_of(id).refs.has_pending_io()
    }

    /// Borrow the resource behind `id`.
    pub fn resource(&self, id: ResourceId) -> &R {
        &self.entry_of(id).resource
    }

    pub fn resource_mut(&mut self, id: ResourceId) -> &mut R {
        &mut self.entry_of_mut(id).resource
    }

    /// The key `id` is resident under.
    pub fn key(&self, id: ResourceId) -> ResourceKey {
        self.entry_of(id).key
    }

    /// Whether `id` still addresses a live resource.
    pub fn contains(&self, id: ResourceId) -> bool {
        self.slots.get(id.index as usize).map_or(false, |slot| {
            slot.generation == id.generation && matches!(slot.state, SlotState::Occupied(_))
        })
    }

    /// Whether any resource is resident under `key`.
    pub fn has_key(&self, key: &ResourceKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn cached_resource_count(&self) -> usize {
        self.entry_count
    }

    pub fn cached_resource_bytes(&self) -> u64 {
        self.entry_bytes
    }

    pub fn limits(&self) -> (usize, u64) {
        (self.max_count, self.max_bytes)
    }

    /// Replace the budget. Shrinking either limit purges immediately.
    pub fn set_limits(&mut self, max_count: usize, max_bytes: u64) {
        let smaller = max_count < self.max_count || max_bytes < self.max_bytes;
        self.max_count = max_count;
        self.max_bytes = max_bytes;
        if smaller {
            self.purge_as_needed(0, 0);
        }
    }

    pub fn reuses_scratch(&self) -> bool {
        self.reuse_scratch
    }

    /// Install the hook consulted when a purge scan alone cannot reach the
    /// budget.
    pub fn set_overbudget_callback(
        &mut self,
        callback: impl FnMut(&mut ResourceCache<R>) -> bool + 'static,
    ) {
        self.overbudget_cb = Some(Box::new(callback));
    }

    /// Handle for posting content-invalidation events; messages are consumed
    /// at the start of the next purge pass.
    pub fn invalidation_sender(&self) -> InvalidationSender {
        self.inbox.sender()
    }

    /// Re-read `gpu_memory_size()` for `id` and fold the delta into the byte
    /// total. Growth can push the cache over budget and triggers a purge.
    pub fn did_change_resource_size(&mut self, id: ResourceId) {
        let entry = self.entry_of_mut(id);
        let old = entry.cached_size;
        let new = entry.resource.gpu_memory_size();
        entry.cached_size = new;
        if new > old {
            self.did_increase_resource_size(new - old);
        } else if new < old {
            self.did_decrease_resource_size(old - new);
        }
    }

    /// Bring the cache within budget by evicting least-recently-used
    /// purgeable entries.
    ///
    /// `extra_count` and `extra_bytes` reserve headroom for resources about
    /// to be added. Pending invalidation messages are drained first. If the
    /// scan cannot reach the budget and an overbudget callback is installed,
    /// the callback runs once; a true return earns one more scan. Anything
    /// that becomes purgeable re-entrantly (the callback releasing resources
    /// while entries are being destroyed) is absorbed into this pass by the
    /// guard flag and the scan's convergence loop.
    pub fn purge_as_needed(&mut self, extra_count: usize, extra_bytes: u64) {
        if self.purging {
            return;
        }
        self.purging = true;

        self.purge_invalidated();
        self.internal_purge(extra_count, extra_bytes);
        if self.over_budget(extra_count, extra_bytes) && self.overbudget_cb.is_some() {
            // Still over budget after the scan; ask the owner to flush.
            let mut callback = self.overbudget_cb.take().expect("checked above");
            let freed = callback(&mut *self);
            if self.overbudget_cb.is_none() {
                self.overbudget_cb = Some(callback);
            }
            if freed {
                self.internal_purge(extra_count, extra_bytes);
            }
        }

        self.purging = false;
        self.debug_validate();
    }

    /// Evict every purgeable entry regardless of budget headroom.
    ///
    /// One entry can hold references on another, so entries are not kicked
    /// out in a single sweep: the budget is dropped to zero, the normal purge
    /// convergence runs, and the budget is restored without re-evicting the
    /// survivors.
    pub fn purge_all_unlocked(&mut self) {
        self.debug_validate();
        let saved_count = self.max_count;
        let saved_bytes = self.max_bytes;
        self.max_count = 0;
        self.max_bytes = 0;
        self.purge_as_needed(0, 0);
        self.max_count = saved_count;
        self.max_bytes = saved_bytes;
    }

    /// Structural check of every bookkeeping invariant. Debug builds only;
    /// O(resident entries).
    #[cfg(debug_assertions)]
    pub fn validate(&self) {
        let mut seen = 0usize;
        let mut bytes = 0u64;
        let mut prev_expected: Option<u32> = None;
        let mut cursor = self.lru_head;
        while let Some(index) = cursor {
            let entry = self.slots[index as usize].entry();
            assert_eq!(entry.prev, prev_expected);
            entry.refs.validate();
            assert_eq!(entry.cached_size, entry.resource.gpu_memory_size());
            let bucket = self
                .index
                .get(&entry.key)
                .expect("resident entry missing from the key index");
            assert!(bucket.contains(&index));
            if !entry.key.is_scratch() {
                assert_eq!(bucket.len(), 1, "content keys are unique");
            }
            seen += 1;
            bytes += entry.cached_size;
            prev_expected = Some(index);
            cursor = entry.next;
        }
        assert_eq!(self.lru_tail, prev_expected);
        assert_eq!(seen, self.entry_count);
        assert_eq!(bytes, self.entry_bytes);

        let indexed: usize = self.index.values().map(Vec::len).sum();
        assert_eq!(indexed, self.entry_count);
        assert!(self.index.values().all(|bucket| !bucket.is_empty()));
    }

    #[cfg(not(debug_assertions))]
    pub fn validate(&self) {}

    fn debug_validate(&self) {
        #[cfg(debug_assertions)]
        self.validate();
    }

    fn slot_of(&self, id: ResourceId) -> &Slot<R> {
        let slot = &self.slots[id.index as usize];
        assert!(
            slot.generation == id.generation && matches!(slot.state, SlotState::Occupied(_)),
            "stale resource id: the resource was already destroyed"
        );
        slot
    }

    fn slot_of_mut(&mut self, id: ResourceId) -> &mut Slot<R> {
        let slot = &mut self.slots[id.index as usize];
        assert!(
            slot.generation == id.generation && matches!(slot.state, SlotState::Occupied(_)),
            "stale resource id: the resource was already destroyed"
        );
        slot
    }

    fn entry_of(&self, id: ResourceId) -> &Entry<R> {
        self.slot_of(id).entry()
    }

    fn entry_of_mut(&mut self, id: ResourceId) -> &mut Entry<R> {
        self.slot_of_mut(id).entry_mut()
    }

    fn apply_transition(&mut self, id: ResourceId, transition: RefTransition) {
        match transition {
            RefTransition::None => {}
            RefTransition::Purgeable => self.notify_purgeable(id),
            RefTransition::Destroy => {
                // The cache holds one reference for as long as the entry is
                // resident, so a caller can never legitimately drain every
                // counter.
                panic!("released the cache's own reference");
            }
        }
    }

    /// A resident resource just dropped to cache-only ownership.
    fn notify_purgeable(&mut self, id: ResourceId) {
        // Scratch containers go at once when reuse is disabled; everything
        // else stays resident, eligible for LRU eviction.
        if !self.reuse_scratch && self.entry_of(id).key.is_scratch() {
            self.delete_entry(id.index);
        }
    }

    fn purge_invalidated(&mut self) {
        for key in self.inbox.drain() {
            // Entries still referenced survive the message; they are evicted
            // once they become purgeable, and fresh content will be stored
            // under a new key anyway.
            while let Some(index) = self.find_purgeable_index(&key) {
                debug!(?key, "purging invalidated entry");
                self.delete_entry(index);
            }
        }
    }

    fn find_purgeable_index(&self, key: &ResourceKey) -> Option<u32> {
        self.index
            .get(key)?
            .iter()
            .copied()
            .find(|&index| self.slots[index as usize].entry().refs.is_purgeable())
    }

    fn over_budget(&self, extra_count: usize, extra_bytes: u64) -> bool {
        self.entry_count + extra_count > self.max_count
            || self.entry_bytes + extra_bytes > self.max_bytes
    }

    fn internal_purge(&mut self, extra_count: usize, extra_bytes: u64) {
        debug_assert!(self.purging);

        // Deleting entries can release references on others, so rescan until
        // the budget holds or a whole scan deletes nothing.
        let mut within_budget = false;
        let mut changed = true;
        while !within_budget && changed {
            changed = false;
            let mut cursor = self.lru_tail;
            while let Some(index) = cursor {
                if !self.over_budget(extra_count, extra_bytes) {
                    within_budget = true;
                    break;
                }
                let entry = self.slots[index as usize].entry();
                let toward_head = entry.prev;
                if entry.refs.is_purgeable() {
                    changed = true;
                    self.delete_entry(index);
                }
                cursor = toward_head;
            }
        }
    }

    /// Remove the entry from the index and recency list and destroy its
    /// resource. The entry must be purgeable.
    fn delete_entry(&mut self, index: u32) {
        debug_assert!(self.slots[index as usize].entry().refs.is_purgeable());

        self.remove_from_index(index);
        self.unlink(index);
        self.entry_count -= 1;
        self.entry_bytes -= self.slots[index as usize].entry().cached_size;

        // Dropping the cache's own reference is what actually kills it.
        let transition = self.slots[index as usize].entry_mut().refs.unref();
        debug_assert_eq!(transition, RefTransition::Destroy);
        self.destroy_slot(index);
    }

    /// Run the release hook and return the slot to the free list.
    fn destroy_slot(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        let mut state = SlotState::Empty {
            next_empty: self.empty_head,
        };
        std::mem::swap(&mut state, &mut slot.state);
        slot.generation = slot.generation.wrapping_add(1);
        self.empty_head = Some(index);
        match state {
            SlotState::Occupied(mut entry) => {
                trace!(key = ?entry.key, "destroying resource");
                if !entry.resource.is_wrapped() {
                    entry.resource.on_release();
                }
            }
            SlotState::Empty { .. } => panic!("slot should have been occupied"),
        }
    }

    fn remove_from_index(&mut self, index: u32) {
        let key = self.slots[index as usize].entry().key;
        let bucket = self
            .index
            .get_mut(&key)
            .expect("entry key missing from the index");
        let position = bucket
            .iter()
            .position(|&candidate| candidate == index)
            .expect("entry missing from its key bucket");
        bucket.swap_remove(position);
        if bucket.is_empty() {
            self.index.remove(&key);
        }
    }

    /// Entirely unlink an occupied index from the recency list.
    fn unlink(&mut self, index: u32) {
        // Easiest to handle the tail first.
        if Some(index) == self.lru_tail {
            self.lru_tail = self.slots[index as usize].entry().prev;
        }

        if Some(index) == self.lru_head {
            // Unlinking the head is special.
            self.lru_head = self.slots[index as usize].entry().next;
            if let Some(next) = self.lru_head {
                self.slots[next as usize].entry_mut().prev = None;
            }
            return;
        }

        // Otherwise a standard linked list unlink.
        let old_prev = self.slots[index as usize]
            .entry()
            .prev
            .expect("isn't the head");
        let old_next = self.slots[index as usize].entry().next;
        self.slots[old_prev as usize].entry_mut().next = old_next;
        if let Some(next) = old_next {
            self.slots[next as usize].entry_mut().prev = Some(old_prev);
        }
    }

    /// Given the index of an occupied entry, make it the most recent item.
    fn make_most_recent(&mut self, index: u32) {
        self.unlink(index);
        self.attach_to_head(index);
    }

    fn attach_to_head(&mut self, index: u32) {
        let old_head = self.lru_head;
        {
            let entry = self.slots[index as usize].entry_mut();
            entry.prev = None;
            entry.next = old_head;
        }
        if let Some(head) = old_head {
            self.slots[head as usize].entry_mut().prev = Some(index);
        }
        self.lru_head = Some(index);

        // If this is the only entry there is no tail yet.
        if self.lru_tail.is_none() {
            self.lru_tail = Some(index);
        }
    }

    /// Find an available empty slot, or make one if necessary.
    fn find_empty(&mut self) -> u32 {
        if let Some(empty) = self.empty_head {
            self.empty_head = match &self.slots[empty as usize].state {
                SlotState::Empty { next_empty } => *next_empty,
                SlotState::Occupied(_) => panic!("free list points at an occupied slot"),
            };
            return empty;
        }

        self.slots.push(Slot {
            generation: 0,
            state: SlotState::Empty { next_empty: None },
        });
        (self.slots.len() - 1) as u32
    }

    fn did_increase_resource_size(&mut self, amount: u64) {
        self.entry_bytes += amount;
        self.purge_as_needed(0, 0);
    }

    fn did_decrease_resource_size(&mut self, amount: u64) {
        self.entry_bytes -= amount;
        self.debug_validate();
    }
}

impl<R: Resource> Drop for ResourceCache<R> {
    /// Teardown destroys every entry, locked or not.
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if let SlotState::Occupied(entry) = &mut slot.state {
                if !entry.resource.is_wrapped() {
                    entry.resource.on_release();
                }
            }
        }
    }
}
