//! Content-invalidation messages posted by the owning context.
//!
//! When the semantic data behind a content key changes or disappears (an
//! upstream generation counter ticked, a source image was dropped), the
//! context posts the key here. The cache drains the queue at the start of its
//! next purge pass and deletes any now-purgeable entry under a posted key;
//! entries still externally referenced survive and are evicted naturally once
//! they become purgeable.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::key::ResourceKey;

type Queue = Rc<RefCell<VecDeque<ResourceKey>>>;

/// Posting half of the invalidation channel. Cheap to clone; every clone
/// feeds the same cache.
#[derive(Clone)]
pub struct InvalidationSender {
    queue: Queue,
}

impl InvalidationSender {
    pub fn post(&self, key: ResourceKey) {
        self.queue.borrow_mut().push_back(key);
    }
}

/// Receiving half, owned by the cache.
pub(crate) struct InvalidationInbox {
    queue: Queue,
}

impl InvalidationInbox {
    pub(crate) fn new() -> InvalidationInbox {
        InvalidationInbox {
            queue: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    pub(crate) fn sender(&self) -> InvalidationSender {
        InvalidationSender {
            queue: self.queue.clone(),
        }
    }

    /// Take every message posted so far, oldest first.
    pub(crate) fn drain(&self) -> Vec<ResourceKey> {
        self.queue.borrow_mut().drain(..).collect()
    }
}
