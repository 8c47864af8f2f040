//! A budgeted LRU cache for expensive-to-create GPU resources.
//!
//! GPU-side objects such as textures and stencil buffers are costly to create
//! and outlive the call that drew with them: a draw call enqueues backend work
//! and returns immediately, so the resource must stay alive until that work has
//! actually executed, long after the call site dropped its own reference.  This
//! crate provides the bookkeeping for that model via a few types:
//!
//! [RefCounts] tracks ordinary strong references plus pending GPU reads and writes.  A
//! resource is *purgeable* only once the cache holds the sole reference and no enqueued
//! work remains; reaching all-zero is the one and only destruction trigger.
//!
//! [ResourceKey] identifies a resource either by content (what data it holds) or by
//! shape ("scratch": any container of the right size and format will do).
//! [ScratchDescriptor] packs a shape into a key and supplies the size bucketing that
//! approximate matching uses to make nearby requests share containers.
//!
//! [ResourceCache] owns the resources: a hash index plus an LRU list under a dual
//! count/byte budget.  When over budget it purges least-recently-used purgeable
//! entries, and falls back to an owner-supplied overbudget callback (typically "flush
//! pending GPU work") when eviction alone is not enough.  A cache whose entries are all
//! externally referenced legitimately stays over budget.
//!
//! [ResourceContext] is the integration boundary: it invokes a [ResourceFactory] only
//! on a miss, applies exact or approximate scratch matching with the pending-I/O
//! selection policy, and forwards invalidation events posted through an
//! [InvalidationSender].
//!
//! Everything is single-threaded and cooperative.  Pending I/O is explicit counter
//! bookkeeping bridging CPU call-return and GPU completion, not thread
//! synchronization; no operation blocks, yields, or times out.

mod cache;
mod context;
mod invalidation;
mod key;
mod ownership;
mod resource;
mod scratch;

pub use cache::*;
pub use context::*;
pub use invalidation::*;
pub use key::*;
pub use ownership::*;
pub use resource::*;
pub use scratch::*;
