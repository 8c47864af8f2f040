//! The contract cached objects satisfy, and the handle used to address them.

/// An expensive-to-create object managed by a [crate::ResourceCache].
///
/// The cache never talks to the GPU backend; everything it needs from the
/// object is its size and a pair of teardown hooks.
pub trait Resource {
    /// Approximate bytes of GPU memory consumed by this resource.
    ///
    /// The value may change over the resource's life (e.g. a buffer is
    /// reallocated); report changes promptly through
    /// [crate::ResourceCache::did_change_resource_size] so the byte budget
    /// stays accurate.
    fn gpu_memory_size(&self) -> u64;

    /// Whether the underlying backend object is owned by the embedder rather
    /// than the cache. Wrapped resources skip [Resource::on_release] at
    /// teardown; nothing else about them differs.
    fn is_wrapped(&self) -> bool {
        false
    }

    /// Invoked exactly once, when the cache permanently drops the resource.
    fn on_release(&mut self) {}
}

/// Handle addressing a resource inside a [crate::ResourceCache].
///
/// Ids are generation-checked indices into the cache's slot storage: once the
/// resource is destroyed, presenting its id again is a contract violation and
/// panics instead of silently touching a recycled slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}
