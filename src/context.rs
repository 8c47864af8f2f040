//! The owning-context boundary.
//!
//! A [ResourceContext] couples a [ResourceCache] with the backend factory
//! that fills it. The cache never allocates GPU memory itself; the context
//! drives the factory on a miss, chooses exact or approximate scratch
//! matching per call site, and forwards invalidation events from whatever
//! upstream data sources back the content keys.

use tracing::trace;

use crate::cache::{ResourceCache, ResourceCacheConfig};
use crate::invalidation::InvalidationSender;
use crate::key::{ResourceKey, ResourceType};
use crate::resource::{Resource, ResourceId};
use crate::scratch::{PendingIoPolicy, ScratchDescriptor, ScratchMatch};

/// Creates backend resources on a cache miss.
pub trait ResourceFactory {
    type Resource: Resource;
    type Error: std::error::Error;

    /// Key tag for the resources this factory creates.
    const RESOURCE_TYPE: ResourceType;

    fn create(&mut self, desc: &ScratchDescriptor) -> Result<Self::Resource, Self::Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError<E: std::error::Error> {
    /// The backend could not create the requested resource.
    #[error("backend resource creation failed: {0}")]
    Backend(E),
}

/// Drives a [ResourceCache] with a backend factory and the scratch matching
/// policy.
pub struct ResourceContext<F: ResourceFactory> {
    cache: ResourceCache<F::Resource>,
    factory: F,
}

impl<F: ResourceFactory> ResourceContext<F> {
    pub fn new(factory: F, config: ResourceCacheConfig) -> ResourceContext<F> {
        ResourceContext {
            cache: ResourceCache::new(config),
            factory,
        }
    }

    pub fn cache(&self) -> &ResourceCache<F::Resource> {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ResourceCache<F::Resource> {
        &mut self.cache
    }

    /// Find the resource cached under `key`, creating it from `desc` on a
    /// miss. The returned id carries an external reference either way.
    pub fn find_or_create(
        &mut self,
        key: ResourceKey,
        desc: &ScratchDescriptor,
    ) -> Result<ResourceId, ContextError<F::Error>> {
        if let Some(id) = self.cache.find(&key) {
            return Ok(id);
        }
        let resource = self.factory.create(desc).map_err(ContextError::Backend)?;
        Ok(self.cache.add_resource(key, resource))
    }

    /// Acquire a scratch container for `desc`.
    ///
    /// With [ScratchMatch::Approximate] the requested size is first rounded
    /// up to its bucket, and a miss is retried once with the no-stencil
    /// requirement dropped before a new container is created. `during_flush`
    /// hardens the pending-I/O policy: a container with unexecuted work must
    /// not be handed back while the very flush that would complete that work
    /// is running.
    pub fn ref_scratch(
        &mut self,
        desc: &ScratchDescriptor,
        matching: ScratchMatch,
        during_flush: bool,
    ) -> Result<ResourceId, ContextError<F::Error>> {
        // no_stencil only means something for render targets.
        debug_assert!(desc.render_target || !desc.no_stencil);

        let mut create_desc = *desc;
        if self.cache.reuses_scratch() || desc.render_target {
            let mut lookup = match matching {
                ScratchMatch::Exact => *desc,
                ScratchMatch::Approximate => desc.bucketed(),
            };
            create_desc = lookup;

            loop {
                let key = lookup.to_scratch_key(F::RESOURCE_TYPE);
                let policy = if during_flush {
                    PendingIoPolicy::RequireNone
                } else if !lookup.render_target {
                    // A plain texture is usually filled by an upload next,
                    // which flushes for itself if the container is busy.
                    PendingIoPolicy::PreferNone
                } else {
                    PendingIoPolicy::Any
                };
                if let Some(id) = self.cache.find_and_ref_scratch(&key, policy) {
                    trace!(?key, "reusing scratch container");
                    return Ok(id);
                }
                if matching == ScratchMatch::Exact {
                    break;
                }
                // Approximate miss: relax the no-stencil requirement once,
                // then give up and create.
                if lookup.no_stencil {
                    lookup.no_stencil = false;
                } else {
                    break;
                }
            }
        }

        let resource = self
            .factory
            .create(&create_desc)
            .map_err(ContextError::Backend)?;
        let key = create_desc.to_scratch_key(F::RESOURCE_TYPE);
        Ok(self.cache.add_resource(key, resource))
    }

    /// Install the owner's overbudget hook on the underlying cache.
    pub fn set_overbudget_callback(
        &mut self,
        callback: impl FnMut(&mut ResourceCache<F::Resource>) -> bool + 'static,
    ) {
        self.cache.set_overbudget_callback(callback);
    }

    /// Handle for posting content-invalidation events.
    pub fn invalidation_sender(&self) -> InvalidationSender {
        self.cache.invalidation_sender()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::fmt;
    use std::rc::Rc;

    use super::*;
    use crate::cache::ResourceCacheConfigBuilder;
    use crate::key::KEY_PAYLOAD_BYTES;

    #[derive(Debug)]
    struct CreationFailed;

    impl fmt::Display for CreationFailed {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("backend rejected the descriptor")
        }
    }

    impl std::error::Error for CreationFailed {}

    struct FakeTexture {
        desc: ScratchDescriptor,
    }

    impl Resource for FakeTexture {
        fn gpu_memory_size(&self) -> u64 {
            u64::from(self.desc.width) * u64::from(self.desc.height) * 4
        }
    }

    struct FakeBackend {
        created: Rc<Cell<u32>>,
        fail: bool,
    }

    impl ResourceFactory for FakeBackend {
        type Resource = FakeTexture;
        type Error = CreationFailed;

        const RESOURCE_TYPE: ResourceType = ResourceType::new(3);

        fn create(&mut self, desc: &ScratchDescriptor) -> Result<FakeTexture, CreationFailed> {
            if self.fail {
                return Err(CreationFailed);
            }
            self.created.set(self.created.get() + 1);
            Ok(FakeTexture { desc: *desc })
        }
    }

    fn plain_desc(width: u32, height: u32) -> ScratchDescriptor {
        ScratchDescriptor {
            width,
            height,
            format: 1,
            sample_count: 0,
            render_target: false,
            no_stencil: false,
        }
    }

    fn content_key(n: u64) -> ResourceKey {
        let mut payload = [0u8; KEY_PAYLOAD_BYTES];
        payload[..8].copy_from_slice(&n.to_le_bytes());
        ResourceKey::content(FakeBackend::RESOURCE_TYPE, payload)
    }

    fn build_context() -> (Rc<Cell<u32>>, ResourceContext<FakeBackend>) {
        let created = Rc::new(Cell::new(0));
        let backend = FakeBackend {
            created: created.clone(),
            fail: false,
        };
        let config = ResourceCacheConfigBuilder::default()
            .max_count(100)
            .max_bytes(u64::MAX)
            .build()
            .expect("should build");
        (created, ResourceContext::new(backend, config))
    }

    #[test]
    fn content_lookup_creates_only_on_a_miss() {
        let (created, mut ctx) = build_context();
        let key = content_key(7);
        let desc = plain_desc(64, 64);

        let a = ctx.find_or_create(key, &desc).expect("created");
        let b = ctx.find_or_create(key, &desc).expect("hit");
        assert_eq!(a, b);
        assert_eq!(created.get(), 1);

        ctx.cache_mut().unref_resource(a);
        ctx.cache_mut().unref_resource(b);
    }

    #[test]
    fn exact_match_requires_an_identical_shape() {
        let (created, mut ctx) = build_context();
        let a = ctx
            .ref_scratch(&plain_desc(100, 50), ScratchMatch::Exact, false)
            .expect("created");
        assert_eq!(created.get(), 1);
        assert_eq!(ctx.cache().resource(a).desc.width, 100);
        ctx.cache_mut().unref_resource(a);

        // The idle 100x50 container is no exact match for 99x50.
        let b = ctx
            .ref_scratch(&plain_desc(99, 50), ScratchMatch::Exact, false)
            .expect("created");
        assert_eq!(created.get(), 2);
        ctx.cache_mut().unref_resource(b);
    }

    #[test]
    fn approximate_match_shares_a_bucket_and_never_shrinks() {
        let (created, mut ctx) = build_context();
        let a = ctx
            .ref_scratch(&plain_desc(100, 50), ScratchMatch::Approximate, false)
            .expect("created");
        {
            let texture = ctx.cache().resource(a);
            assert!(texture.desc.width >= 100 && texture.desc.height >= 50);
            assert_eq!((texture.desc.width, texture.desc.height), (128, 64));
        }
        ctx.cache_mut().unref_resource(a);

        // A nearby request lands in the same bucket and reuses the container.
        let b = ctx
            .ref_scratch(&plain_desc(90, 60), ScratchMatch::Approximate, false)
            .expect("hit");
        assert_eq!(created.get(), 1);
        assert_eq!(a, b);
        ctx.cache_mut().unref_resource(b);
    }

    #[test]
    fn approximate_miss_relaxes_the_no_stencil_requirement() {
        let (created, mut ctx) = build_context();
        let mut with_stencil = plain_desc(64, 64);
        with_stencil.render_target = true;
        let existing = ctx
            .ref_scratch(&with_stencil, ScratchMatch::Approximate, false)
            .expect("created");
        ctx.cache_mut().unref_resource(existing);

        let mut stencil_free = with_stencil;
        stencil_free.no_stencil = true;
        let reused = ctx
            .ref_scratch(&stencil_free, ScratchMatch::Approximate, false)
            .expect("hit after relaxing");
        assert_eq!(created.get(), 1);
        assert_eq!(reused, existing);
        ctx.cache_mut().unref_resource(reused);
    }

    #[test]
    fn during_flush_skips_containers_with_pending_work() {
        let (created, mut ctx) = build_context();
        let desc = plain_desc(32, 32);
        let busy = ctx
            .ref_scratch(&desc, ScratchMatch::Approximate, false)
            .expect("created");
        ctx.cache_mut().add_pending_write(busy);
        ctx.cache_mut().unref_resource(busy);

        // Mid-flush the enqueued write has not executed yet; create instead.
        let fresh = ctx
            .ref_scratch(&desc, ScratchMatch::Approximate, true)
            .expect("created");
        assert_eq!(created.get(), 2);
        assert_ne!(fresh, busy);
        ctx.cache_mut().unref_resource(fresh);

        // Outside a flush the bucket is served from cache again.
        let reused = ctx
            .ref_scratch(&desc, ScratchMatch::Approximate, false)
            .expect("hit");
        assert_eq!(created.get(), 2);
        ctx.cache_mut().unref_resource(reused);
        ctx.cache_mut().completed_write(busy);
    }

    #[test]
    fn backend_failure_surfaces_as_a_context_error() {
        let created = Rc::new(Cell::new(0));
        let backend = FakeBackend {
            created,
            fail: true,
        };
        let config = ResourceCacheConfigBuilder::default()
            .max_count(8)
            .max_bytes(1 << 20)
            .build()
            .expect("should build");
        let mut ctx = ResourceContext::new(backend, config);

        let result = ctx.ref_scratch(&plain_desc(8, 8), ScratchMatch::Exact, false);
        assert!(matches!(result, Err(ContextError::Backend(_))));
    }
}
