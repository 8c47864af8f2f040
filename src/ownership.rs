//! Reference bookkeeping for cached resources.
//!
//! A resource carries three independent counters: ordinary strong references,
//! pending reads, and pending writes. The pending counters track GPU work that
//! has been *enqueued* against the resource but not yet *executed*, so a call
//! site may drop its strong reference as soon as it has issued a draw without
//! the resource becoming eligible for eviction underneath the queued work.
//!
//! This is not thread synchronization: completions are delivered by the same
//! thread that owns the cache, and the counters are plain integers.

/// What a release operation did to the resource's lifecycle.
///
/// Acquire operations never change lifecycle state, so only `unref` and the
/// two `completed_*` operations report a transition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RefTransition {
    /// The resource is still held somewhere; nothing happened.
    None,
    /// Only the cache's own reference survives and no I/O is pending. The
    /// resource is now eligible for eviction.
    Purgeable,
    /// Every counter reached zero. This is the one and only destruction
    /// trigger; the holder of the counters must tear the resource down now.
    Destroy,
}

/// Strong-reference and pending-I/O counters for one resource.
///
/// A new resource starts with a single strong reference, representing the
/// hold of whoever created it.
#[derive(Debug)]
pub struct RefCounts {
    ref_count: i32,
    pending_reads: i32,
    pending_writes: i32,
}

impl RefCounts {
    pub fn new() -> RefCounts {
        RefCounts {
            ref_count: 1,
            pending_reads: 0,
            pending_writes: 0,
        }
    }

    /// Take an additional strong reference.
    pub fn add_ref(&mut self) {
        self.validate();
        self.ref_count += 1;
    }

    /// Release a strong reference.
    pub fn unref(&mut self) -> RefTransition {
        self.validate();
        assert!(self.ref_count > 0, "unref without a matching ref");
        self.ref_count -= 1;
        self.released()
    }

    /// Record that a read of the resource has been enqueued on the GPU.
    pub fn add_pending_read(&mut self) {
        self.validate();
        self.pending_reads += 1;
    }

    /// The enqueued read has executed.
    pub fn completed_read(&mut self) -> RefTransition {
        self.validate();
        assert!(self.pending_reads > 0, "completed a read that was never pending");
        self.pending_reads -= 1;
        self.released()
    }

    /// Record that a write to the resource has been enqueued on the GPU.
    pub fn add_pending_write(&mut self) {
        self.validate();
        self.pending_writes += 1;
    }

    /// The enqueued write has executed.
    pub fn completed_write(&mut self) -> RefTransition {
        self.validate();
        assert!(self.pending_writes > 0, "completed a write that was never pending");
        self.pending_writes -= 1;
        self.released()
    }

    /// Eligible for eviction: the cache holds the sole reference and no
    /// enqueued GPU work remains.
    pub fn is_purgeable(&self) -> bool {
        self.reffed_only_by_cache() && !self.has_pending_io()
    }

    pub fn reffed_only_by_cache(&self) -> bool {
        self.ref_count == 1
    }

    pub fn has_pending_io(&self) -> bool {
        self.pending_reads > 0 || self.pending_writes > 0
    }

    /// Lifecycle step shared by every release operation.
    fn released(&self) -> RefTransition {
        if self.pending_reads == 0 && self.pending_writes == 0 {
            if self.ref_count == 0 {
                return RefTransition::Destroy;
            }
            if self.ref_count == 1 {
                return RefTransition::Purgeable;
            }
        }
        RefTransition::None
    }

    /// A live resource always has at least one counter above zero; all-zero
    /// is only reachable as the final state reported by [RefTransition::Destroy].
    pub fn validate(&self) {
        debug_assert!(self.ref_count >= 0);
        debug_assert!(self.pending_reads >= 0);
        debug_assert!(self.pending_writes >= 0);
        debug_assert!(self.ref_count + self.pending_reads + self.pending_writes > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[derive(Copy, Clone, Debug)]
    enum Op {
        Ref,
        Unref,
        AddRead,
        DoneRead,
        AddWrite,
        DoneWrite,
    }

    fn op_strat() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Ref),
            Just(Op::Unref),
            Just(Op::AddRead),
            Just(Op::DoneRead),
            Just(Op::AddWrite),
            Just(Op::DoneWrite),
        ]
    }

    proptest! {
        // Purgeability must track the counters exactly, and the all-zero
        // state must be reported as a destruction exactly once.
        #[test]
        fn purgeable_iff_sole_ref_and_no_pending_io(
            ops in prop::collection::vec(op_strat(), 0..400)
        ) {
            let mut counts = RefCounts::new();
            let (mut refs, mut reads, mut writes) = (1i32, 0i32, 0i32);

            for op in ops {
                let transition = match op {
                    // Reject operations that would drive a counter negative.
                    Op::Unref if refs == 0 => continue,
                    Op::DoneRead if reads == 0 => continue,
                    Op::DoneWrite if writes == 0 => continue,

                    Op::Ref => {
                        counts.add_ref();
                        refs += 1;
                        RefTransition::None
                    }
                    Op::AddRead => {
                        counts.add_pending_read();
                        reads += 1;
                        RefTransition::None
                    }
                    Op::AddWrite => {
                        counts.add_pending_write();
                        writes += 1;
                        RefTransition::None
                    }
                    Op::Unref => {
                        refs -= 1;
                        counts.unref()
                    }
                    Op::DoneRead => {
                        reads -= 1;
                        counts.completed_read()
                    }
                    Op::DoneWrite => {
                        writes -= 1;
                        counts.completed_write()
                    }
                };

                if refs == 0 && reads == 0 && writes == 0 {
                    prop_assert_eq!(transition, RefTransition::Destroy);
                    break;
                }

                prop_assert_ne!(transition, RefTransition::Destroy);
                prop_assert_eq!(
                    counts.is_purgeable(),
                    refs == 1 && reads == 0 && writes == 0
                );
            }
        }
    }

    #[test]
    fn pending_io_defers_destruction() {
        let mut counts = RefCounts::new();
        counts.add_pending_read();

        // The creator is done with it, but the GPU has not executed the read.
        assert_eq!(counts.unref(), RefTransition::None);
        assert!(!counts.is_purgeable());

        assert_eq!(counts.completed_read(), RefTransition::Destroy);
    }

    #[test]
    fn dropping_to_the_cache_ref_reports_purgeable() {
        let mut counts = RefCounts::new();
        counts.add_ref();
        assert!(!counts.is_purgeable());

        assert_eq!(counts.unref(), RefTransition::Purgeable);
        assert!(counts.is_purgeable());
        assert!(counts.reffed_only_by_cache());
    }

    #[test]
    fn pending_io_blocks_purgeability_but_not_the_sole_ref_check() {
        let mut counts = RefCounts::new();
        counts.add_pending_write();
        assert!(counts.reffed_only_by_cache());
        assert!(!counts.is_purgeable());

        assert_eq!(counts.completed_write(), RefTransition::Purgeable);
        assert!(counts.is_purgeable());
    }
}
