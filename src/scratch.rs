//! Shape descriptors and matching policy for scratch resources.

use crate::key::{ResourceKey, ResourceType, KEY_PAYLOAD_BYTES};

/// Smallest width/height bucket used by approximate matching.
pub const MIN_APPROX_SIZE: u32 = 16;

/// How strictly a scratch request must match a cached container.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScratchMatch {
    /// Only a container whose shape equals the request exactly.
    Exact,
    /// Round the requested size up to its bucket first, so nearby requests
    /// share containers. The result is at least as large as requested.
    Approximate,
}

/// Whether a scratch candidate with outstanding GPU work may be handed back.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PendingIoPolicy {
    /// Any candidate will do.
    Any,
    /// Prefer a candidate with no pending I/O, but fall back to a busy one.
    /// A subsequent write will flush for itself if it has to.
    PreferNone,
    /// Only candidates with no pending I/O. Used mid-flush: the work that
    /// would clear the counters is the very flush currently running.
    RequireNone,
}

/// The shape of a scratch container, independent of its contents.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScratchDescriptor {
    pub width: u32,
    pub height: u32,
    /// Opaque backend pixel/attachment format id.
    pub format: u32,
    pub sample_count: u16,
    pub render_target: bool,
    /// The container is guaranteed never to need a stencil attachment.
    /// Only meaningful for render targets.
    pub no_stencil: bool,
}

impl ScratchDescriptor {
    /// The descriptor actually used for approximate matching: width and
    /// height rounded up to the next power of two with a floor of
    /// [MIN_APPROX_SIZE].
    ///
    /// The bucketing function is a fragmentation/hit-rate tradeoff, not a
    /// contract; nothing outside this module may rely on the exact rounding.
    pub fn bucketed(mut self) -> ScratchDescriptor {
        self.width = bucket_dimension(self.width);
        self.height = bucket_dimension(self.height);
        self
    }

    /// Pack the shape into a scratch key for `resource_type`.
    pub fn to_scratch_key(&self, resource_type: ResourceType) -> ResourceKey {
        let mut payload = [0u8; KEY_PAYLOAD_BYTES];
        payload[0..4].copy_from_slice(&self.width.to_le_bytes());
        payload[4..8].copy_from_slice(&self.height.to_le_bytes());
        payload[8..12].copy_from_slice(&self.format.to_le_bytes());
        payload[12..14].copy_from_slice(&self.sample_count.to_le_bytes());
        payload[14] = (self.render_target as u8) | ((self.no_stencil as u8) << 1);
        ResourceKey::scratch(resource_type, payload)
    }
}

fn bucket_dimension(n: u32) -> u32 {
    n.next_power_of_two().max(MIN_APPROX_SIZE)
}
