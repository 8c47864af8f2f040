//! Keys identifying cached resources.
//!
//! A key identifies a resource either by the semantic content it holds (a
//! content key: "the decoded pixels of image X at scale Y") or by its shape
//! alone (a scratch key: "any 256x256 render target with this format"). The
//! two share one key type, distinguished by a discriminator bit, because they
//! live in the same index; their lookup semantics differ, and the cache
//! asserts that each lookup path is handed the matching kind.

/// Tag separating resource kinds (textures, stencil buffers, ...).
///
/// Tags are small integers assigned by the embedding domain, one per concrete
/// resource type, fixed at compile time.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceType(u8);

impl ResourceType {
    pub const fn new(tag: u8) -> ResourceType {
        ResourceType(tag)
    }

    pub const fn tag(self) -> u8 {
        self.0
    }
}

/// Number of domain payload bytes carried by a key.
pub const KEY_PAYLOAD_BYTES: usize = 16;

/// Identity of a cached resource.
///
/// Content keys are unique: at most one resident resource per key. Scratch
/// keys are not: several containers of the same shape may be resident at
/// once, and any of them satisfies a lookup.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    resource_type: ResourceType,
    scratch: bool,
    payload: [u8; KEY_PAYLOAD_BYTES],
}

impl ResourceKey {
    /// A key identifying a resource by the data it represents.
    pub fn content(resource_type: ResourceType, payload: [u8; KEY_PAYLOAD_BYTES]) -> ResourceKey {
        ResourceKey {
            resource_type,
            scratch: false,
            payload,
        }
    }

    /// A key identifying a resource by shape only.
    pub fn scratch(resource_type: ResourceType, payload: [u8; KEY_PAYLOAD_BYTES]) -> ResourceKey {
        ResourceKey {
            resource_type,
            scratch: true,
            payload,
        }
    }

    pub fn is_scratch(&self) -> bool {
        self.scratch
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn payload(&self) -> &[u8; KEY_PAYLOAD_BYTES] {
        &self.payload
    }
}
