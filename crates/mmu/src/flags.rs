//! Portable mapping and address-space attributes.
//!
//! [`MmuFlags`] is the vocabulary the VM layer speaks. Each engine translates it into its own
//! descriptor bits and back; a flag set that cannot be expressed by an engine is rejected
//! rather than silently weakened.

use bitflags::bitflags;

bitflags! {
    /// Attributes of a single mapping.
    ///
    /// The two cache bits form a field rather than independent flags: clear means normal
    /// cached memory, and only one of them may be set. See [`MmuFlags::cache_policy`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MmuFlags: u32 {
        /// Strongly ordered, uncached memory.
        const UNCACHED = 1 << 0;
        /// Device memory.
        const UNCACHED_DEVICE = 1 << 1;
        /// Accessible from user mode.
        const PERM_USER = 1 << 2;
        /// Read-only.
        const PERM_RO = 1 << 3;
        /// Instruction fetches fault.
        const PERM_NO_EXECUTE = 1 << 4;
        /// Non-secure memory (TrustZone).
        const NS = 1 << 5;
    }
}

impl MmuFlags {
    /// Both cache bits.
    pub const CACHE_MASK: Self = Self::UNCACHED.union(Self::UNCACHED_DEVICE);

    /// Returns the memory type encoded in the cache field.
    ///
    /// Returns None when both cache bits are set, which names no memory type.
    pub fn cache_policy(self) -> Option<CachePolicy> {
        match (
            self.contains(Self::UNCACHED),
            self.contains(Self::UNCACHED_DEVICE),
        ) {
            (false, false) => Some(CachePolicy::Cached),
            (true, false) => Some(CachePolicy::Uncached),
            (false, true) => Some(CachePolicy::Device),
            (true, true) => None,
        }
    }

    /// Returns a copy with the cache field replaced by `policy`.
    pub fn with_cache_policy(self, policy: CachePolicy) -> Self {
        let rest = self.difference(Self::CACHE_MASK);
        match policy {
            CachePolicy::Cached => rest,
            CachePolicy::Uncached => rest | Self::UNCACHED,
            CachePolicy::Device => rest | Self::UNCACHED_DEVICE,
        }
    }
}

/// Memory type of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CachePolicy {
    /// Normal write-back cached memory.
    Cached,
    /// Strongly ordered memory.
    Uncached,
    /// Device memory.
    Device,
}

bitflags! {
    /// Attributes of an address space.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AspaceFlags: u32 {
        /// The kernel address space. It uses the statically allocated root table and can
        /// never be destroyed.
        const KERNEL = 1 << 0;
    }
}
