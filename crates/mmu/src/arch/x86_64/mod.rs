//! x86-64 four-level layout.
//!
//! Levels are numbered from the leaf: level 3 is the PML4, level 2 the page directory
//! pointer table, level 1 the page directory and level 0 the page table. Every table has
//! 512 64-bit entries and fills exactly one page. Level 1 may hold 2 MiB superpages.
//!
//! The upper half of the PML4 (entries 256..512) belongs to the kernel and is copied into
//! every user root, so kernel mappings stay visible after a context switch.

mod descriptor;
mod engine;

#[cfg(target_arch = "x86_64")]
mod cpu;

pub use descriptor::FourLevelDescriptor;
pub use engine::{FourLevelMmu, Walk};

#[cfg(target_arch = "x86_64")]
pub use cpu::{X86Cpu, early_init};

use crate::arch::{PAGE_SHIFT, PAGE_SIZE};

/// Number of page table levels (4-level paging).
pub const PAGE_TABLE_LEVELS: usize = 4;

/// Level of the root table.
pub const TOP_LEVEL: usize = PAGE_TABLE_LEVELS - 1;

pub const ENTRY_COUNT: usize = 512;

/// Level holding 2 MiB superpages.
pub const LARGE_PAGE_LEVEL: usize = 1;
pub const LARGE_PAGE_SIZE: usize = level_span(LARGE_PAGE_LEVEL);
pub const PAGES_PER_LARGE_PAGE: usize = LARGE_PAGE_SIZE / PAGE_SIZE;

/// First PML4 entry of the kernel half.
pub const KERNEL_HALF_START: usize = ENTRY_COUNT / 2;

/// End of the lower canonical half, where user address spaces live.
pub const USER_ASPACE_LIMIT: usize = 0x0000_8000_0000_0000;

/// Start of the upper canonical half.
pub const KERNEL_ASPACE_BASE: usize = 0xFFFF_8000_0000_0000;

/// Returns the page table index for a given virtual address at the specified level.
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range for x86_64 page table levels");
    (address >> (PAGE_SHIFT + level * 9)) & (ENTRY_COUNT - 1)
}

/// Bytes translated by one entry at `level`.
#[inline]
pub const fn level_span(level: usize) -> usize {
    PAGE_SIZE << (level * 9)
}

/// Virtual and physical address widths of the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressWidths {
    pub virtual_bits: u8,
    pub physical_bits: u8,
}

impl Default for AddressWidths {
    fn default() -> Self {
        Self {
            virtual_bits: 48,
            physical_bits: 52,
        }
    }
}

impl AddressWidths {
    /// Returns true if bits above `virtual_bits` are copies of the top implemented bit.
    #[inline]
    pub const fn is_canonical(self, addr: usize) -> bool {
        let shift = usize::BITS - self.virtual_bits as u32;
        ((addr << shift) as isize >> shift) as usize == addr
    }

    /// One past the highest physical address the CPU can generate.
    #[inline]
    pub const fn physical_limit(self) -> u64 {
        1 << self.physical_bits
    }

    /// Reads the widths from CPUID leaf `0x8000_0008`, falling back to the defaults when
    /// the leaf is missing. Four-level paging never uses more than 48 virtual bits.
    #[cfg(target_arch = "x86_64")]
    pub fn detect() -> Self {
        use core::arch::x86_64::__cpuid;

        // SAFETY: CPUID is available on every x86-64 CPU.
        let max_extended = unsafe { __cpuid(0x8000_0000) }.eax;
        if max_extended < 0x8000_0008 {
            return Self::default();
        }

        // SAFETY: leaf presence checked above.
        let sizes = unsafe { __cpuid(0x8000_0008) }.eax;
        Self {
            physical_bits: (sizes & 0xFF) as u8,
            virtual_bits: (((sizes >> 8) & 0xFF) as u8).min(48),
        }
    }
}
