//! ARMv7 short-descriptor layout.
//!
//! - Level 1 (the root) has one 32-bit slot per 1 MiB of address space. A slot is invalid,
//!   a 1 MiB section, or a link to a level 2 table.
//! - Level 2 tables have 256 slots of 4 KiB pages and are 1 KiB each, so four of them share
//!   one physical page. The four consecutive level 1 slots of a group always draw their
//!   tables from the same page.
//!
//! The kernel root covers 4 GiB and is handed to the engine at construction. User roots
//! cover the low 1 GiB (translation split N = 2) and fit in a single page.

mod descriptor;
mod engine;

#[cfg(target_arch = "arm")]
mod cpu;

pub use descriptor::ShortDescriptor;
pub use engine::ShortDescriptorMmu;

#[cfg(target_arch = "arm")]
pub use cpu::{ArmCpu, early_init};

use crate::arch::{PAGE_SHIFT, PAGE_SIZE};

/// Level of root (first-level) descriptors.
pub const L1: usize = 1;
/// Level of second-level descriptors.
pub const L2: usize = 2;

pub const SECTION_SHIFT: usize = 20;
pub const SECTION_SIZE: usize = 1 << SECTION_SHIFT;
pub const PAGES_PER_SECTION: usize = SECTION_SIZE / PAGE_SIZE;

/// Slots in the kernel root.
pub const KERNEL_ROOT_ENTRIES: usize = 4096;
/// Size and alignment of the kernel root.
pub const KERNEL_ROOT_SIZE: usize = KERNEL_ROOT_ENTRIES * size_of::<u32>();

/// Translation split between the user and kernel roots.
pub const TTBCR_N: usize = 2;
/// Slots in a user root.
pub const USER_ROOT_ENTRIES: usize = KERNEL_ROOT_ENTRIES >> TTBCR_N;
/// End of the range translated by user roots.
pub const USER_ASPACE_LIMIT: usize = USER_ROOT_ENTRIES << SECTION_SHIFT;

pub const L2_ENTRIES: usize = 256;
pub const L2_TABLE_SIZE: usize = L2_ENTRIES * size_of::<u32>();
pub const L2_TABLES_PER_PAGE: usize = PAGE_SIZE / L2_TABLE_SIZE;

/// Top of the 32-bit address range.
pub const ADDRESS_LIMIT: u64 = 1 << 32;

/// Index of the root slot translating `address`.
#[inline]
pub const fn l1_index(address: usize) -> usize {
    address >> SECTION_SHIFT
}

/// Index of the second-level slot translating `address`.
#[inline]
pub const fn l2_index(address: usize) -> usize {
    (address >> PAGE_SHIFT) & (L2_ENTRIES - 1)
}

/// First root slot of the group sharing a table page with `index`.
#[inline]
pub const fn l1_group(index: usize) -> usize {
    index & !(L2_TABLES_PER_PAGE - 1)
}
