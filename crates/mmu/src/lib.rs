#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris MMU
//!
//! The architecture-level half of Polaris virtual memory. The generic VM layer decides
//! *where* regions live and holds the per-address-space lock; this crate turns its requests
//! into translation table updates. It provides:
//!
//! - Address space lifecycle (creation, destruction, activation on a CPU).
//! - Mapping, unmapping and querying of virtual-to-physical translations.
//! - Two table layouts behind one [`ArchMmu`] trait: the two-level ARM short-descriptor
//!   layout with 1 MiB sections and the four-level x86-64 layout with 2 MiB superpages.
//! - Software emulation of physical memory and of the CPU for testing in non-kernel
//!   environments.

extern crate alloc;

mod address;
mod address_space;
pub mod arch;
mod barrier;
mod descriptor;
mod error;
mod flags;
mod page_allocator;
mod table;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, ArchMmu, Translation};
pub use barrier::Cpu;
pub use descriptor::{Descriptor, DescriptorCodec, DescriptorKind, RawDescriptor};
pub use error::{EncodeError, MmuError};
pub use flags::{AspaceFlags, CachePolicy, MmuFlags};
pub use page_allocator::PageAllocator;
pub use table::OwnedTables;

pub use arch::short::ShortDescriptorMmu;
#[cfg(target_pointer_width = "64")]
pub use arch::x86_64::{AddressWidths, FourLevelMmu, Walk};
pub use arch::{PAGE_SHIFT, PAGE_SIZE};
