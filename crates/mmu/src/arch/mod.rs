//! Translation table layouts.
//!
//! The descriptor codecs and engines are plain memory manipulation, so they build on any
//! host wide enough for their addresses: the four-level layout needs 64-bit pointers. Only
//! the [`crate::Cpu`] implementations that issue real maintenance instructions are gated on
//! the target architecture.

pub mod short;
#[cfg(target_pointer_width = "64")]
pub mod x86_64;

// Software emulation of physical memory and of the CPU, used by tests and by hosted
// consumers that enable the software-emulation feature.
#[cfg(any(test, feature = "software-emulation"))]
pub mod software;

/// Size of the smallest translation granule, shared by both layouts.
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;
