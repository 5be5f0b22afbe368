//! Software emulation for testing and hosted development.
//!
//! - [`EmulatedMemory`] stands in for physical RAM.
//! - [`SoftwarePageAllocator`] hands out its pages with an optional budget.
//! - [`RecordingCpu`] records every barrier, invalidation and translation-base change into
//!   an [`EventLog`] instead of executing it.
//!
//! The page allocator writes its frees into the same log, which lets tests check that a
//! table page is only freed after its parent descriptor has been cleared and invalidated.

mod allocator;
mod cpu;
mod memory;

pub use allocator::SoftwarePageAllocator;
pub use cpu::{Event, EventLog, RecordingCpu};
pub use memory::EmulatedMemory;

use crate::AddressTranslator;

/// Size of the emulated memory installed by [`setup`].
pub const EMULATED_MEMORY_SIZE: usize = 16 * 1024 * 1024;

/// Installs an emulated address translator for the current thread, unless one is already
/// set.
pub fn setup() {
    if AddressTranslator::try_current().is_none() {
        AddressTranslator::set_current(AddressTranslator::emulated(EMULATED_MEMORY_SIZE));
    }
}
