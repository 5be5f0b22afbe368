//! Table memory: reading and writing slots, and accounting for the pages tables live in.

use alloc::vec::Vec;
use core::marker::PhantomData;
use core::ptr;

use crate::{
    AddressSpace, AddressTranslator, Descriptor, DescriptorKind, MmuError, PageAllocator,
    PhysicalAddress, RawDescriptor, arch::PAGE_SIZE,
};

/// A window onto one translation table in physical memory.
///
/// Slots are accessed with volatile reads and writes because the hardware walker reads the
/// same memory concurrently.
pub(crate) struct TableView<R: RawDescriptor> {
    base: *mut R,
    len: usize,
    phys: PhysicalAddress,
    _marker: PhantomData<R>,
}

impl<R: RawDescriptor> TableView<R> {
    /// Creates a view of the `len`-entry table at `phys`.
    ///
    /// # Safety
    ///
    /// `phys` must hold a live table of at least `len` entries that stays allocated for as
    /// long as the view is used.
    pub(crate) unsafe fn new(phys: PhysicalAddress, len: usize) -> Self {
        let base = AddressTranslator::current().phys_to_ptr::<R>(phys.as_usize());
        debug_assert!(base.is_aligned(), "table {phys} is misaligned");
        Self {
            base,
            len,
            phys,
            _marker: PhantomData,
        }
    }

    /// Reads the raw slot at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub(crate) fn read(&self, index: usize) -> R {
        assert!(index < self.len, "slot {index} outside table of {}", self.len);
        // SAFETY: the constructor guarantees `len` live entries at `base`.
        unsafe { ptr::read_volatile(self.base.add(index)) }
    }

    /// Writes the raw slot at `index`. Callers outside [`crate::barrier`] only use this
    /// for tables that are not yet reachable by the walker.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub(crate) fn write(&self, index: usize, raw: R) {
        assert!(index < self.len, "slot {index} outside table of {}", self.len);
        // SAFETY: the constructor guarantees `len` live entries at `base`.
        unsafe { ptr::write_volatile(self.base.add(index), raw) }
    }

    /// Physical address of the slot at `index`.
    #[inline]
    pub(crate) fn slot_address(&self, index: usize) -> PhysicalAddress {
        self.phys + index * size_of::<R>()
    }

    /// Iterates over every raw slot.
    pub(crate) fn iter(&self) -> impl Iterator<Item = R> + '_ {
        (0..self.len).map(|index| self.read(index))
    }
}

/// Pages an address space has taken from the page allocator to hold its tables.
///
/// User roots are not included; the root is owned by the [`AddressSpace`] itself.
#[derive(Debug, Default)]
pub struct OwnedTables {
    pages: Vec<PhysicalAddress>,
}

impl OwnedTables {
    pub const fn new() -> Self {
        Self { pages: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, page: PhysicalAddress) -> bool {
        self.pages.contains(&page)
    }

    pub fn iter(&self) -> impl Iterator<Item = PhysicalAddress> + '_ {
        self.pages.iter().copied()
    }

    pub(crate) fn push(&mut self, page: PhysicalAddress) {
        self.pages.push(page);
    }

    pub(crate) fn remove(&mut self, page: PhysicalAddress) -> bool {
        match self.pages.iter().position(|&owned| owned == page) {
            Some(index) => {
                self.pages.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn take_all(&mut self) -> Vec<PhysicalAddress> {
        core::mem::take(&mut self.pages)
    }
}

/// Takes a zeroed page for a new table and records it against `aspace`.
pub(crate) fn acquire_table<P: PageAllocator>(
    pages: &mut P,
    aspace: &mut AddressSpace,
) -> Result<PhysicalAddress, MmuError> {
    let Some(page) = pages.alloc_zeroed_page() else {
        log::error!(
            "out of memory allocating translation table for aspace {}",
            aspace.root()
        );
        return Err(MmuError::OutOfMemory);
    };
    debug_assert!(page.is_aligned(PAGE_SIZE), "table page {page} is misaligned");

    aspace.tables_mut().push(page);
    log::debug!("aspace {}: acquired table page {}", aspace.root(), page);
    Ok(page)
}

/// Frees `table_page` unless one of `parents` still links a table inside it.
///
/// The caller must already have cleared and invalidated the descriptor that pointed at the
/// emptied table. `parents` are the controlling slots that may still reference the page;
/// on the short-descriptor layout that is the group of first-level slots sharing one page.
///
/// Returns true if the page went back to the allocator.
///
/// # Panics
///
/// Panics if `table_page` is not owned by `aspace`.
pub(crate) fn release_if_unreferenced<P, I>(
    pages: &mut P,
    aspace: &mut AddressSpace,
    table_page: PhysicalAddress,
    parents: I,
) -> bool
where
    P: PageAllocator,
    I: IntoIterator<Item = Descriptor>,
{
    let referenced = parents.into_iter().any(|descriptor| {
        descriptor.kind == DescriptorKind::Table
            && descriptor.frame.align_down(PAGE_SIZE) == table_page
    });
    if referenced {
        return false;
    }

    if !aspace.tables_mut().remove(table_page) {
        panic!(
            "table page {} is not owned by aspace {}",
            table_page,
            aspace.root()
        );
    }
    pages.free_page(table_page);
    log::debug!("aspace {}: released table page {}", aspace.root(), table_page);
    true
}
