use crate::PhysicalAddress;

/// Source of physical pages for translation tables.
///
/// The engines never hold a page allocator lock across a descriptor write; every call here
/// happens before a table is linked or after it has been unlinked and invalidated.
pub trait PageAllocator {
    /// Returns a zero-filled, page-aligned 4 KiB page, or None when memory is exhausted.
    fn alloc_zeroed_page(&mut self) -> Option<PhysicalAddress>;

    /// Returns a page previously handed out by [`PageAllocator::alloc_zeroed_page`].
    fn free_page(&mut self, page: PhysicalAddress);
}
