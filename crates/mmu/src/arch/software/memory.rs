use alloc::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::PAGE_SIZE;

/// Emulated physical memory.
///
/// Physical addresses are offsets into a page-aligned host buffer, so tables placed here
/// have the same alignment they would have in RAM. Page zero is never handed out, keeping
/// a zero frame distinguishable from a real one.
pub struct EmulatedMemory {
    base: NonNull<u8>,
    layout: Layout,
    /// Next free offset of the bump region.
    next_alloc: AtomicUsize,
    /// Pages returned through [`EmulatedMemory::free_page`].
    free_pages: spin::Mutex<Vec<usize>>,
}

impl EmulatedMemory {
    /// Creates a zero-filled region of `size` bytes, rounded up to whole pages.
    pub fn new(size: usize) -> Self {
        let size = size.max(2 * PAGE_SIZE).next_multiple_of(PAGE_SIZE);
        let layout = match Layout::from_size_align(size, PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => panic!("emulated memory of {size:#x} bytes is not representable"),
        };

        // SAFETY: the layout has a non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(base) else {
            handle_alloc_error(layout);
        };

        Self {
            base,
            layout,
            next_alloc: AtomicUsize::new(PAGE_SIZE),
            free_pages: spin::Mutex::new(Vec::new()),
        }
    }

    /// Carves a block out of the bump region.
    ///
    /// Returns the physical address of the block, or None if there's not enough space.
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        loop {
            let current = self.next_alloc.load(Ordering::Relaxed);
            let aligned = current.checked_next_multiple_of(align)?;
            let end = aligned.checked_add(size)?;
            if end > self.size() {
                return None;
            }

            if self
                .next_alloc
                .compare_exchange(current, end, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some(aligned);
            }
        }
    }

    /// Returns a zeroed page, preferring previously freed ones.
    pub fn allocate_page(&self) -> Option<usize> {
        let recycled = self.free_pages.lock().pop();
        match recycled {
            Some(page) => {
                // SAFETY: `page` was handed out by this region and is page sized.
                unsafe { self.translate(page).write_bytes(0, PAGE_SIZE) };
                Some(page)
            }
            None => self.allocate(PAGE_SIZE, PAGE_SIZE),
        }
    }

    /// Returns a page to the region.
    ///
    /// # Panics
    ///
    /// Panics if the page is misaligned, outside the region or already free.
    pub fn free_page(&self, page: usize) {
        assert!(
            page % PAGE_SIZE == 0 && page != 0 && page < self.size(),
            "freeing invalid emulated page {page:#x}"
        );
        let mut free_pages = self.free_pages.lock();
        assert!(
            !free_pages.contains(&page),
            "double free of emulated page {page:#x}"
        );
        free_pages.push(page);
    }

    /// Translates a physical address to a pointer into the buffer.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size(), "physical address {phys:#x} out of bounds");
        // SAFETY: bounds checked above.
        unsafe { self.base.as_ptr().add(phys) }
    }

    /// Translates a pointer into the buffer back to a physical address.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let offset = (ptr as usize).wrapping_sub(self.base.as_ptr() as usize);
        assert!(offset < self.size(), "pointer not within emulated memory");
        offset
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}
