use crate::address_space::{validate_geometry, validate_range};
use crate::arch::PAGE_SIZE;
use crate::arch::x86_64::{
    AddressWidths, ENTRY_COUNT, FourLevelDescriptor, KERNEL_HALF_START, LARGE_PAGE_LEVEL,
    LARGE_PAGE_SIZE, PAGES_PER_LARGE_PAGE, TOP_LEVEL, USER_ASPACE_LIMIT, level_span, page_index,
};
use crate::table::{self, TableView};
use crate::{
    AddressSpace, ArchMmu, AspaceFlags, Cpu, DescriptorCodec, DescriptorKind, MmuError, MmuFlags,
    PageAllocator, PhysicalAddress, Translation, VirtualAddress, barrier,
};

/// Outcome of walking the tables for one virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    Mapped(Translation),
    /// The walk hit an invalid entry at `level`.
    Unmapped { level: usize },
}

/// Progress of an unmap step: pages walked past and pages that were actually mapped.
struct Step {
    advanced: usize,
    unmapped: usize,
}

/// Mapping engine for the x86-64 four-level layout.
///
/// Runs that are 2 MiB aligned in both address spaces and cover a whole superpage are
/// mapped at level 1; everything else goes down to page tables.
pub struct FourLevelMmu<P, C> {
    pages: P,
    cpu: C,
    kernel_root: PhysicalAddress,
    widths: AddressWidths,
    active: Option<PhysicalAddress>,
}

impl<P: PageAllocator, C: Cpu> FourLevelMmu<P, C> {
    /// Creates an engine around the kernel PML4.
    ///
    /// # Panics
    ///
    /// Panics if `kernel_root` is not page aligned.
    pub fn new(pages: P, cpu: C, kernel_root: PhysicalAddress, widths: AddressWidths) -> Self {
        assert!(
            kernel_root.is_aligned(PAGE_SIZE),
            "kernel root {kernel_root} must be page aligned"
        );
        log::debug!(
            "four-level engine: kernel root {} {} virtual bits {} physical bits",
            kernel_root,
            widths.virtual_bits,
            widths.physical_bits
        );
        Self {
            pages,
            cpu,
            kernel_root,
            widths,
            active: None,
        }
    }

    pub fn pages(&self) -> &P {
        &self.pages
    }

    pub fn pages_mut(&mut self) -> &mut P {
        &mut self.pages
    }

    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    pub fn kernel_root(&self) -> PhysicalAddress {
        self.kernel_root
    }

    pub fn widths(&self) -> AddressWidths {
        self.widths
    }

    /// Root of the user address space currently active on this CPU.
    pub fn active(&self) -> Option<PhysicalAddress> {
        self.active
    }

    fn table(frame: PhysicalAddress) -> TableView<u64> {
        // SAFETY: every table of this layout is one page of 512 entries, and `frame` is
        // either a root or comes from a table entry of a live address space.
        unsafe { TableView::new(frame, ENTRY_COUNT) }
    }

    /// Walks the tables of `aspace` for `vaddr`. No range checks are made.
    ///
    /// # Panics
    ///
    /// Panics on 1 GiB pages and other entries this layout never produces.
    pub fn walk(&self, aspace: &AddressSpace, vaddr: VirtualAddress) -> Walk {
        let mut frame = aspace.root();
        let mut level = TOP_LEVEL;
        loop {
            let raw = Self::table(frame).read(page_index(vaddr.as_usize(), level));
            let descriptor = FourLevelDescriptor::decode(level, raw);
            match descriptor.kind {
                DescriptorKind::Invalid => return Walk::Unmapped { level },
                DescriptorKind::Table => {
                    frame = descriptor.frame;
                    level -= 1;
                }
                DescriptorKind::Block | DescriptorKind::Page => {
                    return Walk::Mapped(Translation {
                        paddr: descriptor.frame + vaddr.offset_in(level_span(level)),
                        flags: descriptor.flags,
                        level,
                    });
                }
                DescriptorKind::Unsupported => {
                    panic!("walk {vaddr}: unsupported level {level} entry {raw:#x}")
                }
            }
        }
    }

    /// Returns the table below entry `page_index(va, level)` of `table`, linking a new one
    /// if the entry is empty. A table reached by a user mapping is made user accessible.
    fn next_table(
        &mut self,
        aspace: &mut AddressSpace,
        table: &TableView<u64>,
        level: usize,
        va: VirtualAddress,
        table_flags: MmuFlags,
    ) -> Result<TableView<u64>, MmuError> {
        let index = page_index(va.as_usize(), level);
        let raw = table.read(index);
        let current = FourLevelDescriptor::decode(level, raw);
        let span_base = va.align_down(level_span(level));

        match current.kind {
            DescriptorKind::Table => {
                if !current.flags.contains(table_flags) {
                    let widened = FourLevelDescriptor::encode(
                        level,
                        DescriptorKind::Table,
                        current.frame,
                        current.flags | table_flags,
                    )?;
                    barrier::revoke(&self.cpu, table, index, widened, span_base);
                }
                Ok(Self::table(current.frame))
            }
            DescriptorKind::Invalid => {
                let page = table::acquire_table(&mut self.pages, aspace)?;
                let link =
                    FourLevelDescriptor::encode(level, DescriptorKind::Table, page, table_flags)?;
                barrier::link_table(&self.cpu, table, index, link, span_base);
                log::trace!("level {} entry {:#x} -> table {}", level, index, page);
                Ok(Self::table(page))
            }
            _ => panic!("map {va}: unsupported level {level} entry {raw:#x}"),
        }
    }

    /// Maps as much of the request as fits under the level 1 entry translating `va`.
    fn map_one(
        &mut self,
        aspace: &mut AddressSpace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        remaining: usize,
        flags: MmuFlags,
    ) -> Result<usize, MmuError> {
        let table_flags = flags & MmuFlags::PERM_USER;
        let mut table = Self::table(aspace.root());
        for level in (LARGE_PAGE_LEVEL + 1..=TOP_LEVEL).rev() {
            table = self.next_table(aspace, &table, level, va, table_flags)?;
        }

        let index = page_index(va.as_usize(), LARGE_PAGE_LEVEL);
        let raw = table.read(index);
        let current = FourLevelDescriptor::decode(LARGE_PAGE_LEVEL, raw);
        let large_eligible = va.is_aligned(LARGE_PAGE_SIZE)
            && pa.is_aligned(LARGE_PAGE_SIZE)
            && remaining >= PAGES_PER_LARGE_PAGE;

        match current.kind {
            DescriptorKind::Invalid | DescriptorKind::Block if large_eligible => {
                let large =
                    FourLevelDescriptor::encode_leaf(LARGE_PAGE_LEVEL, pa, flags, aspace.is_kernel())?;
                if current.is_valid() {
                    barrier::revoke(&self.cpu, &table, index, large, va);
                } else {
                    barrier::install(&self.cpu, &table, index, large, va);
                }
                return Ok(PAGES_PER_LARGE_PAGE);
            }
            DescriptorKind::Block => panic!(
                "map {va}: superpage at {} would need splitting, which is not supported",
                current.frame
            ),
            DescriptorKind::Invalid | DescriptorKind::Table => {}
            DescriptorKind::Page | DescriptorKind::Unsupported => {
                panic!("map {va}: unsupported level 1 entry {raw:#x}")
            }
        }

        let page_table = self.next_table(aspace, &table, LARGE_PAGE_LEVEL, va, table_flags)?;
        let first = page_index(va.as_usize(), 0);
        let count = remaining.min(ENTRY_COUNT - first);

        for offset in 0..count {
            let slot = first + offset;
            let page_va = va + offset * PAGE_SIZE;
            let page = FourLevelDescriptor::encode_leaf(
                0,
                pa + offset * PAGE_SIZE,
                flags,
                aspace.is_kernel(),
            )?;

            let existing = page_table.read(slot);
            match FourLevelDescriptor::decode(0, existing).kind {
                DescriptorKind::Invalid => {
                    barrier::install(&self.cpu, &page_table, slot, page, page_va)
                }
                DescriptorKind::Page => barrier::revoke(&self.cpu, &page_table, slot, page, page_va),
                _ => panic!("map {page_va}: unsupported level 0 entry {existing:#x}"),
            }
        }
        Ok(count)
    }

    fn unmap_range(&mut self, aspace: &mut AddressSpace, vaddr: VirtualAddress, count: usize) -> usize {
        let root = Self::table(aspace.root());
        let mut offset = 0;
        let mut unmapped = 0;

        while offset < count {
            let step = self.unmap_level(
                aspace,
                &root,
                TOP_LEVEL,
                vaddr + offset * PAGE_SIZE,
                count - offset,
            );
            offset += step.advanced;
            unmapped += step.unmapped;
        }
        unmapped
    }

    /// Unmaps up to `remaining` pages under the entry of `table` translating `va`.
    ///
    /// Tables left with no valid entries are unlinked and freed, except the tables hanging
    /// directly off the kernel half of a root, which every user root shares.
    fn unmap_level(
        &mut self,
        aspace: &mut AddressSpace,
        table: &TableView<u64>,
        level: usize,
        va: VirtualAddress,
        remaining: usize,
    ) -> Step {
        let span_pages = level_span(level) / PAGE_SIZE;
        let advanced = remaining.min(span_pages - va.offset_in(level_span(level)) / PAGE_SIZE);
        let index = page_index(va.as_usize(), level);
        let raw = table.read(index);
        let current = FourLevelDescriptor::decode(level, raw);

        match current.kind {
            DescriptorKind::Invalid => Step {
                advanced,
                unmapped: 0,
            },
            DescriptorKind::Page => {
                barrier::clear(&self.cpu, table, index, va);
                Step {
                    advanced,
                    unmapped: 1,
                }
            }
            DescriptorKind::Block => {
                if advanced != span_pages {
                    panic!(
                        "unmap {va}: partial unmap of superpage {} is not supported",
                        current.frame
                    );
                }
                barrier::clear(&self.cpu, table, index, va);
                Step {
                    advanced,
                    unmapped: span_pages,
                }
            }
            DescriptorKind::Table => {
                let child = Self::table(current.frame);
                let mut done = 0;
                let mut unmapped = 0;
                while done < advanced {
                    let step = self.unmap_level(
                        aspace,
                        &child,
                        level - 1,
                        va + done * PAGE_SIZE,
                        advanced - done,
                    );
                    done += step.advanced;
                    unmapped += step.unmapped;
                }

                let shared = level == TOP_LEVEL && index >= KERNEL_HALF_START;
                if !shared
                    && child
                        .iter()
                        .all(|raw| !FourLevelDescriptor::decode(level - 1, raw).is_valid())
                {
                    barrier::clear(&self.cpu, table, index, va.align_down(level_span(level)));
                    let parent = FourLevelDescriptor::decode(level, table.read(index));
                    table::release_if_unreferenced(&mut self.pages, aspace, current.frame, [parent]);
                }
                Step { advanced, unmapped }
            }
            DescriptorKind::Unsupported => {
                panic!("unmap {va}: unsupported level {level} entry {raw:#x}")
            }
        }
    }
}

impl<P: PageAllocator, C: Cpu> ArchMmu for FourLevelMmu<P, C> {
    fn supports_nx_mappings(&self) -> bool {
        true
    }

    fn supports_ns_mappings(&self) -> bool {
        false
    }

    fn init_aspace(
        &mut self,
        base: VirtualAddress,
        size: usize,
        flags: AspaceFlags,
    ) -> Result<AddressSpace, MmuError> {
        log::trace!("init_aspace base {} size {:#x} flags {:?}", base, size, flags);
        validate_geometry(base, size)?;
        let first = base.as_usize();
        let last = first + (size - 1);

        let same_half = ((first as isize) < 0) == ((last as isize) < 0);
        if !self.widths.is_canonical(first) || !self.widths.is_canonical(last) || !same_half {
            log::error!("aspace {}+{:#x} is not canonical", base, size);
            return Err(MmuError::InvalidArgs);
        }

        if flags.contains(AspaceFlags::KERNEL) {
            return Ok(AddressSpace::new(base, size, flags, self.kernel_root));
        }

        if last >= USER_ASPACE_LIMIT {
            log::error!(
                "user aspace {}+{:#x} exceeds the lower half ending at {:#x}",
                base,
                size,
                USER_ASPACE_LIMIT
            );
            return Err(MmuError::InvalidArgs);
        }

        let Some(root) = self.pages.alloc_zeroed_page() else {
            log::error!("out of memory allocating user root table");
            return Err(MmuError::OutOfMemory);
        };

        let kernel = Self::table(self.kernel_root);
        let user = Self::table(root);
        for index in KERNEL_HALF_START..ENTRY_COUNT {
            user.write(index, kernel.read(index));
        }
        self.cpu.data_barrier();

        let aspace = AddressSpace::new(base, size, flags, root);
        log::debug!(
            "user aspace {}..={} root {}",
            aspace.base(),
            aspace.last(),
            root
        );
        Ok(aspace)
    }

    fn destroy_aspace(&mut self, mut aspace: AddressSpace) -> Result<(), MmuError> {
        log::trace!("destroy_aspace root {}", aspace.root());
        if aspace.is_kernel() {
            panic!("refusing to destroy the kernel address space");
        }

        if self.active == Some(aspace.root()) {
            self.context_switch(None);
        }
        for page in aspace.tables_mut().take_all() {
            self.pages.free_page(page);
        }
        self.pages.free_page(aspace.root());
        Ok(())
    }

    fn map(
        &mut self,
        aspace: &mut AddressSpace,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        count: usize,
        flags: MmuFlags,
    ) -> Result<usize, MmuError> {
        log::trace!(
            "map aspace {} vaddr {} paddr {} count {} flags {:?}",
            aspace.root(),
            vaddr,
            paddr,
            count,
            flags
        );

        let len = validate_range(aspace, vaddr, count)?;
        let end = (paddr.as_usize() as u64).checked_add(len as u64);
        if !paddr.is_aligned(PAGE_SIZE) || end.is_none_or(|end| end > self.widths.physical_limit())
        {
            log::error!("invalid physical range {}+{:#x}", paddr, len);
            return Err(MmuError::InvalidArgs);
        }
        if let Err(err) = FourLevelDescriptor::encode(0, DescriptorKind::Page, paddr, flags) {
            log::error!("cannot encode flags {:?}: {}", flags, err);
            return Err(MmuError::InvalidArgs);
        }
        if count == 0 {
            return Ok(0);
        }

        let mut mapped = 0;
        while mapped < count {
            let va = vaddr + mapped * PAGE_SIZE;
            let pa = paddr + mapped * PAGE_SIZE;
            match self.map_one(aspace, va, pa, count - mapped, flags) {
                Ok(pages) => mapped += pages,
                Err(err) => {
                    log::error!("map {} failed after {} pages: {}", vaddr, mapped, err);
                    // The failing page had no leaf yet, but tables may have been linked
                    // on its path.
                    self.unmap_range(aspace, vaddr, mapped + 1);
                    return Err(err);
                }
            }
        }
        Ok(mapped)
    }

    fn unmap(
        &mut self,
        aspace: &mut AddressSpace,
        vaddr: VirtualAddress,
        count: usize,
    ) -> Result<usize, MmuError> {
        log::trace!(
            "unmap aspace {} vaddr {} count {}",
            aspace.root(),
            vaddr,
            count
        );
        validate_range(aspace, vaddr, count)?;
        Ok(self.unmap_range(aspace, vaddr, count))
    }

    fn query(&self, aspace: &AddressSpace, vaddr: VirtualAddress) -> Result<Translation, MmuError> {
        if !aspace.is_valid_vaddr(vaddr) {
            log::error!("query {} outside aspace {}..={}", vaddr, aspace.base(), aspace.last());
            return Err(MmuError::InvalidArgs);
        }
        match self.walk(aspace, vaddr) {
            Walk::Mapped(translation) => Ok(translation),
            Walk::Unmapped { .. } => Err(MmuError::NotFound),
        }
    }

    fn context_switch(&mut self, aspace: Option<&AddressSpace>) {
        // Loading CR3 drops every non-global translation, so no explicit flush is needed.
        match aspace.filter(|aspace| !aspace.is_kernel()) {
            Some(aspace) => {
                log::trace!("context switch to aspace {}", aspace.root());
                self.cpu.set_translation_base(aspace.root());
                self.cpu.set_user_range_enabled(true);
                self.active = Some(aspace.root());
            }
            None => {
                log::trace!("context switch to kernel only");
                self.cpu.set_translation_base(self.kernel_root);
                self.cpu.set_user_range_enabled(false);
                self.active = None;
            }
        }
    }
}
