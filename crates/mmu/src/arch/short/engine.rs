use crate::address_space::{validate_geometry, validate_range};
use crate::arch::PAGE_SIZE;
use crate::arch::short::{
    ADDRESS_LIMIT, KERNEL_ROOT_ENTRIES, KERNEL_ROOT_SIZE, L1, L2, L2_ENTRIES, L2_TABLE_SIZE,
    L2_TABLES_PER_PAGE, PAGES_PER_SECTION, SECTION_SIZE, ShortDescriptor, USER_ASPACE_LIMIT,
    USER_ROOT_ENTRIES, l1_group, l1_index, l2_index,
};
use crate::table::{self, TableView};
use crate::{
    AddressSpace, ArchMmu, AspaceFlags, Cpu, Descriptor, DescriptorCodec, DescriptorKind,
    MmuError, MmuFlags, PageAllocator, PhysicalAddress, Translation, VirtualAddress, barrier,
};

/// Mapping engine for the ARMv7 short-descriptor layout.
///
/// Runs that are section aligned in both address spaces and cover a whole section become a
/// single root descriptor; everything else goes through second-level tables.
pub struct ShortDescriptorMmu<P, C> {
    pages: P,
    cpu: C,
    kernel_root: PhysicalAddress,
    active: Option<PhysicalAddress>,
}

impl<P: PageAllocator, C: Cpu> ShortDescriptorMmu<P, C> {
    /// Creates an engine around the statically allocated kernel root.
    ///
    /// # Panics
    ///
    /// Panics if `kernel_root` is not aligned to [`KERNEL_ROOT_SIZE`].
    pub fn new(pages: P, cpu: C, kernel_root: PhysicalAddress) -> Self {
        assert!(
            kernel_root.is_aligned(KERNEL_ROOT_SIZE),
            "kernel root {kernel_root} must be {KERNEL_ROOT_SIZE:#x} aligned"
        );
        Self {
            pages,
            cpu,
            kernel_root,
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

    /// Root of the user address space currently active on this CPU.
    pub fn active(&self) -> Option<PhysicalAddress> {
        self.active
    }

    fn root_table(aspace: &AddressSpace) -> TableView<u32> {
        let entries = if aspace.is_kernel() {
            KERNEL_ROOT_ENTRIES
        } else {
            USER_ROOT_ENTRIES
        };
        // SAFETY: roots are allocated with exactly this many entries and live as long as
        // the address space.
        unsafe { TableView::new(aspace.root(), entries) }
    }

    fn l2_table(frame: PhysicalAddress) -> TableView<u32> {
        // SAFETY: `frame` comes from a table descriptor of a live address space.
        unsafe { TableView::new(frame, L2_ENTRIES) }
    }

    /// Maps as much of the request as fits in the root slot translating `va`.
    fn map_slot(
        &mut self,
        aspace: &mut AddressSpace,
        root: &TableView<u32>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        remaining: usize,
        flags: MmuFlags,
    ) -> Result<usize, MmuError> {
        let index = l1_index(va.as_usize());
        let raw = root.read(index);
        let current = ShortDescriptor::decode(L1, raw);
        let section_eligible = va.is_aligned(SECTION_SIZE)
            && pa.is_aligned(SECTION_SIZE)
            && remaining >= PAGES_PER_SECTION;

        match current.kind {
            DescriptorKind::Invalid | DescriptorKind::Block if section_eligible => {
                let section = ShortDescriptor::encode(L1, DescriptorKind::Block, pa, flags)?;
                if current.is_valid() {
                    barrier::revoke(&self.cpu, root, index, section, va);
                } else {
                    barrier::install(&self.cpu, root, index, section, va);
                }
                return Ok(PAGES_PER_SECTION);
            }
            DescriptorKind::Block => panic!(
                "map {va}: section at {} would need splitting, which is not supported",
                current.frame
            ),
            DescriptorKind::Page | DescriptorKind::Unsupported => {
                panic!("map {va}: unsupported first-level descriptor {raw:#x}")
            }
            DescriptorKind::Invalid | DescriptorKind::Table => {}
        }

        let l2 = self.ensure_l2_table(aspace, root, index, va, flags & MmuFlags::NS)?;
        let leaf_flags = flags - MmuFlags::NS;
        let first = l2_index(va.as_usize());
        let count = remaining.min(L2_ENTRIES - first);

        for offset in 0..count {
            let slot = first + offset;
            let page_va = va + offset * PAGE_SIZE;
            let page = ShortDescriptor::encode(
                L2,
                DescriptorKind::Page,
                pa + offset * PAGE_SIZE,
                leaf_flags,
            )?;

            let existing = l2.read(slot);
            match ShortDescriptor::decode(L2, existing).kind {
                DescriptorKind::Invalid => barrier::install(&self.cpu, &l2, slot, page, page_va),
                DescriptorKind::Page => barrier::revoke(&self.cpu, &l2, slot, page, page_va),
                _ => panic!("map {page_va}: unsupported second-level descriptor {existing:#x}"),
            }
        }
        Ok(count)
    }

    /// Returns the second-level table for root slot `index`, linking one if needed.
    ///
    /// A new table is placed in the page already used by another slot of the same group
    /// when there is one.
    fn ensure_l2_table(
        &mut self,
        aspace: &mut AddressSpace,
        root: &TableView<u32>,
        index: usize,
        va: VirtualAddress,
        ns: MmuFlags,
    ) -> Result<TableView<u32>, MmuError> {
        let current = ShortDescriptor::decode(L1, root.read(index));
        if current.kind == DescriptorKind::Table {
            // `map` rejects security state conflicts before writing anything.
            debug_assert_eq!(current.flags, ns, "map {va}: security state conflict");
            return Ok(Self::l2_table(current.frame));
        }

        let group = l1_group(index);
        let shared_page = (group..group + L2_TABLES_PER_PAGE)
            .map(|slot| ShortDescriptor::decode(L1, root.read(slot)))
            .find(|descriptor| descriptor.kind == DescriptorKind::Table)
            .map(|descriptor| descriptor.frame.align_down(PAGE_SIZE));

        let page = match shared_page {
            Some(page) => page,
            None => table::acquire_table(&mut self.pages, aspace)?,
        };
        let frame = page + (index - group) * L2_TABLE_SIZE;
        let link = ShortDescriptor::encode(L1, DescriptorKind::Table, frame, ns)?;
        barrier::link_table(&self.cpu, root, index, link, va.align_down(SECTION_SIZE));

        log::trace!("root slot {:#x} -> second-level table {}", index, frame);
        Ok(Self::l2_table(frame))
    }

    fn unmap_range(
        &mut self,
        aspace: &mut AddressSpace,
        root: &TableView<u32>,
        vaddr: VirtualAddress,
        count: usize,
    ) -> usize {
        let mut offset = 0;
        let mut unmapped = 0;

        while offset < count {
            let va = vaddr + offset * PAGE_SIZE;
            let index = l1_index(va.as_usize());
            let step = (count - offset).min(PAGES_PER_SECTION - l2_index(va.as_usize()));
            let raw = root.read(index);
            let current = ShortDescriptor::decode(L1, raw);

            match current.kind {
                DescriptorKind::Invalid => {}
                DescriptorKind::Block => {
                    if step != PAGES_PER_SECTION {
                        panic!(
                            "unmap {va}: partial unmap of section {} is not supported",
                            current.frame
                        );
                    }
                    barrier::clear(&self.cpu, root, index, va);
                    unmapped += PAGES_PER_SECTION;
                }
                DescriptorKind::Table => {
                    unmapped += self.unmap_pages(aspace, root, index, current.frame, va, step);
                }
                DescriptorKind::Page | DescriptorKind::Unsupported => {
                    panic!("unmap {va}: unsupported first-level descriptor {raw:#x}")
                }
            }
            offset += step;
        }
        unmapped
    }

    /// Clears `count` pages of the second-level table at `frame`, then unlinks and
    /// reclaims the table if nothing in it is valid any more.
    fn unmap_pages(
        &mut self,
        aspace: &mut AddressSpace,
        root: &TableView<u32>,
        index: usize,
        frame: PhysicalAddress,
        va: VirtualAddress,
        count: usize,
    ) -> usize {
        let l2 = Self::l2_table(frame);
        let first = l2_index(va.as_usize());
        let mut cleared = 0;

        for slot in first..first + count {
            let page_va = va + (slot - first) * PAGE_SIZE;
            let raw = l2.read(slot);
            match ShortDescriptor::decode(L2, raw).kind {
                DescriptorKind::Invalid => {}
                DescriptorKind::Page => {
                    barrier::clear(&self.cpu, &l2, slot, page_va);
                    cleared += 1;
                }
                _ => panic!("unmap {page_va}: unsupported second-level descriptor {raw:#x}"),
            }
        }

        if l2
            .iter()
            .all(|raw| !ShortDescriptor::decode(L2, raw).is_valid())
        {
            barrier::clear(&self.cpu, root, index, va.align_down(SECTION_SIZE));

            let group = l1_group(index);
            let siblings: [Descriptor; L2_TABLES_PER_PAGE] =
                core::array::from_fn(|slot| ShortDescriptor::decode(L1, root.read(group + slot)));
            table::release_if_unreferenced(
                &mut self.pages,
                aspace,
                frame.align_down(PAGE_SIZE),
                siblings,
            );
        }
        cleared
    }
}

impl<P: PageAllocator, C: Cpu> ArchMmu for ShortDescriptorMmu<P, C> {
    fn supports_nx_mappings(&self) -> bool {
        true
    }

    fn supports_ns_mappings(&self) -> bool {
        true
    }

    fn init_aspace(
        &mut self,
        base: VirtualAddress,
        size: usize,
        flags: AspaceFlags,
    ) -> Result<AddressSpace, MmuError> {
        log::trace!("init_aspace base {} size {:#x} flags {:?}", base, size, flags);
        validate_geometry(base, size)?;
        let end = base.as_usize() as u64 + size as u64;

        if flags.contains(AspaceFlags::KERNEL) {
            if end > ADDRESS_LIMIT {
                log::error!("kernel aspace {}+{:#x} exceeds 4 GiB", base, size);
                return Err(MmuError::InvalidArgs);
            }
            return Ok(AddressSpace::new(base, size, flags, self.kernel_root));
        }

        if end > USER_ASPACE_LIMIT as u64 {
            log::error!(
                "user aspace {}+{:#x} exceeds the user range ending at {:#x}",
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
        if !paddr.is_aligned(PAGE_SIZE) || paddr.as_usize() as u64 + len as u64 > ADDRESS_LIMIT {
            log::error!("invalid physical range {}+{:#x}", paddr, len);
            return Err(MmuError::InvalidArgs);
        }
        if let Err(err) =
            ShortDescriptor::encode(L2, DescriptorKind::Page, paddr, flags - MmuFlags::NS)
        {
            log::error!("cannot encode flags {:?}: {}", flags, err);
            return Err(MmuError::InvalidArgs);
        }
        if count == 0 {
            return Ok(0);
        }

        let root = Self::root_table(aspace);
        let ns = flags & MmuFlags::NS;
        let last = vaddr + (len - 1);
        for index in l1_index(vaddr.as_usize())..=l1_index(last.as_usize()) {
            let linked = ShortDescriptor::decode(L1, root.read(index));
            if linked.kind == DescriptorKind::Table && linked.flags != ns {
                log::error!(
                    "map {}: security state {:?} conflicts with table at root slot {:#x}",
                    vaddr,
                    ns,
                    index
                );
                return Err(MmuError::InvalidArgs);
            }
        }

        let mut mapped = 0;
        while mapped < count {
            let va = vaddr + mapped * PAGE_SIZE;
            let pa = paddr + mapped * PAGE_SIZE;
            match self.map_slot(aspace, &root, va, pa, count - mapped, flags) {
                Ok(pages) => mapped += pages,
                Err(err) => {
                    log::error!("map {} failed after {} pages: {}", vaddr, mapped, err);
                    self.unmap_range(aspace, &root, vaddr, mapped);
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
        let root = Self::root_table(aspace);
        Ok(self.unmap_range(aspace, &root, vaddr, count))
    }

    fn query(&self, aspace: &AddressSpace, vaddr: VirtualAddress) -> Result<Translation, MmuError> {
        if !aspace.is_valid_vaddr(vaddr) {
            log::error!("query {} outside aspace {}..={}", vaddr, aspace.base(), aspace.last());
            return Err(MmuError::InvalidArgs);
        }

        let root = Self::root_table(aspace);
        let raw = root.read(l1_index(vaddr.as_usize()));
        let l1 = ShortDescriptor::decode(L1, raw);
        match l1.kind {
            DescriptorKind::Invalid => Err(MmuError::NotFound),
            DescriptorKind::Block => Ok(Translation {
                paddr: l1.frame + vaddr.offset_in(SECTION_SIZE),
                flags: l1.flags,
                level: L1,
            }),
            DescriptorKind::Table => {
                let raw = Self::l2_table(l1.frame).read(l2_index(vaddr.as_usize()));
                let page = ShortDescriptor::decode(L2, raw);
                match page.kind {
                    DescriptorKind::Invalid => Err(MmuError::NotFound),
                    DescriptorKind::Page => Ok(Translation {
                        paddr: page.frame + vaddr.page_offset(),
                        flags: page.flags | l1.flags,
                        level: L2,
                    }),
                    _ => panic!("query {vaddr}: unsupported second-level descriptor {raw:#x}"),
                }
            }
            DescriptorKind::Page | DescriptorKind::Unsupported => {
                panic!("query {vaddr}: unsupported first-level descriptor {raw:#x}")
            }
        }
    }

    fn context_switch(&mut self, aspace: Option<&AddressSpace>) {
        match aspace.filter(|aspace| !aspace.is_kernel()) {
            Some(aspace) => {
                log::trace!("context switch to aspace {}", aspace.root());
                self.cpu.data_barrier();
                self.cpu.set_translation_base(aspace.root());
                self.cpu.instruction_barrier();
                self.cpu.set_user_range_enabled(true);
                self.active = Some(aspace.root());
            }
            None => {
                log::trace!("context switch to kernel only");
                self.cpu.set_user_range_enabled(false);
                self.active = None;
            }
        }

        // Without ASIDs every non-global translation belongs to the previous space.
        self.cpu.instruction_barrier();
        self.cpu.invalidate_all();
        self.cpu.data_barrier();
        self.cpu.instruction_barrier();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AddressTranslator;
    use crate::arch::software::{self, Event, EventLog, RecordingCpu, SoftwarePageAllocator};
    use proptest::prelude::*;

    type TestMmu = ShortDescriptorMmu<SoftwarePageAllocator, RecordingCpu>;

    const MIB: usize = 1024 * 1024;

    fn engine_with(pages: SoftwarePageAllocator) -> (TestMmu, EventLog) {
        software::setup();
        let log = EventLog::default();
        let kernel_root = AddressTranslator::current()
            .allocate(KERNEL_ROOT_SIZE, KERNEL_ROOT_SIZE)
            .expect("room for kernel root");
        let mmu = ShortDescriptorMmu::new(
            pages.with_log(log.clone()),
            RecordingCpu::new(log.clone()),
            kernel_root,
        );
        (mmu, log)
    }

    fn engine() -> (TestMmu, EventLog) {
        engine_with(SoftwarePageAllocator::new())
    }

    fn user_aspace(mmu: &mut TestMmu) -> AddressSpace {
        mmu.init_aspace(
            VirtualAddress::new(0x1000_0000),
            16 * MIB,
            AspaceFlags::empty(),
        )
        .unwrap()
    }

    fn va(addr: usize) -> VirtualAddress {
        VirtualAddress::new(addr)
    }

    fn pa(addr: usize) -> PhysicalAddress {
        PhysicalAddress::new(addr)
    }

    fn root_descriptor(aspace: &AddressSpace, addr: usize) -> Descriptor {
        let root = TestMmu::root_table(aspace);
        ShortDescriptor::decode(L1, root.read(l1_index(addr)))
    }

    #[test]
    fn map_query_unmap_scenario() {
        let (mut mmu, _) = engine();
        let mut aspace = user_aspace(&mut mmu);

        let mapped = mmu
            .map(&mut aspace, va(0x1000_1000), pa(0x8000_1000), 3, MmuFlags::empty())
            .unwrap();
        assert_eq!(mapped, 3);

        let translation = mmu.query(&aspace, va(0x1000_2000)).unwrap();
        assert_eq!(translation.paddr, pa(0x8000_2000));
        assert_eq!(translation.flags, MmuFlags::empty());
        assert_eq!(translation.level, L2);

        assert_eq!(mmu.unmap(&mut aspace, va(0x1000_1000), 3), Ok(3));
        assert_eq!(
            mmu.query(&aspace, va(0x1000_1000)),
            Err(MmuError::NotFound)
        );
        mmu.destroy_aspace(aspace).unwrap();
        assert_eq!(mmu.pages().outstanding(), 0);
    }

    #[test]
    fn unmapping_a_hole_is_a_noop() {
        let (mut mmu, log) = engine();
        let mut aspace = user_aspace(&mut mmu);
        log.clear();

        assert_eq!(mmu.unmap(&mut aspace, va(0x1030_0000), 600), Ok(0));
        assert!(log.events().is_empty());
    }

    #[test]
    fn query_keeps_byte_offset() {
        let (mut mmu, _) = engine();
        let mut aspace = user_aspace(&mut mmu);
        mmu.map(&mut aspace, va(0x1000_5000), pa(0x4000_0000), 1, MmuFlags::PERM_USER)
            .unwrap();

        let translation = mmu.query(&aspace, va(0x1000_5abc)).unwrap();
        assert_eq!(translation.paddr, pa(0x4000_0abc));
        assert_eq!(translation.flags, MmuFlags::PERM_USER);
    }

    #[test]
    fn aligned_section_run_is_promoted() {
        let (mut mmu, log) = engine();
        let mut aspace = user_aspace(&mut mmu);

        let flags = MmuFlags::PERM_USER | MmuFlags::PERM_NO_EXECUTE;
        let mapped = mmu
            .map(&mut aspace, va(0x1010_0000), pa(0x8010_0000), PAGES_PER_SECTION, flags)
            .unwrap();
        assert_eq!(mapped, PAGES_PER_SECTION);
        assert!(aspace.tables().is_empty());

        let section = root_descriptor(&aspace, 0x1010_0000);
        assert_eq!(section.kind, DescriptorKind::Block);
        assert_eq!(section.frame, pa(0x8010_0000));

        let translation = mmu.query(&aspace, va(0x1015_4321)).unwrap();
        assert_eq!(translation.paddr, pa(0x8015_4321));
        assert_eq!(translation.flags, flags);
        assert_eq!(translation.level, L1);

        log.clear();
        assert_eq!(
            mmu.unmap(&mut aspace, va(0x1010_0000), PAGES_PER_SECTION),
            Ok(PAGES_PER_SECTION)
        );
        let invalidations: Vec<_> = log
            .events()
            .into_iter()
            .filter(|event| matches!(event, Event::InvalidatePage(_)))
            .collect();
        assert_eq!(invalidations, [Event::InvalidatePage(va(0x1010_0000))]);
    }

    #[test]
    fn mixed_run_uses_sections_and_pages() {
        let (mut mmu, _) = engine();
        let mut aspace = user_aspace(&mut mmu);

        // Two pages before the boundary, one full section, three pages after.
        let count = 2 + PAGES_PER_SECTION + 3;
        mmu.map(&mut aspace, va(0x100F_E000), pa(0x200F_E000), count, MmuFlags::empty())
            .unwrap();

        assert_eq!(root_descriptor(&aspace, 0x100F_E000).kind, DescriptorKind::Table);
        assert_eq!(root_descriptor(&aspace, 0x1010_0000).kind, DescriptorKind::Block);
        assert_eq!(root_descriptor(&aspace, 0x1020_0000).kind, DescriptorKind::Table);
        // Slots 0x100 and 0x102 share a group, so one page holds both tables.
        assert_eq!(aspace.tables().len(), 1);

        assert_eq!(mmu.unmap(&mut aspace, va(0x100F_E000), count), Ok(count));
        assert!(aspace.tables().is_empty());
    }

    #[test]
    fn sibling_keeps_shared_table_alive() {
        let (mut mmu, log) = engine();
        let mut aspace = user_aspace(&mut mmu);

        mmu.map(&mut aspace, va(0x1000_0000), pa(0x9000_0000), 4, MmuFlags::empty())
            .unwrap();
        mmu.map(&mut aspace, va(0x1010_0000), pa(0x9100_0000), 4, MmuFlags::empty())
            .unwrap();
        assert_eq!(aspace.tables().len(), 1);
        let shared = aspace.tables().iter().next().unwrap();
        assert_eq!(root_descriptor(&aspace, 0x1000_0000).frame, shared);
        assert_eq!(root_descriptor(&aspace, 0x1010_0000).frame, shared + L2_TABLE_SIZE);

        assert_eq!(mmu.unmap(&mut aspace, va(0x1000_0000), 4), Ok(4));
        assert_eq!(root_descriptor(&aspace, 0x1000_0000).kind, DescriptorKind::Invalid);
        assert!(aspace.tables().contains(shared));
        assert_eq!(log.position(Event::PageFreed(shared)), None);
        assert_eq!(
            mmu.query(&aspace, va(0x1010_3000)).unwrap().paddr,
            pa(0x9100_3000)
        );

        // The freed quarter is reused for the same slot.
        mmu.map(&mut aspace, va(0x1000_0000), pa(0x9200_0000), 1, MmuFlags::empty())
            .unwrap();
        assert_eq!(root_descriptor(&aspace, 0x1000_0000).frame, shared);
        assert_eq!(aspace.tables().len(), 1);

        mmu.unmap(&mut aspace, va(0x1000_0000), 1).unwrap();
        mmu.unmap(&mut aspace, va(0x1010_0000), 4).unwrap();
        assert!(aspace.tables().is_empty());
        assert!(log.position(Event::PageFreed(shared)).is_some());
    }

    #[test]
    fn table_is_freed_only_after_parent_is_invalidated() {
        let (mut mmu, log) = engine();
        let mut aspace = user_aspace(&mut mmu);
        mmu.map(&mut aspace, va(0x1040_3000), pa(0x7000_0000), 2, MmuFlags::empty())
            .unwrap();
        let table_page = aspace.tables().iter().next().unwrap();
        let root_slot =
            TestMmu::root_table(&aspace).slot_address(l1_index(0x1040_0000));
        log.clear();

        mmu.unmap(&mut aspace, va(0x1040_3000), 2).unwrap();

        let cleared = log.position(Event::DescriptorWritten(root_slot)).unwrap();
        let invalidated = log
            .position_after(cleared, Event::InvalidatePage(va(0x1040_0000)))
            .unwrap();
        let freed = log.position(Event::PageFreed(table_page)).unwrap();
        assert!(cleared < invalidated && invalidated < freed);
    }

    #[test]
    fn ownership_list_returns_to_prior_state() {
        let (mut mmu, _) = engine();
        let mut aspace = user_aspace(&mut mmu);
        mmu.map(&mut aspace, va(0x1080_0000), pa(0x6000_0000), 1, MmuFlags::empty())
            .unwrap();
        let before: Vec<_> = aspace.tables().iter().collect();

        // Unaligned physical start keeps everything at page granularity across six slots.
        let count = 5 * PAGES_PER_SECTION + 17;
        mmu.map(&mut aspace, va(0x1100_0000 - count * PAGE_SIZE), pa(0x5000_1000), count, MmuFlags::empty())
            .unwrap();
        assert!(aspace.tables().len() > before.len());

        assert_eq!(
            mmu.unmap(&mut aspace, va(0x1100_0000 - count * PAGE_SIZE), count),
            Ok(count)
        );
        let after: Vec<_> = aspace.tables().iter().collect();
        assert_eq!(after, before);
    }

    #[test]
    fn remapping_a_page_invalidates_it() {
        let (mut mmu, log) = engine();
        let mut aspace = user_aspace(&mut mmu);
        mmu.map(&mut aspace, va(0x1000_8000), pa(0x3000_0000), 1, MmuFlags::empty())
            .unwrap();
        log.clear();

        mmu.map(&mut aspace, va(0x1000_8000), pa(0x3100_0000), 1, MmuFlags::PERM_RO)
            .unwrap();

        assert!(log.position(Event::InvalidatePage(va(0x1000_8000))).is_some());
        let translation = mmu.query(&aspace, va(0x1000_8000)).unwrap();
        assert_eq!(translation.paddr, pa(0x3100_0000));
        assert_eq!(translation.flags, MmuFlags::PERM_RO);
    }

    #[test]
    fn non_secure_is_carried_by_the_table_link() {
        let (mut mmu, _) = engine();
        let mut aspace = user_aspace(&mut mmu);
        let flags = MmuFlags::NS | MmuFlags::UNCACHED_DEVICE;
        mmu.map(&mut aspace, va(0x1020_0000), pa(0x4000_0000), 2, flags)
            .unwrap();

        assert_eq!(root_descriptor(&aspace, 0x1020_0000).flags, MmuFlags::NS);
        assert_eq!(mmu.query(&aspace, va(0x1020_1000)).unwrap().flags, flags);

        assert_eq!(
            mmu.map(&mut aspace, va(0x1020_4000), pa(0x4000_4000), 1, MmuFlags::empty()),
            Err(MmuError::InvalidArgs)
        );
    }

    #[test]
    fn security_conflict_leaves_earlier_slots_untouched() {
        let (mut mmu, log) = engine();
        let mut aspace = user_aspace(&mut mmu);
        mmu.map(&mut aspace, va(0x100F_F000), pa(0x5000_0000), 1, MmuFlags::NS)
            .unwrap();
        mmu.map(&mut aspace, va(0x1010_0000), pa(0x5100_0000), 1, MmuFlags::empty())
            .unwrap();
        let before = mmu.query(&aspace, va(0x100F_F000)).unwrap();
        log.clear();

        // The first page would land in the non-secure slot, the second in the secure one.
        assert_eq!(
            mmu.map(&mut aspace, va(0x100F_F000), pa(0x6000_0000), 2, MmuFlags::NS),
            Err(MmuError::InvalidArgs)
        );
        assert!(log.events().is_empty());
        assert_eq!(mmu.query(&aspace, va(0x100F_F000)), Ok(before));
        assert_eq!(before.paddr, pa(0x5000_0000));
        assert_eq!(
            mmu.query(&aspace, va(0x1010_0000)).unwrap().paddr,
            pa(0x5100_0000)
        );
    }

    #[test]
    fn invalid_arguments_are_rejected_before_mutation() {
        let (mut mmu, log) = engine();
        let mut aspace = user_aspace(&mut mmu);
        log.clear();

        let cases = [
            (0x1000_0800, 0x8000_0000, 1, MmuFlags::empty()),
            (0x1000_0000, 0x8000_0800, 1, MmuFlags::empty()),
            (0x0FFF_F000, 0x8000_0000, 1, MmuFlags::empty()),
            (0x10FF_F000, 0x8000_0000, 2, MmuFlags::empty()),
            (0x1000_0000, 0xFFFF_F000, 2, MmuFlags::empty()),
            (0x1000_0000, 0x8000_0000, 1, MmuFlags::CACHE_MASK),
        ];
        for (vaddr, paddr, count, flags) in cases {
            assert_eq!(
                mmu.map(&mut aspace, va(vaddr), pa(paddr), count, flags),
                Err(MmuError::InvalidArgs),
                "map {vaddr:#x} -> {paddr:#x} x{count}"
            );
        }
        assert_eq!(mmu.unmap(&mut aspace, va(0x1000_0800), 1), Err(MmuError::InvalidArgs));
        assert_eq!(mmu.query(&aspace, va(0x2000_0000)), Err(MmuError::InvalidArgs));
        assert_eq!(
            mmu.map(&mut aspace, va(0x1000_0000), pa(0x8000_0000), 0, MmuFlags::empty()),
            Ok(0)
        );
        assert!(log.events().is_empty());
        assert!(aspace.tables().is_empty());
    }

    #[test]
    fn out_of_memory_rolls_back_the_whole_call() {
        // Root plus a single table page.
        let (mut mmu, _) = engine_with(SoftwarePageAllocator::with_budget(2));
        let mut aspace = user_aspace(&mut mmu);

        // Slots 0x100..=0x103 share the first page; slot 0x104 needs a second one.
        let count = 4 * PAGES_PER_SECTION;
        assert_eq!(
            mmu.map(&mut aspace, va(0x1000_1000), pa(0x8000_1000), count, MmuFlags::empty()),
            Err(MmuError::OutOfMemory)
        );
        for page in [0x1000_1000, 0x1020_0000, 0x1040_0000] {
            assert_eq!(mmu.query(&aspace, va(page)), Err(MmuError::NotFound));
        }
        assert!(aspace.tables().is_empty());
        assert_eq!(mmu.pages().outstanding(), 1);
    }

    #[test]
    fn user_aspace_geometry() {
        let (mut mmu, _) = engine();
        assert_eq!(
            mmu.init_aspace(va(0x3FF0_0000), 2 * MIB, AspaceFlags::empty())
                .map(|_| ()),
            Err(MmuError::InvalidArgs)
        );
        assert_eq!(
            mmu.init_aspace(va(0x1000), 0, AspaceFlags::empty()).map(|_| ()),
            Err(MmuError::InvalidArgs)
        );

        let (mut starved, _) = engine_with(SoftwarePageAllocator::with_budget(0));
        assert_eq!(
            starved
                .init_aspace(va(0x1000), MIB, AspaceFlags::empty())
                .map(|_| ()),
            Err(MmuError::OutOfMemory)
        );
    }

    #[test]
    fn kernel_aspace_uses_static_root() {
        let (mut mmu, _) = engine();
        let mut kernel = mmu
            .init_aspace(va(0xC000_0000), 1024 * MIB, AspaceFlags::KERNEL)
            .unwrap();
        assert_eq!(kernel.root(), mmu.kernel_root());

        mmu.map(&mut kernel, va(0xC010_0000), pa(0x0010_0000), PAGES_PER_SECTION, MmuFlags::empty())
            .unwrap();
        let before: Vec<u32> = TestMmu::root_table(&kernel).iter().collect();

        let user = user_aspace(&mut mmu);
        assert_ne!(user.root(), mmu.kernel_root());
        let after: Vec<u32> = TestMmu::root_table(&kernel).iter().collect();
        assert_eq!(before, after);
        assert_eq!(
            mmu.query(&kernel, va(0xC018_0000)).unwrap().paddr,
            pa(0x0018_0000)
        );
    }

    #[test]
    #[should_panic(expected = "refusing to destroy the kernel address space")]
    fn destroying_kernel_aspace_panics() {
        let (mut mmu, _) = engine();
        let kernel = mmu
            .init_aspace(va(0xC000_0000), 1024 * MIB, AspaceFlags::KERNEL)
            .unwrap();
        let _ = mmu.destroy_aspace(kernel);
    }

    #[test]
    #[should_panic(expected = "partial unmap of section")]
    fn partial_section_unmap_panics() {
        let (mut mmu, _) = engine();
        let mut aspace = user_aspace(&mut mmu);
        mmu.map(&mut aspace, va(0x1010_0000), pa(0x8010_0000), PAGES_PER_SECTION, MmuFlags::empty())
            .unwrap();
        let _ = mmu.unmap(&mut aspace, va(0x1010_0000), 16);
    }

    #[test]
    #[should_panic(expected = "not supported")]
    fn mapping_pages_into_a_section_panics() {
        let (mut mmu, _) = engine();
        let mut aspace = user_aspace(&mut mmu);
        mmu.map(&mut aspace, va(0x1010_0000), pa(0x8010_0000), PAGES_PER_SECTION, MmuFlags::empty())
            .unwrap();
        let _ = mmu.map(&mut aspace, va(0x1010_4000), pa(0x9000_0000), 1, MmuFlags::empty());
    }

    #[test]
    #[should_panic(expected = "unsupported first-level descriptor")]
    fn supersection_is_fatal() {
        let (mut mmu, _) = engine();
        let mut aspace = user_aspace(&mut mmu);
        let root = TestMmu::root_table(&aspace);
        root.write(l1_index(0x1000_0000), 0x0100_0000 | (1 << 18) | 0b10);
        let _ = mmu.unmap(&mut aspace, va(0x1000_0000), 1);
    }

    #[test]
    fn context_switch_programs_the_cpu() {
        let (mut mmu, _) = engine();
        let user = user_aspace(&mut mmu);

        mmu.context_switch(Some(&user));
        assert_eq!(mmu.active(), Some(user.root()));
        assert_eq!(mmu.cpu().translation_base(), Some(user.root()));
        assert!(mmu.cpu().user_range_enabled());

        mmu.context_switch(None);
        assert_eq!(mmu.active(), None);
        assert!(!mmu.cpu().user_range_enabled());

        mmu.context_switch(Some(&user));
        mmu.destroy_aspace(user).unwrap();
        assert_eq!(mmu.active(), None);
        assert!(!mmu.cpu().user_range_enabled());
    }

    fn mapping_flags() -> impl Strategy<Value = MmuFlags> {
        (0u32..64)
            .prop_map(MmuFlags::from_bits_truncate)
            .prop_filter("one memory type", |flags| flags.cache_policy().is_some())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn map_query_unmap_round_trip(
            start in 0usize..(16 * MIB / PAGE_SIZE - 600),
            count in 1usize..600,
            frame in 0usize..0x8_0000,
            flags in mapping_flags(),
        ) {
            let (mut mmu, _) = engine();
            let mut aspace = user_aspace(&mut mmu);
            let vaddr = va(0x1000_0000 + start * PAGE_SIZE);
            let paddr = pa(frame * PAGE_SIZE);

            prop_assert_eq!(mmu.map(&mut aspace, vaddr, paddr, count, flags), Ok(count));
            for page in 0..count {
                let translation = mmu.query(&aspace, vaddr + page * PAGE_SIZE).unwrap();
                prop_assert_eq!(translation.paddr, paddr + page * PAGE_SIZE);
                prop_assert_eq!(translation.flags, flags);
            }

            prop_assert_eq!(mmu.unmap(&mut aspace, vaddr, count), Ok(count));
            for page in 0..count {
                prop_assert_eq!(
                    mmu.query(&aspace, vaddr + page * PAGE_SIZE),
                    Err(MmuError::NotFound)
                );
            }
            prop_assert!(aspace.tables().is_empty());
            mmu.destroy_aspace(aspace).unwrap();
            prop_assert_eq!(mmu.pages().outstanding(), 0);
        }
    }
}
