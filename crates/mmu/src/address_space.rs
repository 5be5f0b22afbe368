//! Address spaces and the interface every table layout implements.
//!
//! The generic VM layer holds the per-address-space lock around every call into an
//! [`ArchMmu`]; the engines assume exclusive access to the tables they are handed.

use crate::{
    AspaceFlags, MmuError, MmuFlags, OwnedTables, PhysicalAddress, VirtualAddress,
    arch::PAGE_SIZE,
};

/// The architecture-level state of one virtual address space.
///
/// Dropping an address space without passing it to [`ArchMmu::destroy_aspace`] leaks its
/// tables.
#[derive(Debug)]
pub struct AddressSpace {
    base: VirtualAddress,
    size: usize,
    flags: AspaceFlags,
    root: PhysicalAddress,
    root_virt: VirtualAddress,
    tables: OwnedTables,
}

impl AddressSpace {
    pub(crate) fn new(
        base: VirtualAddress,
        size: usize,
        flags: AspaceFlags,
        root: PhysicalAddress,
    ) -> Self {
        Self {
            base,
            size,
            flags,
            root,
            root_virt: VirtualAddress::direct_mapped(root),
            tables: OwnedTables::new(),
        }
    }

    /// First virtual address covered by this address space.
    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Number of bytes covered, starting at [`AddressSpace::base`].
    pub fn size(&self) -> usize {
        self.size
    }

    /// Last virtual address covered (inclusive).
    pub fn last(&self) -> VirtualAddress {
        self.base + (self.size - 1)
    }

    pub fn flags(&self) -> AspaceFlags {
        self.flags
    }

    pub fn is_kernel(&self) -> bool {
        self.flags.contains(AspaceFlags::KERNEL)
    }

    /// Physical address of the root table.
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Kernel alias of the root table.
    pub fn root_virt(&self) -> VirtualAddress {
        self.root_virt
    }

    /// Table pages allocated for this address space, excluding the root.
    pub fn tables(&self) -> &OwnedTables {
        &self.tables
    }

    pub(crate) fn tables_mut(&mut self) -> &mut OwnedTables {
        &mut self.tables
    }

    /// Returns true if `vaddr` lies within this address space.
    pub fn is_valid_vaddr(&self, vaddr: VirtualAddress) -> bool {
        vaddr >= self.base && vaddr - self.base < self.size
    }

    /// Returns true if the `len` bytes starting at `vaddr` lie within this address space.
    pub fn contains_range(&self, vaddr: VirtualAddress, len: usize) -> bool {
        self.is_valid_vaddr(vaddr) && len <= self.size - (vaddr - self.base)
    }
}

/// Checks the geometry shared by every layout: a page-aligned base and size, more than one
/// page, and no wrap past the top of the address range.
pub(crate) fn validate_geometry(base: VirtualAddress, size: usize) -> Result<(), MmuError> {
    if !base.is_aligned(PAGE_SIZE) || size % PAGE_SIZE != 0 || size <= PAGE_SIZE {
        log::error!("invalid aspace geometry base {} size {:#x}", base, size);
        return Err(MmuError::InvalidArgs);
    }
    if base.checked_add(size - 1).is_none() {
        log::error!("aspace base {} size {:#x} wraps", base, size);
        return Err(MmuError::InvalidArgs);
    }
    Ok(())
}

/// Checks the arguments shared by `map` and `unmap` and returns the length in bytes.
pub(crate) fn validate_range(
    aspace: &AddressSpace,
    vaddr: VirtualAddress,
    count: usize,
) -> Result<usize, MmuError> {
    if !vaddr.is_aligned(PAGE_SIZE) {
        log::error!("unaligned virtual address {}", vaddr);
        return Err(MmuError::InvalidArgs);
    }
    let Some(len) = count.checked_mul(PAGE_SIZE) else {
        log::error!("page count {:#x} overflows", count);
        return Err(MmuError::InvalidArgs);
    };
    if count > 0 && !aspace.contains_range(vaddr, len) {
        log::error!(
            "range {}+{:#x} outside aspace {}..={}",
            vaddr,
            len,
            aspace.base(),
            aspace.last()
        );
        return Err(MmuError::InvalidArgs);
    }
    Ok(len)
}

/// Result of a successful [`ArchMmu::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Physical address the queried virtual address translates to, including the offset
    /// within the page or block.
    pub paddr: PhysicalAddress,
    /// Attributes of the terminal descriptor.
    pub flags: MmuFlags,
    /// Table level the terminal descriptor was found at, numbered the way the layout's
    /// codec numbers them.
    pub level: usize,
}

/// Mapping operations implemented by each table layout.
///
/// `map` and `unmap` take page counts of 4 KiB pages and return how many pages they
/// affected. Layouts use larger blocks internally whenever alignment and length permit.
pub trait ArchMmu {
    /// Whether this layout can build address spaces other than the kernel's.
    fn supports_user_aspaces(&self) -> bool {
        true
    }

    /// Whether [`MmuFlags::PERM_NO_EXECUTE`] is honoured.
    fn supports_nx_mappings(&self) -> bool;

    /// Whether [`MmuFlags::NS`] is honoured.
    fn supports_ns_mappings(&self) -> bool;

    /// Creates an address space covering `size` bytes from `base`.
    ///
    /// The kernel address space adopts the statically allocated kernel root; every other
    /// address space gets a fresh root table.
    fn init_aspace(
        &mut self,
        base: VirtualAddress,
        size: usize,
        flags: AspaceFlags,
    ) -> Result<AddressSpace, MmuError>;

    /// Tears down a user address space, returning its root and every table it owns to the
    /// page allocator. Leaf mappings still present are discarded without being unmapped.
    ///
    /// # Panics
    ///
    /// Panics if `aspace` is the kernel address space.
    fn destroy_aspace(&mut self, aspace: AddressSpace) -> Result<(), MmuError>;

    /// Maps `count` pages starting at `vaddr` to the physically contiguous range at `paddr`.
    ///
    /// On failure every page this call mapped is unmapped again before returning, including
    /// pages that were mapped before the call and got overwritten.
    fn map(
        &mut self,
        aspace: &mut AddressSpace,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        count: usize,
        flags: MmuFlags,
    ) -> Result<usize, MmuError>;

    /// Removes the translations of `count` pages starting at `vaddr` and returns how many
    /// pages were actually mapped. Holes are skipped.
    fn unmap(
        &mut self,
        aspace: &mut AddressSpace,
        vaddr: VirtualAddress,
        count: usize,
    ) -> Result<usize, MmuError>;

    /// Looks up the translation of `vaddr`, which need not be page aligned.
    fn query(&self, aspace: &AddressSpace, vaddr: VirtualAddress)
    -> Result<Translation, MmuError>;

    /// Makes `aspace` the active user address space of this CPU, or deactivates the user
    /// range when given None or the kernel address space.
    fn context_switch(&mut self, aspace: Option<&AddressSpace>);
}
