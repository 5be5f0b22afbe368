//! x86-64 page table entry layout.

use ::x86_64::structures::paging::PageTableFlags;

use crate::arch::PAGE_SIZE;
use crate::arch::x86_64::{LARGE_PAGE_LEVEL, LARGE_PAGE_SIZE, TOP_LEVEL};
use crate::{
    CachePolicy, Descriptor, DescriptorCodec, DescriptorKind, EncodeError, MmuFlags,
    PhysicalAddress,
};

/// Physical address bits of a 4 KiB entry (bits 12..52).
const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;
/// Physical address bits of a 2 MiB entry (bits 21..52).
const LARGE_ADDRESS_MASK: u64 = 0x000F_FFFF_FFE0_0000;

fn check_frame(frame: PhysicalAddress, align: usize) -> Result<u64, EncodeError> {
    if !frame.is_aligned(align) {
        return Err(EncodeError::Misaligned);
    }
    let frame = frame.as_usize() as u64;
    if frame & !ADDRESS_MASK != 0 {
        return Err(EncodeError::OutOfRange);
    }
    Ok(frame)
}

fn leaf_bits(flags: MmuFlags, global: bool) -> Result<PageTableFlags, EncodeError> {
    if flags.contains(MmuFlags::NS) {
        return Err(EncodeError::FlagsNotAllowed);
    }

    let mut bits = PageTableFlags::PRESENT;
    match flags.cache_policy().ok_or(EncodeError::FlagsNotAllowed)? {
        CachePolicy::Cached => {}
        // PAT entries 2 and 3 with the power-on PAT: UC- and UC.
        CachePolicy::Uncached => bits |= PageTableFlags::NO_CACHE,
        CachePolicy::Device => bits |= PageTableFlags::NO_CACHE | PageTableFlags::WRITE_THROUGH,
    }
    if !flags.contains(MmuFlags::PERM_RO) {
        bits |= PageTableFlags::WRITABLE;
    }
    if flags.contains(MmuFlags::PERM_USER) {
        bits |= PageTableFlags::USER_ACCESSIBLE;
    } else if global {
        bits |= PageTableFlags::GLOBAL;
    }
    if flags.contains(MmuFlags::PERM_NO_EXECUTE) {
        bits |= PageTableFlags::NO_EXECUTE;
    }
    Ok(bits)
}

fn leaf_flags(bits: PageTableFlags) -> MmuFlags {
    let policy = if bits.contains(PageTableFlags::NO_CACHE | PageTableFlags::WRITE_THROUGH) {
        CachePolicy::Device
    } else if bits.contains(PageTableFlags::NO_CACHE) {
        CachePolicy::Uncached
    } else {
        CachePolicy::Cached
    };

    let mut flags = MmuFlags::empty().with_cache_policy(policy);
    if !bits.contains(PageTableFlags::WRITABLE) {
        flags |= MmuFlags::PERM_RO;
    }
    if bits.contains(PageTableFlags::USER_ACCESSIBLE) {
        flags |= MmuFlags::PERM_USER;
    }
    if bits.contains(PageTableFlags::NO_EXECUTE) {
        flags |= MmuFlags::PERM_NO_EXECUTE;
    }
    flags
}

/// Codec for x86-64 four-level entries. Level 0 holds 4 KiB pages and level 1 may hold
/// 2 MiB superpages.
///
/// Intermediate entries are always present and writable; a table is user accessible when
/// encoded with [`MmuFlags::PERM_USER`] so the leaf alone decides access. 1 GiB pages
/// decode as [`DescriptorKind::Unsupported`]. Accessed and dirty bits are ignored.
///
/// Leaves from [`DescriptorCodec::encode`] are never global; kernel mappings go through
/// [`FourLevelDescriptor::encode_leaf`].
pub struct FourLevelDescriptor;

impl FourLevelDescriptor {
    /// Encodes a page or superpage. Supervisor leaves get the global bit when `global` is
    /// set, which is only correct for the kernel address space: CR3 reloads keep global
    /// translations.
    pub fn encode_leaf(
        level: usize,
        frame: PhysicalAddress,
        flags: MmuFlags,
        global: bool,
    ) -> Result<u64, EncodeError> {
        match level {
            LARGE_PAGE_LEVEL => {
                let bits = leaf_bits(flags, global)? | PageTableFlags::HUGE_PAGE;
                Ok(check_frame(frame, LARGE_PAGE_SIZE)? | bits.bits())
            }
            0 => Ok(check_frame(frame, PAGE_SIZE)? | leaf_bits(flags, global)?.bits()),
            _ => Err(EncodeError::KindNotAllowed),
        }
    }
}

impl DescriptorCodec for FourLevelDescriptor {
    type Raw = u64;

    fn encode(
        level: usize,
        kind: DescriptorKind,
        frame: PhysicalAddress,
        flags: MmuFlags,
    ) -> Result<u64, EncodeError> {
        match (level, kind) {
            (_, DescriptorKind::Invalid) => Ok(0),
            (1..=TOP_LEVEL, DescriptorKind::Table) => {
                if !MmuFlags::PERM_USER.contains(flags) {
                    return Err(EncodeError::FlagsNotAllowed);
                }
                let mut bits = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
                if flags.contains(MmuFlags::PERM_USER) {
                    bits |= PageTableFlags::USER_ACCESSIBLE;
                }
                Ok(check_frame(frame, PAGE_SIZE)? | bits.bits())
            }
            (LARGE_PAGE_LEVEL, DescriptorKind::Block) | (0, DescriptorKind::Page) => {
                Self::encode_leaf(level, frame, flags, false)
            }
            _ => Err(EncodeError::KindNotAllowed),
        }
    }

    fn decode(level: usize, raw: u64) -> Descriptor {
        let bits = PageTableFlags::from_bits_truncate(raw);
        if !bits.contains(PageTableFlags::PRESENT) {
            return Descriptor::INVALID;
        }

        let huge = bits.contains(PageTableFlags::HUGE_PAGE);
        match level {
            0 => Descriptor {
                kind: DescriptorKind::Page,
                frame: PhysicalAddress::new((raw & ADDRESS_MASK) as usize),
                flags: leaf_flags(bits),
            },
            LARGE_PAGE_LEVEL if huge => Descriptor {
                kind: DescriptorKind::Block,
                frame: PhysicalAddress::new((raw & LARGE_ADDRESS_MASK) as usize),
                flags: leaf_flags(bits),
            },
            1..=TOP_LEVEL if !huge => Descriptor {
                kind: DescriptorKind::Table,
                frame: PhysicalAddress::new((raw & ADDRESS_MASK) as usize),
                flags: if bits.contains(PageTableFlags::USER_ACCESSIBLE) {
                    MmuFlags::PERM_USER
                } else {
                    MmuFlags::empty()
                },
            },
            _ => Descriptor {
                kind: DescriptorKind::Unsupported,
                ..Descriptor::INVALID
            },
        }
    }
}
