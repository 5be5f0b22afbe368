//! Short-descriptor bit layout.

use crate::arch::short::{ADDRESS_LIMIT, L1, L2, L2_TABLE_SIZE, SECTION_SIZE};
use crate::{
    CachePolicy, Descriptor, DescriptorCodec, DescriptorKind, EncodeError, MmuFlags,
    PhysicalAddress, arch::PAGE_SIZE,
};

const TYPE_MASK: u32 = 0b11;

const L1_TYPE_PAGE_TABLE: u32 = 0b01;
const L1_TYPE_SECTION: u32 = 0b10;
const L1_SUPERSECTION: u32 = 1 << 18;
const L1_PAGE_TABLE_NS: u32 = 1 << 3;
const L1_SECTION_NS: u32 = 1 << 19;
const L1_SECTION_ADDR_MASK: u32 = 0xFFF0_0000;
const L1_PAGE_TABLE_ADDR_MASK: u32 = 0xFFFF_FC00;

const L2_TYPE_LARGE_PAGE: u32 = 0b01;
const L2_TYPE_SMALL_PAGE: u32 = 0b10;
const L2_ADDR_MASK: u32 = 0xFFFF_F000;

/// Where a terminal descriptor keeps its attributes.
struct LeafBits {
    b: u32,
    c: u32,
    xn: u32,
    ap_shift: u32,
    tex_shift: u32,
    apx: u32,
    s: u32,
    ng: u32,
}

const SECTION: LeafBits = LeafBits {
    b: 1 << 2,
    c: 1 << 3,
    xn: 1 << 4,
    ap_shift: 10,
    tex_shift: 12,
    apx: 1 << 15,
    s: 1 << 16,
    ng: 1 << 17,
};

const SMALL_PAGE: LeafBits = LeafBits {
    b: 1 << 2,
    c: 1 << 3,
    xn: 1 << 0,
    ap_shift: 4,
    tex_shift: 6,
    apx: 1 << 9,
    s: 1 << 10,
    ng: 1 << 11,
};

// AP[1:0] values; APX turns either into read-only.
const AP_PRIVILEGED: u32 = 0b01;
const AP_USER: u32 = 0b11;

impl LeafBits {
    fn encode(&self, flags: MmuFlags) -> Result<u32, EncodeError> {
        let (tex, c, b): (u32, bool, bool) = match flags.cache_policy().ok_or(EncodeError::FlagsNotAllowed)? {
            CachePolicy::Cached => (0b001, true, true),
            CachePolicy::Uncached => (0b000, false, false),
            CachePolicy::Device => (0b000, false, true),
        };

        let mut raw = tex << self.tex_shift;
        if c {
            raw |= self.c;
        }
        if b {
            raw |= self.b;
        }

        if flags.contains(MmuFlags::PERM_USER) {
            raw |= (AP_USER << self.ap_shift) | self.ng;
        } else {
            raw |= AP_PRIVILEGED << self.ap_shift;
        }
        if flags.contains(MmuFlags::PERM_RO) {
            raw |= self.apx;
        }
        if flags.contains(MmuFlags::PERM_NO_EXECUTE) {
            raw |= self.xn;
        }
        if cfg!(feature = "smp") && flags.cache_policy() == Some(CachePolicy::Cached) {
            raw |= self.s;
        }
        Ok(raw)
    }

    fn decode(&self, raw: u32) -> MmuFlags {
        let tex = (raw >> self.tex_shift) & 0b111;
        let policy = match (tex, raw & self.c != 0, raw & self.b != 0) {
            (0b000, false, false) => CachePolicy::Uncached,
            (0b000, false, true) | (0b010, false, false) => CachePolicy::Device,
            _ => CachePolicy::Cached,
        };

        let mut flags = MmuFlags::empty().with_cache_policy(policy);
        let ap = (raw >> self.ap_shift) & 0b11;
        if ap & 0b10 != 0 {
            flags |= MmuFlags::PERM_USER;
        }
        if raw & self.apx != 0 || ap == 0b10 {
            flags |= MmuFlags::PERM_RO;
        }
        if raw & self.xn != 0 {
            flags |= MmuFlags::PERM_NO_EXECUTE;
        }
        flags
    }
}

fn check_frame(frame: PhysicalAddress, align: usize) -> Result<u32, EncodeError> {
    if !frame.is_aligned(align) {
        return Err(EncodeError::Misaligned);
    }
    if frame.as_usize() as u64 >= ADDRESS_LIMIT {
        return Err(EncodeError::OutOfRange);
    }
    Ok(frame.as_usize() as u32)
}

/// Codec for ARMv7 short descriptors. Levels are [`L1`] (root) and [`L2`].
///
/// Supersections and large pages decode as [`DescriptorKind::Unsupported`] and are never
/// produced. Non-secure is a property of the table link at level 1, so a level 2 page
/// cannot carry [`MmuFlags::NS`] itself.
pub struct ShortDescriptor;

impl DescriptorCodec for ShortDescriptor {
    type Raw = u32;

    fn encode(
        level: usize,
        kind: DescriptorKind,
        frame: PhysicalAddress,
        flags: MmuFlags,
    ) -> Result<u32, EncodeError> {
        match (level, kind) {
            (_, DescriptorKind::Invalid) => Ok(0),
            (L1, DescriptorKind::Block) => {
                let mut raw = check_frame(frame, SECTION_SIZE)? | L1_TYPE_SECTION;
                raw |= SECTION.encode(flags)?;
                if flags.contains(MmuFlags::NS) {
                    raw |= L1_SECTION_NS;
                }
                Ok(raw)
            }
            (L1, DescriptorKind::Table) => {
                if !MmuFlags::NS.contains(flags) {
                    return Err(EncodeError::FlagsNotAllowed);
                }
                let mut raw = check_frame(frame, L2_TABLE_SIZE)? | L1_TYPE_PAGE_TABLE;
                if flags.contains(MmuFlags::NS) {
                    raw |= L1_PAGE_TABLE_NS;
                }
                Ok(raw)
            }
            (L2, DescriptorKind::Page) => {
                if flags.contains(MmuFlags::NS) {
                    return Err(EncodeError::FlagsNotAllowed);
                }
                Ok(check_frame(frame, PAGE_SIZE)? | L2_TYPE_SMALL_PAGE | SMALL_PAGE.encode(flags)?)
            }
            _ => Err(EncodeError::KindNotAllowed),
        }
    }

    fn decode(level: usize, raw: u32) -> Descriptor {
        match (level, raw & TYPE_MASK) {
            (_, 0b00) => Descriptor::INVALID,
            (L1, L1_TYPE_PAGE_TABLE) => Descriptor {
                kind: DescriptorKind::Table,
                frame: PhysicalAddress::new((raw & L1_PAGE_TABLE_ADDR_MASK) as usize),
                flags: if raw & L1_PAGE_TABLE_NS != 0 {
                    MmuFlags::NS
                } else {
                    MmuFlags::empty()
                },
            },
            (L1, L1_TYPE_SECTION) if raw & L1_SUPERSECTION == 0 => {
                let mut flags = SECTION.decode(raw);
                if raw & L1_SECTION_NS != 0 {
                    flags |= MmuFlags::NS;
                }
                Descriptor {
                    kind: DescriptorKind::Block,
                    frame: PhysicalAddress::new((raw & L1_SECTION_ADDR_MASK) as usize),
                    flags,
                }
            }
            (L2, L2_TYPE_LARGE_PAGE) => Descriptor {
                kind: DescriptorKind::Unsupported,
                ..Descriptor::INVALID
            },
            (L2, _) => Descriptor {
                kind: DescriptorKind::Page,
                frame: PhysicalAddress::new((raw & L2_ADDR_MASK) as usize),
                flags: SMALL_PAGE.decode(raw),
            },
            _ => Descriptor {
                kind: DescriptorKind::Unsupported,
                ..Descriptor::INVALID
            },
        }
    }
}
