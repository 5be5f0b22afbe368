//! Layout-neutral view of translation table descriptors.
//!
//! Every layout stores descriptors as fixed-width integers with its own bit layout.
//! A [`DescriptorCodec`] is the only place that knows those bits; the engines walk tables in
//! terms of [`Descriptor`] values and only touch raw words when reading or writing a slot.

use core::fmt;

use crate::{EncodeError, MmuFlags, PhysicalAddress};

/// What a descriptor slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// No translation.
    Invalid,
    /// Points at the next-level table.
    Table,
    /// Terminal translation above the page level (a section or superpage).
    Block,
    /// Terminal translation for a single 4 KiB page.
    Page,
    /// A valid descriptor shape the engines do not produce, such as supersections,
    /// large pages or 1 GiB pages.
    Unsupported,
}

/// A decoded descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub kind: DescriptorKind,
    /// Output address. For [`DescriptorKind::Table`] this is the next-level table.
    pub frame: PhysicalAddress,
    /// Portable attributes. Table descriptors only report the attributes that a table
    /// descriptor can carry in the layout (user reachability, non-secure).
    pub flags: MmuFlags,
}

impl Descriptor {
    pub const INVALID: Descriptor = Descriptor {
        kind: DescriptorKind::Invalid,
        frame: PhysicalAddress::new(0),
        flags: MmuFlags::empty(),
    };

    /// Returns true for anything other than an invalid slot.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.kind != DescriptorKind::Invalid
    }

    /// Returns true for blocks and pages.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, DescriptorKind::Block | DescriptorKind::Page)
    }
}

/// Raw storage of a descriptor slot.
pub trait RawDescriptor: Copy + Eq + fmt::Debug + fmt::LowerHex {
    /// The all-zero descriptor, which is invalid in every layout.
    const ZERO: Self;
}

impl RawDescriptor for u32 {
    const ZERO: Self = 0;
}

impl RawDescriptor for u64 {
    const ZERO: Self = 0;
}

/// Converts between portable descriptors and a layout's raw bits.
///
/// Levels are numbered from the leaf upward, so level 0 is always the last table walked
/// on the four-level layout. Codecs document their own numbering.
pub trait DescriptorCodec {
    type Raw: RawDescriptor;

    /// Produces the raw bits for a descriptor, or explains why the combination cannot
    /// exist at `level`.
    ///
    /// Encoding [`DescriptorKind::Invalid`] always yields [`RawDescriptor::ZERO`].
    fn encode(
        level: usize,
        kind: DescriptorKind,
        frame: PhysicalAddress,
        flags: MmuFlags,
    ) -> Result<Self::Raw, EncodeError>;

    /// Interprets raw bits found at `level`.
    fn decode(level: usize, raw: Self::Raw) -> Descriptor;
}
