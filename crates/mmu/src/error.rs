use core::fmt;

/// Errors returned by the mapping engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuError {
    /// Misaligned or out-of-range addresses, a count that overflows, or flags the layout
    /// cannot express.
    InvalidArgs,
    /// The page allocator could not supply a table page.
    OutOfMemory,
    /// The queried address has no translation.
    NotFound,
}

impl fmt::Display for MmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmuError::InvalidArgs => write!(f, "invalid arguments"),
            MmuError::OutOfMemory => write!(f, "out of memory for translation tables"),
            MmuError::NotFound => write!(f, "no translation for address"),
        }
    }
}

impl core::error::Error for MmuError {}

/// Reasons a descriptor codec refuses to produce raw bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// The descriptor kind does not exist at the requested level.
    KindNotAllowed,
    /// The flags cannot be expressed by this kind of descriptor.
    FlagsNotAllowed,
    /// The frame is not aligned to the granule of the descriptor.
    Misaligned,
    /// The frame does not fit in the descriptor's address field.
    OutOfRange,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::KindNotAllowed => write!(f, "descriptor kind not allowed at this level"),
            EncodeError::FlagsNotAllowed => write!(f, "flags not expressible by descriptor"),
            EncodeError::Misaligned => write!(f, "frame misaligned for descriptor"),
            EncodeError::OutOfRange => write!(f, "frame outside descriptor address range"),
        }
    }
}

impl core::error::Error for EncodeError {}

impl From<EncodeError> for MmuError {
    fn from(_: EncodeError) -> Self {
        MmuError::InvalidArgs
    }
}
