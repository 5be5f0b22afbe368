//! Address types for physical and virtual memory.
//!
//! Translation tables are plain memory, so the engines constantly hop between the physical
//! address stored in a descriptor and a pointer the kernel can dereference. The
//! [`AddressTranslator`] owns that conversion, both for the kernel's direct map and for the
//! emulated memory used by tests.

use core::fmt;
use core::ops::{Add, Sub};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::software::EmulatedMemory;

/// Address translator for converting between physical and virtual addresses.
///
/// - Hardware: all of physical memory is visible at a fixed offset (the direct map).
/// - Emulated: physical addresses are offsets into a host buffer.
pub enum AddressTranslator {
    /// Hardware translation using a direct-map offset.
    Hardware { direct_map_offset: usize },
    /// Emulated translation using a simulated memory region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a new hardware translator with the given direct-map offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates a new emulated translator backed by `size` bytes of zeroed memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Sets the global address translator.
    ///
    /// # Panics
    ///
    /// Panics if the translator has already been set.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                if t.get().is_some() {
                    panic!("address translator already set");
                }
                t.call_once(|| translator);
            });
        }
    }

    /// Returns a reference to the current global address translator.
    ///
    /// # Panics
    ///
    /// Panics if the translator has not been set yet.
    pub fn current() -> &'static AddressTranslator {
        match Self::try_current() {
            Some(translator) => translator,
            None => panic!(
                "address translator not set; call AddressTranslator::set_current during initialization"
            ),
        }
    }

    /// Returns the current global address translator if it has been set.
    pub fn try_current() -> Option<&'static AddressTranslator> {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR.get()
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                t.get().map(|translator| {
                    // SAFETY: each thread owns its translator, it is never replaced once set,
                    // and the thread-local outlives every borrow handed out on that thread.
                    unsafe { &*(translator as *const AddressTranslator) }
                })
            })
        }
    }

    /// Translates a physical address to a virtual address.
    pub fn phys_to_virt(&self, phys: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => phys.wrapping_add(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys) as usize,
        }
    }

    /// Translates a virtual address to a physical address.
    pub fn virt_to_phys(&self, virt: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => virt.wrapping_sub(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.ptr_to_phys(virt as *const u8),
        }
    }

    /// Translates a physical address to a typed pointer.
    pub fn phys_to_ptr<T>(&self, phys: usize) -> *mut T {
        self.phys_to_virt(phys) as *mut T
    }

    /// Returns the emulated memory behind this translator, if any.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated_memory(&self) -> Option<&EmulatedMemory> {
        match self {
            Self::Hardware { .. } => None,
            Self::Emulated(mem) => Some(mem),
        }
    }

    /// Carves a block out of emulated memory.
    ///
    /// Returns the physical address of the block, or None if the region is exhausted.
    ///
    /// # Panics
    ///
    /// Panics when called on a hardware translator.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn allocate(&self, size: usize, align: usize) -> Option<PhysicalAddress> {
        match self.emulated_memory() {
            Some(mem) => mem.allocate(size, align).map(PhysicalAddress::new),
            None => panic!("cannot allocate from hardware translator"),
        }
    }
}

/// Global address translator.
///
/// Set once during kernel initialization (with the Hardware variant). In test and
/// software-emulation builds it is thread-local so that every test owns its emulated memory.
#[cfg(not(any(test, feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

/// Generates the structure and arithmetic shared by both address types.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address.
            #[inline]
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }

            /// Adds `offset`, returning None on overflow.
            #[inline]
            pub const fn checked_add(self, offset: usize) -> Option<Self> {
                match self.0.checked_add(offset) {
                    Some(addr) => Some(Self(addr)),
                    None => None,
                }
            }

            /// Returns the offset of this address within a block of `size` bytes.
            #[inline]
            pub const fn offset_in(self, size: usize) -> usize {
                assert!(size.is_power_of_two(), "size must be a power of two");
                self.0 & (size - 1)
            }
        }

        impl fmt::Pointer for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:p}", self.0 as *const u8)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address, as stored in translation table descriptors."
);

impl PhysicalAddress {
    /// Converts a direct-mapped virtual address back to a physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address translator has not been set via [`AddressTranslator::set_current`].
    #[inline]
    pub fn from_direct_mapped(virt: VirtualAddress) -> Self {
        Self::new(AddressTranslator::current().virt_to_phys(virt.as_usize()))
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     Canonical-form checks are layout specific and live with the engines."
);

impl VirtualAddress {
    /// Returns the kernel alias of a physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address translator has not been set via [`AddressTranslator::set_current`].
    #[inline]
    pub fn direct_mapped(phys: PhysicalAddress) -> Self {
        Self::new(AddressTranslator::current().phys_to_virt(phys.as_usize()))
    }

    /// Converts the address to a pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Returns the offset within a 4 KiB page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (crate::arch::PAGE_SIZE - 1)
    }
}
