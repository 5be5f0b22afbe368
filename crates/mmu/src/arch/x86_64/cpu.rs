//! Control register and TLB maintenance for the four-level layout.

use core::arch::x86_64::__cpuid_count;
use core::sync::atomic::{Ordering, compiler_fence, fence};

use ::x86_64::instructions::tlb;
use ::x86_64::registers::control::{Cr0, Cr0Flags, Cr3, Cr3Flags, Cr4, Cr4Flags};
use ::x86_64::registers::model_specific::{Efer, EferFlags};
use ::x86_64::structures::paging::PhysFrame;
use ::x86_64::{PhysAddr, VirtAddr};

use crate::arch::x86_64::AddressWidths;
use crate::{Cpu, PhysicalAddress, VirtualAddress};

const CPUID_EXTENDED_FEATURES: u32 = 7;
const SMEP: u32 = 1 << 7;
const SMAP: u32 = 1 << 20;

/// The CPU this code is running on.
pub struct X86Cpu;

impl Cpu for X86Cpu {
    fn data_barrier(&self) {
        fence(Ordering::SeqCst);
    }

    fn instruction_barrier(&self) {
        // Entry writes are visible to the walker in program order.
        compiler_fence(Ordering::SeqCst);
    }

    fn invalidate_page(&self, vaddr: VirtualAddress) {
        tlb::flush(VirtAddr::new_truncate(vaddr.as_usize() as u64));
    }

    fn invalidate_all(&self) {
        tlb::flush_all();
    }

    fn set_translation_base(&self, root: PhysicalAddress) {
        let frame = PhysFrame::containing_address(PhysAddr::new(root.as_usize() as u64));
        // SAFETY: every root built by the engine carries the kernel half, so the code
        // running here stays mapped.
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }

    fn set_user_range_enabled(&self, _enabled: bool) {
        // The lower half is reachable through whichever root CR3 holds.
    }
}

/// Enables supervisor write protection and no-execute, plus SMEP/SMAP where the CPU has
/// them, then reports the address widths.
///
/// # Safety
///
/// Must run once per CPU before the first mapping is made, with a kernel that does not
/// write read-only pages or touch user pages outside of explicit accessors.
pub unsafe fn early_init() -> AddressWidths {
    // SAFETY: caller upholds the kernel-wide preconditions above.
    unsafe {
        Cr0::update(|flags| flags.insert(Cr0Flags::WRITE_PROTECT));
        Efer::update(|flags| flags.insert(EferFlags::NO_EXECUTE_ENABLE));
    }

    let mut cr4 = Cr4Flags::empty();
    // SAFETY: CPUID is available on every x86-64 CPU.
    let max_leaf = unsafe { __cpuid_count(0, 0) }.eax;
    if max_leaf >= CPUID_EXTENDED_FEATURES {
        // SAFETY: leaf presence checked above.
        let features = unsafe { __cpuid_count(CPUID_EXTENDED_FEATURES, 0) }.ebx;
        if features & SMEP != 0 {
            cr4 |= Cr4Flags::SUPERVISOR_MODE_EXECUTION_PROTECTION;
        }
        if features & SMAP != 0 {
            cr4 |= Cr4Flags::SUPERVISOR_MODE_ACCESS_PREVENTION;
        }
    }
    // SAFETY: only features the CPU reported are enabled.
    unsafe { Cr4::update(|flags| flags.insert(cr4)) };

    let widths = AddressWidths::detect();
    log::debug!("paging features cr4 {:?} widths {:?}", cr4, widths);
    widths
}
