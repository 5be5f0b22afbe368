//! ARMv7 CP15 maintenance for the short-descriptor layout.

use core::arch::asm;

use crate::arch::short::TTBCR_N;
use crate::{Cpu, PhysicalAddress, VirtualAddress};

/// TTBCR.PD0: translation walks through TTBR0 fault.
const TTBCR_PD0: u32 = 1 << 4;

/// Outer write-back write-allocate walks.
const TTBR_RGN_WBWA: u32 = 0b01 << 3;
/// Inner write-back write-allocate walks (IRGN[0] at bit 6, IRGN[1] at bit 0).
const TTBR_IRGN_WBWA: u32 = 1 << 6;
const TTBR_SHAREABLE: u32 = 1 << 1;
const TTBR_NOT_OUTER_SHAREABLE: u32 = 1 << 5;

const TTBR_FLAGS: u32 = if cfg!(feature = "smp") {
    TTBR_RGN_WBWA | TTBR_IRGN_WBWA | TTBR_SHAREABLE | TTBR_NOT_OUTER_SHAREABLE
} else {
    TTBR_RGN_WBWA | TTBR_IRGN_WBWA
};

fn read_ttbcr() -> u32 {
    let ttbcr: u32;
    // SAFETY: reading TTBCR has no side effects.
    unsafe { asm!("mrc p15, 0, {0}, c2, c0, 2", out(reg) ttbcr, options(nomem, nostack, preserves_flags)) };
    ttbcr
}

fn write_ttbcr(ttbcr: u32) {
    // SAFETY: callers only change N and PD0, which the engine owns.
    unsafe { asm!("mcr p15, 0, {0}, c2, c0, 2", in(reg) ttbcr, options(nostack, preserves_flags)) };
}

/// The CPU this code is running on.
pub struct ArmCpu;

impl Cpu for ArmCpu {
    fn data_barrier(&self) {
        // SAFETY: barriers have no preconditions.
        unsafe { asm!("dsb sy", options(nostack, preserves_flags)) };
    }

    fn instruction_barrier(&self) {
        // SAFETY: barriers have no preconditions.
        unsafe { asm!("isb sy", options(nostack, preserves_flags)) };
    }

    fn invalidate_page(&self, vaddr: VirtualAddress) {
        let mva = (vaddr.as_usize() as u32) & !0xFFF;
        // SAFETY: TLB and branch predictor maintenance only discards cached state.
        unsafe {
            if cfg!(feature = "smp") {
                // TLBIMVAAIS, BPIALLIS
                asm!("mcr p15, 0, {0}, c8, c3, 3", in(reg) mva, options(nostack, preserves_flags));
                asm!("mcr p15, 0, {0}, c7, c1, 6", in(reg) 0u32, options(nostack, preserves_flags));
            } else {
                // TLBIMVAA, BPIALL
                asm!("mcr p15, 0, {0}, c8, c7, 3", in(reg) mva, options(nostack, preserves_flags));
                asm!("mcr p15, 0, {0}, c7, c5, 6", in(reg) 0u32, options(nostack, preserves_flags));
            }
        }
    }

    fn invalidate_all(&self) {
        // SAFETY: TLB and branch predictor maintenance only discards cached state.
        unsafe {
            if cfg!(feature = "smp") {
                // TLBIALLIS, BPIALLIS
                asm!("mcr p15, 0, {0}, c8, c3, 0", in(reg) 0u32, options(nostack, preserves_flags));
                asm!("mcr p15, 0, {0}, c7, c1, 6", in(reg) 0u32, options(nostack, preserves_flags));
            } else {
                // TLBIALL, BPIALL
                asm!("mcr p15, 0, {0}, c8, c7, 0", in(reg) 0u32, options(nostack, preserves_flags));
                asm!("mcr p15, 0, {0}, c7, c5, 6", in(reg) 0u32, options(nostack, preserves_flags));
            }
        }
    }

    fn set_translation_base(&self, root: PhysicalAddress) {
        let ttbr0 = root.as_usize() as u32 | TTBR_FLAGS;
        // SAFETY: TTBR0 only translates the user range, which the engine owns.
        unsafe { asm!("mcr p15, 0, {0}, c2, c0, 0", in(reg) ttbr0, options(nostack, preserves_flags)) };
    }

    fn set_user_range_enabled(&self, enabled: bool) {
        let ttbcr = read_ttbcr();
        write_ttbcr(if enabled {
            ttbcr & !TTBCR_PD0
        } else {
            ttbcr | TTBCR_PD0
        });
    }
}

/// Splits translation between TTBR0 (the low user range) and TTBR1 (the kernel root) and
/// disables user walks until the first context switch.
///
/// # Safety
///
/// Must run once per CPU with the kernel root already loaded into TTBR1 and mapping
/// everything the kernel touches.
pub unsafe fn early_init() {
    let ttbcr = (read_ttbcr() & !0b111) | TTBCR_N as u32 | TTBCR_PD0;
    write_ttbcr(ttbcr);
    ArmCpu.instruction_barrier();
    ArmCpu.invalidate_all();
    ArmCpu.data_barrier();
    ArmCpu.instruction_barrier();
    log::debug!("ttbcr {:#x}", ttbcr);
}
