//! Ordering of descriptor writes against the hardware table walker and the TLB.
//!
//! Every live descriptor change goes through an [`Update`]:
//!
//! ```text
//! write ─▶ WritePending ─barrier─▶ BarrierIssued ─invalidate─▶ InvalidateIssued ─▶ Done
//!                                        │                                          ▲
//!                                        └──────────── (install) ───────────────────┘
//! ```
//!
//! A slot going from invalid to valid needs no invalidation because the TLB cannot hold a
//! translation for it. Anything that removes or changes a valid translation must be
//! invalidated before the old target is reused.

use crate::{PhysicalAddress, RawDescriptor, VirtualAddress, table::TableView};

/// Cache, TLB and translation-base maintenance for the CPU the engine runs on.
///
/// Hardware implementations issue the real instructions; the software implementation in
/// [`crate::arch::software`] records them.
pub trait Cpu {
    /// Orders all earlier memory accesses (including table writes) before later ones.
    fn data_barrier(&self);

    /// Discards prefetched instructions so they observe earlier maintenance.
    fn instruction_barrier(&self);

    /// Invalidates any cached translation of the page containing `vaddr`, on every CPU
    /// sharing the tables.
    fn invalidate_page(&self, vaddr: VirtualAddress);

    /// Invalidates all non-global cached translations.
    fn invalidate_all(&self);

    /// Loads the root table used for the user (or only) translation range.
    fn set_translation_base(&self, root: PhysicalAddress);

    /// Enables or disables table walks for the user translation range.
    fn set_user_range_enabled(&self, enabled: bool);

    /// Called after a descriptor at `slot` has been written. Layouts whose walker does not
    /// snoop the data cache clean the line here.
    fn descriptor_written(&self, _slot: PhysicalAddress) {}
}

/// Progress of a single descriptor update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateState {
    WritePending,
    BarrierIssued,
    InvalidateIssued,
    Done,
}

/// Direction of a descriptor update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateKind {
    /// An invalid slot becomes valid.
    Install,
    /// A valid slot changes or becomes invalid.
    Revoke,
}

/// One descriptor write and the maintenance that must follow it.
///
/// Steps taken out of order panic.
pub(crate) struct Update<'c, C: Cpu + ?Sized> {
    cpu: &'c C,
    kind: UpdateKind,
    vaddr: VirtualAddress,
    state: Option<UpdateState>,
}

impl<'c, C: Cpu + ?Sized> Update<'c, C> {
    pub(crate) fn new(cpu: &'c C, kind: UpdateKind, vaddr: VirtualAddress) -> Self {
        Self {
            cpu,
            kind,
            vaddr,
            state: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> Option<UpdateState> {
        self.state
    }

    pub(crate) fn write<R: RawDescriptor>(&mut self, table: &TableView<R>, index: usize, raw: R) {
        assert!(
            self.state.is_none(),
            "descriptor for {} already written",
            self.vaddr
        );

        let slot = table.slot_address(index);
        #[cfg(feature = "detailed-logging")]
        log::trace!(
            "{:?} {}: slot {} {:#x} -> {:#x}",
            self.kind,
            self.vaddr,
            slot,
            table.read(index),
            raw
        );

        table.write(index, raw);
        self.cpu.descriptor_written(slot);
        self.state = Some(UpdateState::WritePending);
    }

    pub(crate) fn barrier(&mut self) {
        assert_eq!(
            self.state,
            Some(UpdateState::WritePending),
            "barrier for {} before descriptor write",
            self.vaddr
        );
        self.cpu.data_barrier();
        self.state = Some(UpdateState::BarrierIssued);
    }

    pub(crate) fn invalidate(&mut self) {
        assert_eq!(
            self.state,
            Some(UpdateState::BarrierIssued),
            "invalidation of {} before barrier",
            self.vaddr
        );
        self.cpu.invalidate_page(self.vaddr);
        self.state = Some(UpdateState::InvalidateIssued);
    }

    pub(crate) fn finish(mut self) -> UpdateState {
        match (self.kind, self.state) {
            (UpdateKind::Install, Some(UpdateState::BarrierIssued)) => {}
            (UpdateKind::Revoke, Some(UpdateState::InvalidateIssued)) => {
                self.cpu.data_barrier();
                self.cpu.instruction_barrier();
            }
            (kind, state) => panic!(
                "descriptor update for {} finished out of order: {:?} in {:?}",
                self.vaddr, kind, state
            ),
        }
        self.state = Some(UpdateState::Done);
        UpdateState::Done
    }
}

/// Writes a descriptor into a slot that held no translation.
pub(crate) fn install<C, R>(
    cpu: &C,
    table: &TableView<R>,
    index: usize,
    raw: R,
    vaddr: VirtualAddress,
) where
    C: Cpu + ?Sized,
    R: RawDescriptor,
{
    let mut update = Update::new(cpu, UpdateKind::Install, vaddr);
    update.write(table, index, raw);
    update.barrier();
    update.finish();
}

/// Links a freshly zeroed table. The leading barrier publishes the zeroed contents before
/// the walker can reach them.
pub(crate) fn link_table<C, R>(
    cpu: &C,
    table: &TableView<R>,
    index: usize,
    raw: R,
    vaddr: VirtualAddress,
) where
    C: Cpu + ?Sized,
    R: RawDescriptor,
{
    cpu.data_barrier();
    install(cpu, table, index, raw, vaddr);
}

/// Overwrites a valid descriptor and invalidates the translation it produced.
pub(crate) fn revoke<C, R>(
    cpu: &C,
    table: &TableView<R>,
    index: usize,
    raw: R,
    vaddr: VirtualAddress,
) where
    C: Cpu + ?Sized,
    R: RawDescriptor,
{
    let mut update = Update::new(cpu, UpdateKind::Revoke, vaddr);
    update.write(table, index, raw);
    update.barrier();
    update.invalidate();
    update.finish();
}

/// Clears a valid descriptor and invalidates the translation it produced.
pub(crate) fn clear<C, R>(cpu: &C, table: &TableView<R>, index: usize, vaddr: VirtualAddress)
where
    C: Cpu + ?Sized,
    R: RawDescriptor,
{
    revoke(cpu, table, index, R::ZERO, vaddr);
}
