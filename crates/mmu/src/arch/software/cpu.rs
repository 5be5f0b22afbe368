use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::{Cpu, PhysicalAddress, VirtualAddress};

/// Something the engine asked the CPU or the page allocator to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    DescriptorWritten(PhysicalAddress),
    DataBarrier,
    InstructionBarrier,
    InvalidatePage(VirtualAddress),
    InvalidateAll,
    TranslationBase(PhysicalAddress),
    UserRange(bool),
    PageFreed(PhysicalAddress),
}

/// Shared, ordered record of [`Event`]s.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Rc<RefCell<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.borrow_mut().push(event);
    }

    /// Returns a copy of everything recorded so far.
    pub fn events(&self) -> Vec<Event> {
        self.0.borrow().clone()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }

    /// Index of the first event equal to `event`.
    pub fn position(&self, event: Event) -> Option<usize> {
        self.0.borrow().iter().position(|&recorded| recorded == event)
    }

    /// Index of the first event equal to `event` at or after `from`.
    pub fn position_after(&self, from: usize, event: Event) -> Option<usize> {
        self.0
            .borrow()
            .iter()
            .skip(from)
            .position(|&recorded| recorded == event)
            .map(|offset| from + offset)
    }
}

/// A [`Cpu`] that records maintenance instead of performing it.
#[derive(Debug, Clone, Default)]
pub struct RecordingCpu {
    log: EventLog,
}

impl RecordingCpu {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// The most recently loaded translation base, if any.
    pub fn translation_base(&self) -> Option<PhysicalAddress> {
        self.log.events().iter().rev().find_map(|event| match event {
            Event::TranslationBase(root) => Some(*root),
            _ => None,
        })
    }

    /// Whether the user range was last enabled.
    pub fn user_range_enabled(&self) -> bool {
        self.log
            .events()
            .iter()
            .rev()
            .find_map(|event| match event {
                Event::UserRange(enabled) => Some(*enabled),
                _ => None,
            })
            .unwrap_or(false)
    }
}

impl Cpu for RecordingCpu {
    fn data_barrier(&self) {
        self.log.push(Event::DataBarrier);
    }

    fn instruction_barrier(&self) {
        self.log.push(Event::InstructionBarrier);
    }

    fn invalidate_page(&self, vaddr: VirtualAddress) {
        self.log.push(Event::InvalidatePage(vaddr));
    }

    fn invalidate_all(&self) {
        self.log.push(Event::InvalidateAll);
    }

    fn set_translation_base(&self, root: PhysicalAddress) {
        self.log.push(Event::TranslationBase(root));
    }

    fn set_user_range_enabled(&self, enabled: bool) {
        self.log.push(Event::UserRange(enabled));
    }

    fn descriptor_written(&self, slot: PhysicalAddress) {
        self.log.push(Event::DescriptorWritten(slot));
    }
}
