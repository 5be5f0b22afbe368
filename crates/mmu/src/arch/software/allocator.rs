use crate::arch::software::{Event, EventLog};
use crate::{AddressTranslator, PageAllocator, PhysicalAddress};

/// Page allocator backed by the current thread's emulated memory.
///
/// An optional budget caps how many pages may be outstanding at once, which is how tests
/// drive the engines into their out-of-memory paths.
#[derive(Debug, Default)]
pub struct SoftwarePageAllocator {
    outstanding: usize,
    budget: Option<usize>,
    log: Option<EventLog>,
}

impl SoftwarePageAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an allocator that refuses to have more than `budget` pages outstanding.
    pub fn with_budget(budget: usize) -> Self {
        Self {
            budget: Some(budget),
            ..Self::default()
        }
    }

    /// Records every freed page into `log`.
    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Replaces the budget. None removes the cap.
    pub fn set_budget(&mut self, budget: Option<usize>) {
        self.budget = budget;
    }

    /// Pages handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

impl PageAllocator for SoftwarePageAllocator {
    fn alloc_zeroed_page(&mut self) -> Option<PhysicalAddress> {
        if self.budget.is_some_and(|budget| self.outstanding >= budget) {
            log::debug!("page budget of {:?} exhausted", self.budget);
            return None;
        }

        let memory = AddressTranslator::current().emulated_memory()?;
        let page = PhysicalAddress::new(memory.allocate_page()?);
        self.outstanding += 1;
        Some(page)
    }

    fn free_page(&mut self, page: PhysicalAddress) {
        let Some(memory) = AddressTranslator::current().emulated_memory() else {
            panic!("software page allocator used without emulated memory");
        };
        memory.free_page(page.as_usize());
        self.outstanding -= 1;

        if let Some(log) = &self.log {
            log.push(Event::PageFreed(page));
        }
    }
}
