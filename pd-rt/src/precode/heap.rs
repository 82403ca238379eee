use std::sync::{Mutex, PoisonError};

use rt_abi::PRECODE_SLOT_SIZE;
use tracing::debug;

use super::memory::PagePair;
use super::{PrecodeData, PrecodeKind};
use crate::error::RtResult;
use crate::logging::Component;

/// Slot `i` of a pair's code page reads its fields from slot `i` of the
/// data page.
struct HeapState {
    pages: Vec<PagePair>,
    next_slot: usize,
}

pub(crate) struct SlotAddrs {
    pub(crate) code: usize,
    pub(crate) data: *const PrecodeData,
}

/// Bump allocator over page pairs holding precodes of a single kind.
pub(crate) struct InterleavedHeap {
    kind: PrecodeKind,
    template: Vec<u8>,
    page_size: usize,
    slots_per_page: usize,
    state: Mutex<HeapState>,
}

impl InterleavedHeap {
    pub(crate) fn new(kind: PrecodeKind, template: Vec<u8>, page_size: usize) -> Self {
        Self {
            kind,
            template,
            page_size,
            slots_per_page: page_size / PRECODE_SLOT_SIZE,
            state: Mutex::new(HeapState {
                pages: Vec::new(),
                next_slot: 0,
            }),
        }
    }

    pub(crate) fn template(&self) -> &[u8] {
        &self.template
    }

    /// Carves the next slot and runs `init` on its data block before the
    /// slot becomes visible to `slot_data`.
    pub(crate) fn allocate(&self, init: impl FnOnce(usize, &PrecodeData)) -> RtResult<SlotAddrs> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.pages.is_empty() || state.next_slot == self.slots_per_page {
            let page = PagePair::with_template(&self.template, self.page_size)?;
            debug!(
                "{} mapped {:?} page pair at {:#x} ({} slots)",
                Component::Precode,
                self.kind,
                page.code_start(),
                self.slots_per_page
            );
            state.pages.push(page);
            state.next_slot = 0;
        }
        let slot = state.next_slot;
        state.next_slot += 1;
        let base = state.pages.last().map(PagePair::code_start).unwrap_or_default();
        let code = base + slot * PRECODE_SLOT_SIZE;
        let data = (code + self.page_size) as *const PrecodeData;
        // SAFETY: the data page stays mapped read-write until the heap drops.
        init(code, unsafe { &*data });
        Ok(SlotAddrs { code, data })
    }

    /// Returns the data block for `addr` if it is the start of an allocated
    /// slot on one of this heap's code pages.
    pub(crate) fn slot_data(&self, addr: usize) -> Option<*const PrecodeData> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let last = state.pages.len().checked_sub(1)?;
        state.pages.iter().enumerate().find_map(|(index, page)| {
            if !page.code_range().contains(&addr) {
                return None;
            }
            let offset = addr - page.code_start();
            let slot = offset / PRECODE_SLOT_SIZE;
            let allocated = if index == last {
                state.next_slot
            } else {
                self.slots_per_page
            };
            (offset % PRECODE_SLOT_SIZE == 0 && slot < allocated)
                .then_some((addr + self.page_size) as *const PrecodeData)
        })
    }

    pub(crate) fn counts(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let pages = state.pages.len();
        let allocated = match pages {
            0 => 0,
            n => (n - 1) * self.slots_per_page + state.next_slot,
        };
        (allocated, pages)
    }
}
