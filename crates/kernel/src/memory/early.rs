//! Boot bump allocator.
//!
//! Before the buddy allocators exist, a handful of page-sized
//! allocations are needed to get off the ground. This allocator bumps
//! through a single region handed over at entry and never frees; the
//! region is excluded from the buddy seeding later.

use core::{ops::Range, ptr::{self, NonNull}};

use super::{Align, PAGE_SIZE};
use crate::sync::spinlock::SpinMutex;

struct EarlyAllocator {
    next: usize,
    limit: usize,
}

static EARLY: SpinMutex<EarlyAllocator> = SpinMutex::new(EarlyAllocator { next: 0, limit: 0 });

/// Hands the bump allocator its region. Called once, before any
/// allocation.
pub fn init(region: Range<usize>) {
    let mut early = EARLY.lock();
    assert_eq!(early.next, 0, "early allocator already initialized");
    early.next = region.start.page_align_up();
    early.limit = region.end;
}

/// Returns the first address the bump allocator has not handed out.
///
/// Boot code removes everything below this from the memory map before
/// seeding the buddies.
#[must_use]
pub fn boundary() -> usize {
    EARLY.lock().next
}

/// Allocates one zeroed page. Only exact page-sized requests are served
/// this early.
#[must_use]
pub fn alloc_page() -> Option<NonNull<u8>> {
    let mut early = EARLY.lock();
    if early.next == 0 || early.next + PAGE_SIZE > early.limit {
        return None;
    }
    let addr = early.next;
    early.next += PAGE_SIZE;
    let page = ptr::with_exposed_provenance_mut::<u8>(addr);
    unsafe {
        ptr::write_bytes(page, 0, PAGE_SIZE);
    }
    NonNull::new(page)
}
