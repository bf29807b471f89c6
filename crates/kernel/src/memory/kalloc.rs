//! The physical page allocator front-end.
//!
//! One [`KernelMemory`] context owns every table: the locked buddy
//! allocators, the mempools, and the per-CPU descriptors. The context is
//! built once at boot and read-only afterwards except through its
//! interior locks and cells, so tests can stand up as many independent
//! instances as they like; the running kernel publishes exactly one and
//! reaches it through the free functions at the bottom of this module.
//!
//! The fast path never takes a lock: page-sized allocations and frees go
//! through a per-CPU hot-page cache guarded only by an interrupt-disable
//! scope. The cache refills from, and flushes to, the buddies named by
//! the CPU's steal order: its own share first, then the rest of its NUMA
//! node, then everyone.

use core::{
    cell::UnsafeCell,
    ptr::{self, NonNull},
    sync::atomic::{AtomicU64, Ordering},
};

use arrayvec::ArrayVec;
use buddy::{BuddyAllocator, PAGE_SHIFT, window_for};
use snafu::Snafu;
use spin::Once;

use super::{
    Align, KALLOC_HOT_PAGES, MAX_BUDDIES, MAX_SIZE, PAGE_SIZE, early,
    layout::{self, MemMapEntry, MemoryLayoutError},
    pool::{BalancePool, Balancer, Mempool},
    steal::StealOrder,
};
use crate::{
    cpu::{self, NCPU, NumaNode},
    interrupt::{self, InterruptGuard},
    sync::spinlock::SpinMutex,
};

/// Freed memory is filled with this byte, allocations are checked for it.
const FREE_POISON: u8 = 1;
/// Allocated memory is filled with this byte after the check.
const ALLOC_FILL: u8 = 2;
/// Blocks above this size are not poisoned; filling them costs more than
/// the bugs it catches.
const POISON_LIMIT: usize = 16384;

/// One buddy allocator and its lock. The window is immutable, so
/// ownership tests never touch the lock.
pub struct LockedBuddy {
    pub(crate) window: core::ops::Range<usize>,
    pub(crate) alloc: SpinMutex<BuddyAllocator>,
}

impl core::fmt::Debug for LockedBuddy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockedBuddy")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

/// Per-page metadata, carved out of physical memory at boot. The
/// allocator only sizes and places the array; reference counting belongs
/// to the layers above.
#[repr(C)]
#[derive(Debug)]
pub struct PageInfo {
    refcount: AtomicU64,
}

impl PageInfo {
    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::Relaxed)
    }
}

/// Per-CPU allocator state. Exclusively owned by its CPU and only
/// touched with interrupts disabled.
pub(crate) struct CpuMem {
    pub(crate) steal: StealOrder,
    pub(crate) mempool: usize,
    pub(crate) hot_pages: [usize; KALLOC_HOT_PAGES],
    pub(crate) nhot: usize,
}

impl CpuMem {
    fn new() -> Self {
        Self {
            steal: StealOrder::new(),
            mempool: 0,
            hot_pages: [0; KALLOC_HOT_PAGES],
            nhot: 0,
        }
    }
}

pub(crate) struct CpuMemCell(UnsafeCell<CpuMem>);

impl core::fmt::Debug for CpuMemCell {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CpuMemCell").finish_non_exhaustive()
    }
}

// Each cell is only dereferenced by its owning CPU.
unsafe impl Sync for CpuMemCell {}

impl CpuMemCell {
    fn new() -> Self {
        Self(UnsafeCell::new(CpuMem::new()))
    }

    fn get_mut(&mut self) -> &mut CpuMem {
        self.0.get_mut()
    }
}

/// Monotonic allocator event counters.
#[derive(Debug, Default)]
pub struct KallocStats {
    hot_list_refill_count: AtomicU64,
    hot_list_steal_count: AtomicU64,
    hot_list_flush_count: AtomicU64,
    hot_list_remote_free_count: AtomicU64,
    page_alloc_count: AtomicU64,
    page_free_count: AtomicU64,
    balance_move_count: AtomicU64,
}

impl KallocStats {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hot_list_refills(&self) -> u64 {
        self.hot_list_refill_count.load(Ordering::Relaxed)
    }

    pub fn hot_list_steals(&self) -> u64 {
        self.hot_list_steal_count.load(Ordering::Relaxed)
    }

    pub fn hot_list_flushes(&self) -> u64 {
        self.hot_list_flush_count.load(Ordering::Relaxed)
    }

    pub fn hot_list_remote_frees(&self) -> u64 {
        self.hot_list_remote_free_count.load(Ordering::Relaxed)
    }

    pub fn page_allocs(&self) -> u64 {
        self.page_alloc_count.load(Ordering::Relaxed)
    }

    pub fn page_frees(&self) -> u64 {
        self.page_free_count.load(Ordering::Relaxed)
    }

    pub fn balance_moves(&self) -> u64 {
        self.balance_move_count.load(Ordering::Relaxed)
    }
}

/// Boot-time configuration knobs.
#[derive(Debug, Clone, Copy)]
pub struct MemoryConfig {
    /// A donor must exceed the starved pool's free count by this many
    /// pages before the balancer moves memory.
    pub balance_margin_pages: usize,
    /// Subdivide each node into one buddy per CPU instead of one buddy
    /// per node.
    pub buddy_per_cpu: bool,
    /// Fill freed memory and verify the fill on allocation.
    pub poison: bool,
    /// First address past the kernel image; zero means "start of usable
    /// memory".
    pub kernel_end: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            balance_margin_pages: 64,
            buddy_per_cpu: true,
            poison: true,
            kernel_end: 0,
        }
    }
}

/// Pre-sized, pre-named allocation classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabId {
    Stack = 0,
    Perf = 1,
    Wq = 2,
}

#[derive(Debug, Clone, Copy)]
struct Slab {
    name: &'static str,
    order: u32,
}

const KSTACK_SIZE: usize = 4 * PAGE_SIZE;
const PERF_BUF_SIZE: usize = 16 * PAGE_SIZE;
const WQ_FRAME_SIZE: usize = 2 * PAGE_SIZE;

fn ceil_log2(n: usize) -> u32 {
    n.next_power_of_two().trailing_zeros()
}

fn prev_power_of_two(n: usize) -> usize {
    debug_assert!(n > 0);
    1 << (usize::BITS - 1 - n.leading_zeros())
}

#[derive(Debug, Snafu)]
pub enum MemoryInitError {
    #[snafu(transparent)]
    Layout { source: MemoryLayoutError },
    #[snafu(display("physical memory regions missing from the NUMA map"))]
    NumaCoverageGap {
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// The allocator context: every table, lock and counter in one place.
#[derive(Debug)]
pub struct KernelMemory {
    buddies: ArrayVec<LockedBuddy, MAX_BUDDIES>,
    mempools: ArrayVec<Mempool, MAX_BUDDIES>,
    cpu_mem: ArrayVec<CpuMemCell, NCPU>,
    balancer: Balancer,
    stats: KallocStats,
    slabs: [Slab; 3],
    page_info_array: usize,
    page_info_len: usize,
    page_info_base: usize,
    poison: bool,
}

impl KernelMemory {
    /// Builds the allocator from the decoded firmware map and the NUMA
    /// topology.
    ///
    /// The firmware map is scrubbed, the page metadata array is placed,
    /// each node's memory is claimed and split into per-CPU buddy
    /// allocators, and every CPU gets a local-first steal order. The
    /// scrubbed map must be fully claimed by the nodes; leftover memory
    /// means the NUMA tables are wrong.
    pub fn init(
        entries: &[MemMapEntry],
        nodes: &[NumaNode],
        config: MemoryConfig,
    ) -> Result<Self, MemoryInitError> {
        let mut map = layout::scrub(entries)?;
        info!("scrubbed memory map:\n{map}");
        info!("physical memory: {} MiB usable", map.bytes() >> 20);

        // Size and place the page metadata array. Putting it at the very
        // start of free memory means it only has to cover the pages that
        // follow it; if the first hole cannot hold it, fall back to
        // covering the whole address space from wherever it fits.
        let start = if config.kernel_end == 0 {
            map.base().page_align_up()
        } else {
            config.kernel_end.page_align_up()
        };
        let mut page_info_len = 1 + (map.max() - start) / (size_of::<PageInfo>() + PAGE_SIZE);
        let mut bytes = page_info_len * size_of::<PageInfo>();
        let mut array = map.alloc(start, bytes, align_of::<PageInfo>());
        let page_info_base;
        let bound;
        if array == start {
            bound = (array + bytes).page_align_up();
            page_info_base = bound;
        } else {
            info!("first memory hole too small for the page metadata array");
            page_info_len = 1 + map.max() / PAGE_SIZE;
            bytes = page_info_len * size_of::<PageInfo>();
            array = map.alloc(start, bytes, align_of::<PageInfo>());
            page_info_base = 0;
            map.remove(array..(array + bytes).page_align_up());
            bound = start;
        }
        map.remove(0..bound);

        let ncpu = nodes
            .iter()
            .flat_map(|node| node.cpus.iter())
            .map(|cpu| cpu.value() + 1)
            .max()
            .unwrap_or(0);
        let mut cpu_mem: ArrayVec<CpuMemCell, NCPU> =
            (0..ncpu).map(|_| CpuMemCell::new()).collect();

        let mut buddies: ArrayVec<LockedBuddy, MAX_BUDDIES> = ArrayVec::new();
        let mut mempools: ArrayVec<Mempool, MAX_BUDDIES> = ArrayVec::new();

        for node in nodes {
            // The memory this node may claim: its declared ranges
            // restricted to what is actually usable, then taken off the
            // global map so no other node can double-claim it.
            let mut node_mem = layout::BootMap::new();
            for mem in &node.mems {
                node_mem.add(mem.clone());
            }
            node_mem.intersect(&map);
            map.remove_map(&node_mem);

            let subnodes = if config.buddy_per_cpu {
                usize::max(node.cpus.len(), 1)
            } else {
                1
            };
            let size_limit = usize::max(node_mem.bytes().div_ceil(subnodes), PAGE_SIZE);

            let node_low = buddies.len();
            for region in node_mem.iter() {
                if config.poison {
                    unsafe {
                        ptr::write_bytes(
                            ptr::with_exposed_provenance_mut::<u8>(region.start),
                            FREE_POISON,
                            region.len(),
                        );
                    }
                }
                let (win_base, win_size) = window_for(region.clone());
                let mut base = region.start;
                while base < region.end {
                    let subsize = usize::min(region.end - base, size_limit);
                    let alloc = unsafe { BuddyAllocator::new(base, subsize, win_base, win_size) };
                    if !alloc.is_empty() {
                        let free = alloc.free_pages();
                        buddies.push(LockedBuddy {
                            window: win_base..win_base + win_size,
                            alloc: SpinMutex::new(alloc),
                        });
                        mempools.push(Mempool::new(
                            buddies.len() - 1,
                            base,
                            subsize,
                            node.id,
                            free,
                        ));
                    }
                    base += subsize;
                }
            }
            let node_buddies = buddies.len() - node_low;
            if node_buddies == 0 {
                continue;
            }

            // Divvy the node's buddies up between its CPUs. With more
            // CPUs than buddies the shares overlap by one.
            for (cpu_index, cpuid) in node.cpus.iter().enumerate() {
                let mem = cpu_mem[cpuid.value()].get_mut();
                let low = node_low + cpu_index * node_buddies / node.cpus.len();
                let mut high = node_low + (cpu_index + 1) * node_buddies / node.cpus.len();
                if low == high {
                    high += 1;
                }
                assert!(high <= node_low + node_buddies);
                mem.steal.add(low, high);
                mem.steal.add(node_low, node_low + node_buddies);
                mem.mempool = low;
                mem.nhot = 0;
            }
        }

        // Finally, any CPU may steal from any buddy.
        for cell in &mut cpu_mem {
            cell.get_mut().steal.add(0, buddies.len());
        }

        if !map.is_empty() {
            return NumaCoverageGapSnafu.fail();
        }

        let this = Self {
            buddies,
            mempools,
            cpu_mem,
            balancer: Balancer::new(config.balance_margin_pages),
            stats: KallocStats::default(),
            slabs: [
                Slab {
                    name: "kstack",
                    order: ceil_log2(KSTACK_SIZE),
                },
                Slab {
                    name: "kperf",
                    order: ceil_log2(PERF_BUF_SIZE),
                },
                Slab {
                    name: "wq",
                    order: ceil_log2(WQ_FRAME_SIZE),
                },
            ],
            page_info_array: array,
            page_info_len,
            page_info_base,
            poison: config.poison,
        };
        info!(
            "kalloc: {} buddies, {} free pages, {} page_info entries",
            this.buddies.len(),
            this.free_pages_total(),
            this.page_info_len
        );
        Ok(this)
    }

    pub fn stats(&self) -> &KallocStats {
        &self.stats
    }

    /// Sum of free pages across every buddy.
    pub fn free_pages_total(&self) -> usize {
        self.buddies
            .iter()
            .map(|lb| lb.alloc.lock().free_pages())
            .sum()
    }

    /// Metadata entry for the page frame containing `addr`, if tracked.
    pub fn page_info(&self, addr: usize) -> Option<&PageInfo> {
        let index = addr.checked_sub(self.page_info_base)? >> PAGE_SHIFT;
        if index >= self.page_info_len {
            return None;
        }
        let entry = self.page_info_array + index * size_of::<PageInfo>();
        unsafe { ptr::with_exposed_provenance::<PageInfo>(entry).as_ref() }
    }

    /// Allocates `size` bytes, aligned to the next power-of-two size.
    /// `name` is an opaque trace label. Returns `None` when the steal
    /// order is exhausted and balancing could not help.
    pub fn kalloc(&self, name: &str, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(size > 0);
        if size > MAX_SIZE {
            return None;
        }
        let addr = if size == PAGE_SIZE {
            self.page_alloc()
        } else {
            self.general_alloc(size)
        };
        match addr {
            Some(addr) => {
                self.check_poison(name, addr, size);
                trace!("kalloc {name}: {size:#x} bytes at {addr:#x}");
                NonNull::new(ptr::with_exposed_provenance_mut(addr))
            }
            None => {
                warn!("kalloc {name}: out of memory ({size:#x} bytes)");
                None
            }
        }
    }

    /// Frees memory previously returned by [`kalloc`](Self::kalloc) at
    /// the same size.
    ///
    /// # Panics
    ///
    /// Panics if no buddy window contains the pointer.
    pub fn kfree(&self, ptr: NonNull<u8>, size: usize) {
        debug_assert!(size > 0 && size <= MAX_SIZE);
        let addr = ptr.as_ptr().expose_provenance();
        if self.poison && size <= POISON_LIMIT {
            // Fill with junk to catch dangling references.
            unsafe {
                ptr::write_bytes(ptr.as_ptr(), FREE_POISON, size);
            }
        }
        if size == PAGE_SIZE {
            self.page_free(addr);
        } else {
            self.pool_free(addr, size);
        }
    }

    /// Allocates one of the preconfigured slab sizes.
    pub fn ksalloc(&self, slab: SlabId) -> Option<NonNull<u8>> {
        let slab = self.slabs[slab as usize];
        self.kalloc(slab.name, 1 << slab.order)
    }

    /// Frees an allocation made with [`ksalloc`](Self::ksalloc).
    pub fn ksfree(&self, slab: SlabId, ptr: NonNull<u8>) {
        let slab = self.slabs[slab as usize];
        self.kfree(ptr, 1 << slab.order);
    }

    /// Page allocation fast path: pop from the hot cache, refilling it
    /// to half capacity along the steal order when empty.
    fn page_alloc(&self) -> Option<usize> {
        {
            let cli = interrupt::push_disabled();
            let mem = unsafe { self.local_mem(&cli) };
            let CpuMem {
                ref steal,
                ref mut hot_pages,
                ref mut nhot,
                ..
            } = *mem;

            if *nhot == 0 {
                KallocStats::inc(&self.stats.hot_list_refill_count);
                for idx in steal.iter() {
                    if *nhot >= KALLOC_HOT_PAGES / 2 {
                        break;
                    }
                    if !steal.is_local(idx) {
                        KallocStats::inc(&self.stats.hot_list_steal_count);
                    }
                    let mut alloc = self.buddies[idx].alloc.lock();
                    while *nhot < KALLOC_HOT_PAGES / 2 {
                        match alloc.alloc(PAGE_SIZE) {
                            Some(page) => {
                                hot_pages[*nhot] = page;
                                *nhot += 1;
                            }
                            None => break,
                        }
                    }
                }
            }
            if *nhot > 0 {
                *nhot -= 1;
                let page = hot_pages[*nhot];
                KallocStats::inc(&self.stats.page_alloc_count);
                return Some(page);
            }
        }
        // No buddy produced a single page; the general path retries and
        // can trigger the balancer.
        self.general_alloc(PAGE_SIZE)
    }

    /// Page free fast path: push onto the hot cache, flushing the older
    /// half back to the buddies when full.
    fn page_free(&self, addr: usize) {
        let cli = interrupt::push_disabled();
        let mem = unsafe { self.local_mem(&cli) };
        let CpuMem {
            ref steal,
            ref mut hot_pages,
            ref mut nhot,
            ..
        } = *mem;

        if *nhot == KALLOC_HOT_PAGES {
            KallocStats::inc(&self.stats.hot_list_flush_count);
            // Sort the half being flushed so runs of pages landing in
            // the same buddy share one lock acquisition.
            hot_pages[..KALLOC_HOT_PAGES / 2].sort_unstable();
            let mut held: Option<(usize, crate::sync::spinlock::SpinMutexGuard<'_, BuddyAllocator>)> =
                None;
            for i in 0..KALLOC_HOT_PAGES / 2 {
                let page = hot_pages[i];
                let matches = held
                    .as_ref()
                    .is_some_and(|(idx, _)| self.buddies[*idx].window.contains(&page));
                if !matches {
                    // Release before searching; at most one buddy lock
                    // is ever held.
                    held = None;
                    let idx = steal
                        .iter()
                        .find(|&idx| self.buddies[idx].window.contains(&page))
                        .unwrap_or_else(|| {
                            panic!("kfree: pointer {page:#x} is not in an allocated region")
                        });
                    if !steal.is_local(idx) {
                        KallocStats::inc(&self.stats.hot_list_remote_free_count);
                    }
                    held = Some((idx, self.buddies[idx].alloc.lock()));
                }
                let (_, alloc) = held.as_mut().expect("buddy lock held");
                unsafe {
                    alloc.free(page, PAGE_SIZE);
                }
            }
            drop(held);
            hot_pages.copy_within(KALLOC_HOT_PAGES / 2.., 0);
            *nhot = KALLOC_HOT_PAGES - KALLOC_HOT_PAGES / 2;
        }

        hot_pages[*nhot] = addr;
        *nhot += 1;
        KallocStats::inc(&self.stats.page_free_count);
        cli.pop();
    }

    /// General path: walk the steal order, then rebalance toward the
    /// local pool and retry it once.
    fn general_alloc(&self, size: usize) -> Option<usize> {
        let cli = interrupt::push_disabled();
        let mem = unsafe { self.local_mem(&cli) };
        for idx in mem.steal.iter() {
            if let Some(addr) = self.buddies[idx].alloc.lock().alloc(size) {
                return Some(addr);
            }
        }
        let pool = mem.mempool;
        if self.rebalance_to(pool) {
            KallocStats::inc(&self.stats.balance_move_count);
            let buddy = self.mempools[pool].buddy;
            if let Some(addr) = self.buddies[buddy].alloc.lock().alloc(size) {
                return Some(addr);
            }
        }
        None
    }

    /// Returns memory to the first buddy in steal order whose window
    /// contains it. Overlapping windows are intentional (donated blocks);
    /// steal order makes the resolution deterministic.
    fn pool_free(&self, addr: usize, size: usize) {
        let cli = interrupt::push_disabled();
        let mem = unsafe { self.local_mem(&cli) };
        for idx in mem.steal.iter() {
            if self.buddies[idx].window.contains(&addr) {
                unsafe {
                    self.buddies[idx].alloc.lock().free(addr, size);
                }
                return;
            }
        }
        panic!("kfree: pointer {addr:#x} is not in an allocated region");
    }

    pub(crate) fn rebalance_to(&self, pool: usize) -> bool {
        let recipient = PoolRef {
            mem: self,
            index: pool,
        };
        let donors = (0..self.mempools.len()).map(|index| PoolRef { mem: self, index });
        self.balancer.rebalance(&recipient, donors)
    }

    fn check_poison(&self, name: &str, addr: usize, size: usize) {
        if !self.poison || size > POISON_LIMIT {
            return;
        }
        let bytes = unsafe {
            core::slice::from_raw_parts(ptr::with_exposed_provenance::<u8>(addr), size)
        };
        for (i, &byte) in bytes.iter().enumerate() {
            // The first two words of each page hold free-list links.
            if (addr + i) % PAGE_SIZE < 2 * size_of::<usize>() {
                continue;
            }
            if byte != FREE_POISON {
                let window = &bytes[i..usize::min(i + 16, size)];
                panic!(
                    "kalloc {name}: free memory was overwritten at {addr:#x}+{i:#x}: {window:02x?}"
                );
            }
        }
        unsafe {
            ptr::write_bytes(ptr::with_exposed_provenance_mut::<u8>(addr), ALLOC_FILL, size);
        }
    }

    /// Per-CPU state of the calling CPU.
    ///
    /// # Safety
    ///
    /// The caller must be on the owning CPU with interrupts disabled
    /// (witnessed by the guard) and must not create a second live
    /// reference to the same `CpuMem`.
    #[expect(clippy::mut_from_ref)]
    unsafe fn local_mem<'a>(&'a self, _cli: &'a InterruptGuard) -> &'a mut CpuMem {
        let cell = &self.cpu_mem[cpu::current_cpuid().value()];
        unsafe { &mut *cell.0.get() }
    }

    /// Dumps per-buddy free counts for every CPU's local buddies.
    pub fn kmemprint(&self) {
        for (cpuid, cell) in self.cpu_mem.iter().enumerate() {
            // Steal orders are frozen after init; reading another CPU's
            // is fine.
            let mem = unsafe { &*cell.0.get() };
            print!("cpu {cpuid}:");
            let local = mem.steal.get_local();
            for idx in local.low..local.high {
                let stats = self.buddies[idx].alloc.lock().stats();
                print!(" {idx}:[");
                for nfree in stats.nfree {
                    print!("{nfree} ");
                }
                print!("free {}]", stats.free);
            }
            println!();
        }
    }

    #[cfg(test)]
    pub(crate) fn buddy(&self, index: usize) -> &LockedBuddy {
        &self.buddies[index]
    }

    #[cfg(test)]
    pub(crate) fn buddy_count(&self) -> usize {
        self.buddies.len()
    }

    #[cfg(test)]
    pub(crate) fn mempool(&self, index: usize) -> &Mempool {
        &self.mempools[index]
    }

    #[cfg(test)]
    pub(crate) fn with_local_mem<R>(&self, f: impl FnOnce(&mut CpuMem) -> R) -> R {
        let cli = interrupt::push_disabled();
        let mem = unsafe { self.local_mem(&cli) };
        f(mem)
    }
}

/// A pool-table view implementing the balancer's capability interface.
#[derive(Clone, Copy)]
pub(crate) struct PoolRef<'a> {
    mem: &'a KernelMemory,
    index: usize,
}

impl BalancePool for PoolRef<'_> {
    fn pool_id(&self) -> usize {
        self.index
    }

    fn advisory_count(&self) -> usize {
        self.mem.mempools[self.index].cached_free()
    }

    fn balance_count(&self) -> usize {
        let pool = &self.mem.mempools[self.index];
        let free = self.mem.buddies[pool.buddy].alloc.lock().free_pages();
        pool.set_cached_free(free);
        free
    }

    fn can_donate_to(&self, target: &Self) -> bool {
        let donor = &self.mem.buddies[self.mem.mempools[self.index].buddy].window;
        let recipient = &self.mem.buddies[self.mem.mempools[target.index].buddy].window;
        recipient.start <= donor.start && donor.end <= recipient.end
    }

    fn locality(&self, other: &Self) -> usize {
        usize::from(self.mem.mempools[self.index].node != self.mem.mempools[other.index].node)
    }

    fn balance_move_to(&self, target: &Self) {
        let avail = self.balance_count();
        let mut bytes = usize::min(avail.saturating_mul(PAGE_SIZE) / 2, MAX_SIZE);
        if bytes < PAGE_SIZE {
            return;
        }
        // Round down so the donor-side allocation never rounds above the
        // budget.
        bytes = prev_power_of_two(bytes);

        let donor_buddy = self.mem.mempools[self.index].buddy;
        let block = self.mem.buddies[donor_buddy].alloc.lock().alloc(bytes);
        let Some(addr) = block else {
            // Free memory too fragmented to move as one block.
            return;
        };
        let target_buddy = self.mem.mempools[target.index].buddy;
        let lb = &self.mem.buddies[target_buddy];
        debug_assert!(lb.window.contains(&addr));
        unsafe {
            lb.alloc.lock().free(addr, bytes);
        }
        self.balance_count();
        target.balance_count();
        trace!(
            "balance: moved {bytes:#x} bytes at {addr:#x} from pool {} to pool {}",
            self.index, target.index
        );
    }
}

static KALLOC: Once<KernelMemory> = Once::new();

/// Boot initialization; called once. Memory already handed out by the
/// early bump allocator is excluded from the buddies.
pub fn initkalloc(
    entries: &[MemMapEntry],
    nodes: &[NumaNode],
    mut config: MemoryConfig,
) -> Result<(), MemoryInitError> {
    let boundary = early::boundary();
    if boundary != 0 {
        config.kernel_end = boundary;
    }
    let mem = KernelMemory::init(entries, nodes, config)?;
    KALLOC.call_once(|| mem);
    Ok(())
}

/// Returns the published allocator context, if boot has run.
pub fn kernel_memory() -> Option<&'static KernelMemory> {
    KALLOC.get()
}

/// Allocates `size` bytes aligned to the next power-of-two size.
///
/// Before [`initkalloc`] only exact page-sized requests are served, from
/// the boot bump allocator.
pub fn kalloc(name: &str, size: usize) -> Option<NonNull<u8>> {
    match KALLOC.get() {
        Some(mem) => mem.kalloc(name, size),
        None => {
            assert_eq!(size, PAGE_SIZE, "early allocator only serves single pages");
            early::alloc_page()
        }
    }
}

/// Frees memory returned by [`kalloc`] at the same size.
pub fn kfree(ptr: NonNull<u8>, size: usize) {
    KALLOC
        .get()
        .expect("kfree before initkalloc")
        .kfree(ptr, size);
}

/// Allocates one of the preconfigured slab sizes.
pub fn ksalloc(slab: SlabId) -> Option<NonNull<u8>> {
    KALLOC.get().expect("ksalloc before initkalloc").ksalloc(slab)
}

/// Frees an allocation made with [`ksalloc`].
pub fn ksfree(slab: SlabId, ptr: NonNull<u8>) {
    KALLOC
        .get()
        .expect("ksfree before initkalloc")
        .ksfree(slab, ptr);
}

/// Dumps per-buddy free counts to the console.
pub fn kmemprint() {
    if let Some(mem) = KALLOC.get() {
        mem.kmemprint();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::alloc::Layout;
    use std::ops::Range;

    use super::*;
    use crate::cpu::Cpuid;
    use crate::memory::layout::EntryKind;

    /// A leaked page-aligned arena standing in for physical memory.
    pub(crate) fn leak_arena(pages: usize) -> Range<usize> {
        let size = pages * PAGE_SIZE;
        let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
        let base = unsafe { std::alloc::alloc(layout) };
        assert!(!base.is_null());
        let base = base.expose_provenance();
        base..base + size
    }

    pub(crate) fn usable(region: &Range<usize>) -> MemMapEntry {
        MemMapEntry {
            base: region.start,
            length: region.len(),
            kind: EntryKind::Usable,
        }
    }

    pub(crate) fn one_node(cpus: usize, mem: Range<usize>) -> NumaNode {
        NumaNode {
            id: 0,
            cpus: (0..cpus).map(Cpuid::from_raw).collect(),
            mems: [mem].into_iter().collect(),
        }
    }

    pub(crate) fn rig(cpus: usize, pages: usize, config: MemoryConfig) -> KernelMemory {
        let arena = leak_arena(pages);
        let entries = [usable(&arena)];
        let nodes = [one_node(cpus, arena.clone())];
        let config = MemoryConfig {
            kernel_end: arena.start,
            ..config
        };
        KernelMemory::init(&entries, &nodes, config).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::cpu::Cpuid;

    fn on_cpu(id: usize) {
        cpu::set_current_cpuid(Cpuid::from_raw(id));
    }

    fn single_buddy_config() -> MemoryConfig {
        MemoryConfig {
            buddy_per_cpu: false,
            ..MemoryConfig::default()
        }
    }

    #[test]
    fn boot_single_node_two_cpus() {
        on_cpu(0);
        let mem = rig(2, 512, single_buddy_config());

        assert_eq!(mem.buddy_count(), 1);
        // Both CPUs see the single buddy as local and start with an
        // empty hot cache.
        for cpu in 0..2 {
            let cell = unsafe { &*mem.cpu_mem[cpu].0.get() };
            let local = cell.steal.get_local();
            assert_eq!((local.low, local.high), (0, 1));
            assert_eq!(cell.nhot, 0);
            assert_eq!(cell.steal.iter().collect::<Vec<_>>(), vec![0]);
        }

        // The page metadata array and buddy bitmaps cost a bounded
        // overhead; everything else is free.
        let free = mem.free_pages_total();
        let overhead_pages = 512 - free;
        assert!(free > 0);
        assert!(overhead_pages < 16, "overhead {overhead_pages} pages");

        mem.kmemprint();
    }

    #[test]
    fn hot_cache_is_lifo() {
        on_cpu(0);
        let mem = rig(1, 256, single_buddy_config());

        let p = mem.kalloc("t", PAGE_SIZE).unwrap();
        mem.kfree(p, PAGE_SIZE);
        let p2 = mem.kalloc("t", PAGE_SIZE).unwrap();
        assert_eq!(p, p2);
        mem.kfree(p2, PAGE_SIZE);
    }

    #[test]
    fn hot_cache_overflow_flushes_half() {
        on_cpu(1);
        let mem = rig(2, 512, single_buddy_config());

        // Take pages straight from the buddy so the hot cache stays
        // empty and deterministic.
        let mut pages = Vec::new();
        {
            let mut alloc = mem.buddy(0).alloc.lock();
            for _ in 0..KALLOC_HOT_PAGES + 1 {
                pages.push(alloc.alloc(PAGE_SIZE).unwrap());
            }
        }
        let free_after_drain = mem.free_pages_total();

        for &page in &pages {
            mem.kfree(NonNull::new(ptr::with_exposed_provenance_mut(page)).unwrap(), PAGE_SIZE);
        }

        assert_eq!(mem.stats().hot_list_flushes(), 1);
        // Exactly half the cache reached the buddy; the rest (plus the
        // overflowing page) is still hot.
        assert_eq!(
            mem.free_pages_total(),
            free_after_drain + KALLOC_HOT_PAGES / 2
        );
        mem.with_local_mem(|local| {
            assert_eq!(local.nhot, KALLOC_HOT_PAGES / 2 + 1);
        });
    }

    #[test]
    fn refill_steals_from_the_next_buddy() {
        on_cpu(0);
        let mem = rig(2, 512, MemoryConfig::default());
        assert_eq!(mem.buddy_count(), 2);

        // CPU 0's local buddy runs dry.
        {
            let mut alloc = mem.buddy(0).alloc.lock();
            while alloc.alloc(PAGE_SIZE).is_some() {}
        }

        let p = mem.kalloc("t", PAGE_SIZE).unwrap();
        let addr = p.as_ptr().expose_provenance();
        assert!(
            mem.mempool(1).local_range().contains(&addr),
            "page should come from the remote pool"
        );
        assert_eq!(mem.stats().hot_list_steals(), 1);
        assert_eq!(mem.stats().hot_list_refills(), 1);

        // The cache is warm now; no further refill, no further steal.
        let p2 = mem.kalloc("t", PAGE_SIZE).unwrap();
        assert_eq!(mem.stats().hot_list_steals(), 1);
        mem.kfree(p2, PAGE_SIZE);
        mem.kfree(p, PAGE_SIZE);
    }

    #[test]
    fn general_path_round_trips() {
        on_cpu(0);
        let mem = rig(1, 512, single_buddy_config());
        let free = mem.free_pages_total();

        let a = mem.kalloc("a", 8 * PAGE_SIZE).unwrap();
        let b = mem.kalloc("b", 3 * PAGE_SIZE).unwrap();
        assert_eq!(a.as_ptr().expose_provenance() % (8 * PAGE_SIZE), 0);
        assert_eq!(b.as_ptr().expose_provenance() % (4 * PAGE_SIZE), 0);
        assert_eq!(mem.free_pages_total(), free - 12);

        mem.kfree(a, 8 * PAGE_SIZE);
        mem.kfree(b, 3 * PAGE_SIZE);
        assert_eq!(mem.free_pages_total(), free);
    }

    #[test]
    fn oversized_allocation_fails_cleanly() {
        on_cpu(0);
        let mem = rig(1, 64, single_buddy_config());
        assert!(mem.kalloc("big", MAX_SIZE + 1).is_none());
        // Larger than every buddy but below MAX_SIZE: walks and fails.
        assert!(mem.kalloc("big", MAX_SIZE).is_none());
    }

    #[test]
    fn slabs_have_fixed_orders() {
        on_cpu(0);
        let mem = rig(1, 256, single_buddy_config());
        let stack = mem.ksalloc(SlabId::Stack).unwrap();
        assert_eq!(stack.as_ptr().expose_provenance() % KSTACK_SIZE, 0);
        mem.ksfree(SlabId::Stack, stack);

        let wq = mem.ksalloc(SlabId::Wq).unwrap();
        mem.ksfree(SlabId::Wq, wq);
    }

    #[test]
    #[should_panic(expected = "not in an allocated region")]
    fn free_of_unknown_pointer_is_fatal() {
        on_cpu(2);
        let mem = rig(3, 64, MemoryConfig {
            poison: false,
            ..MemoryConfig::default()
        });
        let bogus = NonNull::new(ptr::with_exposed_provenance_mut::<u8>(0x20_0000)).unwrap();
        mem.kfree(bogus, 2 * PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "free memory was overwritten")]
    fn poison_catches_use_after_free() {
        on_cpu(0);
        let mem = rig(1, 128, single_buddy_config());
        let p = mem.kalloc("t", 2 * PAGE_SIZE).unwrap();
        mem.kfree(p, 2 * PAGE_SIZE);
        // Dangling write, well past the free-list links.
        unsafe {
            p.as_ptr().add(64).write(0xAB);
        }
        let _ = mem.kalloc("t", 2 * PAGE_SIZE);
    }

    #[test]
    fn balancer_moves_memory_between_pools() {
        on_cpu(0);
        let mem = rig(2, 512, MemoryConfig {
            balance_margin_pages: 8,
            ..MemoryConfig::default()
        });
        assert_eq!(mem.buddy_count(), 2);

        // Starve pool 0.
        let mut held = Vec::new();
        {
            let mut alloc = mem.buddy(0).alloc.lock();
            while let Some(p) = alloc.alloc(PAGE_SIZE) {
                held.push(p);
            }
        }
        let donor_before = mem.buddy(1).alloc.lock().free_pages();

        assert!(mem.rebalance_to(0));
        let recipient_after = mem.buddy(0).alloc.lock().free_pages();
        let donor_after = mem.buddy(1).alloc.lock().free_pages();
        assert!(recipient_after > 0);
        assert_eq!(donor_before - donor_after, recipient_after);
        // The donation is real memory movement: the recipient can hand
        // the donated pages out.
        let p = mem.buddy(0).alloc.lock().alloc(PAGE_SIZE).unwrap();
        assert!(mem.buddy(0).window.contains(&p));
    }

    #[test]
    fn nodes_cannot_double_claim() {
        on_cpu(0);
        let arena = leak_arena(256);
        let entries = [usable(&arena)];
        // Both nodes claim the same range; the second finds it gone.
        let mid = arena.start + 128 * PAGE_SIZE;
        let nodes = [
            one_node(1, arena.start..mid),
            NumaNode {
                id: 1,
                cpus: [Cpuid::from_raw(1)].into_iter().collect(),
                mems: [arena.start..arena.end].into_iter().collect(),
            },
        ];
        let mem = KernelMemory::init(&entries, &nodes, MemoryConfig {
            kernel_end: arena.start,
            buddy_per_cpu: false,
            ..MemoryConfig::default()
        })
        .unwrap();
        assert_eq!(mem.buddy_count(), 2);
        assert_eq!(mem.mempool(0).node, 0);
        assert_eq!(mem.mempool(1).node, 1);
    }

    #[test]
    fn uncovered_memory_is_a_boot_error() {
        let arena = leak_arena(64);
        let entries = [usable(&arena)];
        // The node only claims half; the rest has no owner.
        let mid = arena.start + 32 * PAGE_SIZE;
        let nodes = [one_node(1, arena.start..mid)];
        let err = KernelMemory::init(&entries, &nodes, MemoryConfig {
            kernel_end: arena.start,
            ..MemoryConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, MemoryInitError::NumaCoverageGap { .. }));
    }

    #[test]
    fn global_boot_path() {
        on_cpu(3);
        let arena = leak_arena(512);

        // Pre-init allocations come from the boot bump allocator and
        // are page-sized only.
        early::init(arena.start..arena.start + 16 * PAGE_SIZE);
        let a = kalloc("early", PAGE_SIZE).unwrap();
        let b = kalloc("early", PAGE_SIZE).unwrap();
        assert_ne!(a, b);

        let entries = [usable(&arena)];
        let nodes = [one_node(4, arena.clone())];
        initkalloc(&entries, &nodes, MemoryConfig {
            buddy_per_cpu: false,
            ..MemoryConfig::default()
        })
        .unwrap();

        // The bump-allocated pages are excluded from the buddies.
        let boundary = early::boundary();
        assert!(boundary >= arena.start + 2 * PAGE_SIZE);
        let p = kalloc("late", PAGE_SIZE).unwrap();
        assert!(p.as_ptr().expose_provenance() >= boundary);
        kfree(p, PAGE_SIZE);

        let s = ksalloc(SlabId::Stack).unwrap();
        ksfree(SlabId::Stack, s);
        kmemprint();
        assert!(kernel_memory().is_some());
    }
}
