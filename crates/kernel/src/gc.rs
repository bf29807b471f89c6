//! Allocator benchmark control/stats device.
//!
//! The `gcbench` harness drives the allocator through a byte-stream
//! device. A write carries a 12-byte control record `(ncore, size, op)`;
//! `op 0` configures the worker count and batch size, `op 1` makes the
//! calling CPU allocate a batch of `size`-byte blocks, `op 2` frees them
//! again. Reads return one 32-byte [`GcStat`] record per CPU and then
//! EOF.
//!
//! Each worker CPU keeps the blocks from its last `op 1` in a stash (a
//! pointer table allocated from the allocator under test) until the
//! matching `op 2` arrives, so the free traffic is measurable separately
//! from the allocation traffic.

use core::{
    ptr,
    ptr::NonNull,
    sync::atomic::{AtomicI32, Ordering},
};

use arrayvec::ArrayVec;
use snafu::Snafu;

use crate::{
    cpu,
    memory::{MAX_SIZE, kalloc::KernelMemory},
    sync::spinlock::SpinMutex,
};

/// Size of a control record: three little-endian `i32`s.
pub const CTL_RECORD_SIZE: usize = 12;
/// Size of one encoded [`GcStat`].
pub const STAT_RECORD_SIZE: usize = 32;

const OP_CONFIG: i32 = 0;
const OP_ALLOC: i32 = 1;
const OP_FREE: i32 = 2;

const WORD: usize = size_of::<usize>();

/// One statistics snapshot, as returned by reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStat {
    /// Blocks stashed awaiting their delayed free.
    pub ndelay: i32,
    /// Completed free operations.
    pub nfree: i32,
    /// Workers currently inside an op.
    pub nrun: i32,
    /// Cycles spent inside ops.
    pub ncycles: u64,
    /// Total operations; `ncycles / nop` is the mean cost.
    pub nop: u64,
    /// Completed allocations.
    pub nalloc: i32,
}

impl GcStat {
    #[must_use]
    pub fn encode(&self) -> [u8; STAT_RECORD_SIZE] {
        let mut buf = [0; STAT_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.ndelay.to_le_bytes());
        buf[4..8].copy_from_slice(&self.nfree.to_le_bytes());
        buf[8..12].copy_from_slice(&self.nrun.to_le_bytes());
        buf[12..20].copy_from_slice(&self.ncycles.to_le_bytes());
        buf[20..28].copy_from_slice(&self.nop.to_le_bytes());
        buf[28..32].copy_from_slice(&self.nalloc.to_le_bytes());
        buf
    }

    #[must_use]
    pub fn decode(buf: &[u8; STAT_RECORD_SIZE]) -> Self {
        Self {
            ndelay: i32::from_le_bytes(buf[0..4].try_into().expect("sized")),
            nfree: i32::from_le_bytes(buf[4..8].try_into().expect("sized")),
            nrun: i32::from_le_bytes(buf[8..12].try_into().expect("sized")),
            ncycles: u64::from_le_bytes(buf[12..20].try_into().expect("sized")),
            nop: u64::from_le_bytes(buf[20..28].try_into().expect("sized")),
            nalloc: i32::from_le_bytes(buf[28..32].try_into().expect("sized")),
        }
    }
}

/// Encodes a control record the way the harness writes it.
#[must_use]
pub fn ctl_record(ncore: i32, size: i32, op: i32) -> [u8; CTL_RECORD_SIZE] {
    let mut buf = [0; CTL_RECORD_SIZE];
    buf[0..4].copy_from_slice(&ncore.to_le_bytes());
    buf[4..8].copy_from_slice(&size.to_le_bytes());
    buf[8..12].copy_from_slice(&op.to_le_bytes());
    buf
}

#[derive(Debug, Snafu)]
pub enum GcCtlError {
    #[snafu(display("control record must be {CTL_RECORD_SIZE} bytes, got {len}"))]
    ShortRecord {
        len: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("unknown gc op {op}"))]
    UnknownOp {
        op: i32,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("gc run requested before configuration"))]
    NotConfigured {
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("all {ncore} requested workers are busy"))]
    TooManyWorkers {
        ncore: i32,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("out of memory for the block table"))]
    TableAlloc {
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

#[derive(Debug, Clone, Copy)]
struct GcConfig {
    batchsize: i32,
}

/// Per-CPU worker state: the stash of outstanding blocks plus counters.
#[derive(Debug, Default)]
struct Worker {
    /// Pointer-table address, 0 when no stash is outstanding.
    table: usize,
    table_bytes: usize,
    stash_len: usize,
    block_size: usize,
    nalloc: i32,
    nfree: i32,
    ncycles: u64,
    nop: u64,
}

/// The device: one per system, shared by every open handle.
pub struct GcDevice {
    config: SpinMutex<Option<GcConfig>>,
    nrun: AtomicI32,
    workers: ArrayVec<SpinMutex<Worker>, { cpu::NCPU }>,
}

impl GcDevice {
    #[must_use]
    pub fn new(ncpu: usize) -> Self {
        Self {
            config: SpinMutex::new(None),
            nrun: AtomicI32::new(0),
            workers: (0..ncpu).map(|_| SpinMutex::new(Worker::default())).collect(),
        }
    }

    /// Handles one control-record write on the calling CPU.
    pub fn write(&self, mem: &KernelMemory, buf: &[u8]) -> Result<usize, GcCtlError> {
        if buf.len() != CTL_RECORD_SIZE {
            return ShortRecordSnafu { len: buf.len() }.fail();
        }
        let ncore = i32::from_le_bytes(buf[0..4].try_into().expect("sized"));
        let size = i32::from_le_bytes(buf[4..8].try_into().expect("sized"));
        let op = i32::from_le_bytes(buf[8..12].try_into().expect("sized"));

        match op {
            OP_CONFIG => {
                *self.config.lock() = Some(GcConfig { batchsize: size });
            }
            OP_ALLOC => self.run_alloc(mem, ncore, size)?,
            OP_FREE => self.run_free(mem, ncore)?,
            op => return UnknownOpSnafu { op }.fail(),
        }
        Ok(CTL_RECORD_SIZE)
    }

    /// Reads the stat record at byte offset `pos`; returns 0 at EOF.
    pub fn read(&self, pos: usize, buf: &mut [u8]) -> usize {
        if buf.len() < STAT_RECORD_SIZE || !pos.is_multiple_of(STAT_RECORD_SIZE) {
            return 0;
        }
        let index = pos / STAT_RECORD_SIZE;
        let Some(worker) = self.workers.get(index) else {
            return 0;
        };
        let worker = worker.lock();
        let stat = GcStat {
            ndelay: i32::try_from(worker.stash_len).unwrap_or(i32::MAX),
            nfree: worker.nfree,
            nrun: self.nrun.load(Ordering::Relaxed),
            ncycles: worker.ncycles,
            nop: worker.nop,
            nalloc: worker.nalloc,
        };
        buf[..STAT_RECORD_SIZE].copy_from_slice(&stat.encode());
        STAT_RECORD_SIZE
    }

    fn run_alloc(&self, mem: &KernelMemory, ncore: i32, size: i32) -> Result<(), GcCtlError> {
        let batchsize = match *self.config.lock() {
            Some(config) => config.batchsize,
            None => return NotConfiguredSnafu.fail(),
        };
        let _run = RunGuard::enter(&self.nrun, ncore)?;

        let me = cpu::current_cpuid().value();
        let mut worker = self.workers[me].lock();
        if worker.table != 0 {
            // Back-to-back alloc runs: retire the old stash first.
            Self::drain(mem, &mut worker);
        }

        let size = usize::try_from(size.max(1)).expect("clamped");
        let cap = usize::min(
            usize::try_from(batchsize.max(0)).expect("clamped"),
            MAX_SIZE / WORD,
        );
        if cap == 0 {
            return Ok(());
        }
        let table_bytes = cap * WORD;
        let table = mem
            .kalloc("gcstash", table_bytes)
            .ok_or_else(|| TableAllocSnafu.build())?
            .as_ptr()
            .expose_provenance();

        let t0 = cpu::cycles();
        let mut n = 0;
        while n < cap {
            let Some(block) = mem.kalloc("gcbench", size) else {
                // Out of memory ends the batch early.
                break;
            };
            unsafe {
                ptr::with_exposed_provenance_mut::<usize>(table + n * WORD)
                    .write(block.as_ptr().expose_provenance());
            }
            n += 1;
        }
        worker.ncycles += cpu::cycles().wrapping_sub(t0);
        worker.nop += n as u64;
        worker.nalloc += i32::try_from(n).unwrap_or(i32::MAX);
        worker.table = table;
        worker.table_bytes = table_bytes;
        worker.stash_len = n;
        worker.block_size = size;
        Ok(())
    }

    fn run_free(&self, mem: &KernelMemory, ncore: i32) -> Result<(), GcCtlError> {
        let _run = RunGuard::enter(&self.nrun, ncore)?;
        let me = cpu::current_cpuid().value();
        let mut worker = self.workers[me].lock();
        Self::drain(mem, &mut worker);
        Ok(())
    }

    fn drain(mem: &KernelMemory, worker: &mut Worker) {
        if worker.table == 0 {
            return;
        }
        let t0 = cpu::cycles();
        for i in 0..worker.stash_len {
            let addr =
                unsafe { ptr::with_exposed_provenance::<usize>(worker.table + i * WORD).read() };
            let block = NonNull::new(ptr::with_exposed_provenance_mut::<u8>(addr))
                .expect("stash holds valid blocks");
            mem.kfree(block, worker.block_size);
        }
        worker.ncycles += cpu::cycles().wrapping_sub(t0);
        worker.nop += worker.stash_len as u64;
        worker.nfree += i32::try_from(worker.stash_len).unwrap_or(i32::MAX);

        let table = NonNull::new(ptr::with_exposed_provenance_mut::<u8>(worker.table))
            .expect("table is valid");
        mem.kfree(table, worker.table_bytes);
        worker.table = 0;
        worker.table_bytes = 0;
        worker.stash_len = 0;
    }
}

struct RunGuard<'a> {
    nrun: &'a AtomicI32,
}

impl<'a> RunGuard<'a> {
    fn enter(nrun: &'a AtomicI32, ncore: i32) -> Result<Self, GcCtlError> {
        let running = nrun.fetch_add(1, Ordering::AcqRel) + 1;
        if running > ncore {
            nrun.fetch_sub(1, Ordering::AcqRel);
            return TooManyWorkersSnafu { ncore }.fail();
        }
        Ok(Self { nrun })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.nrun.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Cpuid;
    use crate::memory::PAGE_SIZE;
    use crate::memory::kalloc::{MemoryConfig, testing};

    fn on_cpu(id: usize) {
        cpu::set_current_cpuid(Cpuid::from_raw(id));
    }

    fn read_stat(dev: &GcDevice, index: usize) -> GcStat {
        let mut buf = [0_u8; STAT_RECORD_SIZE];
        let n = dev.read(index * STAT_RECORD_SIZE, &mut buf);
        assert_eq!(n, STAT_RECORD_SIZE);
        GcStat::decode(&buf)
    }

    #[test]
    fn stat_record_codec() {
        let stat = GcStat {
            ndelay: 3,
            nfree: -1,
            nrun: 2,
            ncycles: 0x0102_0304_0506_0708,
            nop: 42,
            nalloc: 7,
        };
        let bytes = stat.encode();
        assert_eq!(GcStat::decode(&bytes), stat);
        // Spot-check the layout against hand-written little endian.
        assert_eq!(&bytes[0..4], &3_i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &2_i32.to_le_bytes());
        assert_eq!(bytes[12..20], 0x0102_0304_0506_0708_u64.to_le_bytes());
        assert_eq!(&bytes[28..32], &7_i32.to_le_bytes());
    }

    #[test]
    fn ctl_record_layout() {
        let buf = ctl_record(8, 1_000_000, 1);
        assert_eq!(&buf[0..4], &8_i32.to_le_bytes());
        assert_eq!(&buf[4..8], &1_000_000_i32.to_le_bytes());
        assert_eq!(&buf[8..12], &1_i32.to_le_bytes());
    }

    #[test]
    fn rejects_malformed_writes() {
        on_cpu(0);
        let mem = testing::rig(1, 128, MemoryConfig::default());
        let dev = GcDevice::new(1);

        assert!(matches!(
            dev.write(&mem, &[0; 5]),
            Err(GcCtlError::ShortRecord { len: 5, .. })
        ));
        assert!(matches!(
            dev.write(&mem, &ctl_record(1, 0, 9)),
            Err(GcCtlError::UnknownOp { op: 9, .. })
        ));
        assert!(matches!(
            dev.write(&mem, &ctl_record(1, PAGE_SIZE as i32, 1)),
            Err(GcCtlError::NotConfigured { .. })
        ));
    }

    #[test]
    fn worker_cap_is_enforced() {
        on_cpu(0);
        let mem = testing::rig(1, 128, MemoryConfig::default());
        let dev = GcDevice::new(1);
        dev.write(&mem, &ctl_record(0, 16, 0)).unwrap();
        assert!(matches!(
            dev.write(&mem, &ctl_record(0, PAGE_SIZE as i32, 1)),
            Err(GcCtlError::TooManyWorkers { ncore: 0, .. })
        ));
    }

    #[test]
    fn alloc_then_free_batch() {
        on_cpu(0);
        let mem = testing::rig(1, 512, MemoryConfig::default());
        let dev = GcDevice::new(1);
        let free_before = mem.free_pages_total();

        dev.write(&mem, &ctl_record(1, 64, 0)).unwrap();
        dev.write(&mem, &ctl_record(1, PAGE_SIZE as i32, 1)).unwrap();

        let stat = read_stat(&dev, 0);
        assert_eq!(stat.nalloc, 64);
        assert_eq!(stat.ndelay, 64);
        assert_eq!(stat.nfree, 0);
        assert_eq!(stat.nop, 64);
        assert_eq!(stat.nrun, 0);

        dev.write(&mem, &ctl_record(1, 0, 2)).unwrap();
        let stat = read_stat(&dev, 0);
        assert_eq!(stat.nfree, 64);
        assert_eq!(stat.ndelay, 0);
        assert_eq!(stat.nop, 128);

        // EOF past the last CPU record.
        let mut buf = [0_u8; STAT_RECORD_SIZE];
        assert_eq!(dev.read(STAT_RECORD_SIZE, &mut buf), 0);

        // Everything went back: pages drained from the buddies equal the
        // pages still sitting in the hot cache.
        let hot = mem.with_local_mem(|local| local.nhot);
        assert_eq!(mem.free_pages_total() + hot, free_before);
    }

    #[test]
    fn batch_stops_at_out_of_memory() {
        on_cpu(0);
        let mem = testing::rig(1, 128, MemoryConfig::default());
        let dev = GcDevice::new(1);

        // Ask for far more blocks than the arena holds.
        dev.write(&mem, &ctl_record(1, 10_000, 0)).unwrap();
        dev.write(&mem, &ctl_record(1, PAGE_SIZE as i32, 1)).unwrap();
        let stat = read_stat(&dev, 0);
        assert!(stat.nalloc > 0);
        assert!((stat.nalloc as usize) < 10_000);

        dev.write(&mem, &ctl_record(1, 0, 2)).unwrap();
        assert_eq!(read_stat(&dev, 0).ndelay, 0);
    }

    #[test]
    fn two_workers_in_parallel() {
        let mem = testing::rig(2, 1024, MemoryConfig::default());
        let dev = GcDevice::new(2);

        on_cpu(0);
        dev.write(&mem, &ctl_record(2, 100, 0)).unwrap();

        std::thread::scope(|scope| {
            for cpuid in 0..2 {
                let mem = &mem;
                let dev = &dev;
                scope.spawn(move || {
                    on_cpu(cpuid);
                    for _ in 0..3 {
                        dev.write(mem, &ctl_record(2, 2048, 1)).unwrap();
                        dev.write(mem, &ctl_record(2, 0, 2)).unwrap();
                    }
                });
            }
        });

        for index in 0..2 {
            let stat = read_stat(&dev, index);
            assert!(stat.nop > 0, "cpu {index} did no ops");
            assert_eq!(stat.nalloc, 300);
            assert_eq!(stat.nfree, 300);
            assert_eq!(stat.ndelay, 0);
            // Mean cycles per op is finite and derivable.
            let _ = stat.ncycles / stat.nop;
        }
    }
}
