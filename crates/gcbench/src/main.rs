//! Benchmark harness for the kernel page allocator.
//!
//! Drives the in-kernel `gc` control device: configures a run, spawns
//! workers that hammer the allocator (or the file system, for the `gc`
//! workload), then reads back and prints the per-CPU statistics records.
//!
//! The wire format is the device's: a 12-byte little-endian control
//! record `(ncore, size, op)` per write, a 32-byte `gc_stat` record per
//! read.
//!
//! The device accounts each `op` to the CPU that executes the write, so
//! every worker must stay on one CPU for its alloc/free pair to land in
//! the same per-CPU record. This harness does not set thread affinity
//! itself; pin it externally (`taskset -c 0-N gcbench ...`) when the
//! per-CPU split matters.

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Write as _},
    path::{Path, PathBuf},
    process, thread,
    time::{Duration, Instant},
};

use argh::FromArgs;
use snafu::{Report, ResultExt as _, Whatever};

const CTL_RECORD_SIZE: usize = 12;
const STAT_RECORD_SIZE: usize = 32;

const OP_CONFIG: i32 = 0;
const OP_ALLOC: i32 = 1;
const OP_FREE: i32 = 2;

/// Bytes allocated per operation in the `mem` workload.
const MEM_BLOCK_SIZE: i32 = 4096;

/// Drive the kernel allocator benchmark device.
#[derive(Debug, FromArgs)]
struct Args {
    /// number of worker threads
    #[argh(positional)]
    nproc: usize,
    /// allocations per batch
    #[argh(positional)]
    batchsize: i32,
    /// workload: "gc" (file churn) or "mem" (allocator churn)
    #[argh(positional)]
    test: String,
    /// run duration in seconds
    #[argh(positional, default = "2")]
    seconds: u64,
    /// control device path
    #[argh(option, default = "PathBuf::from(\"/dev/gc\")")]
    device: PathBuf,
}

fn main() {
    let args: Args = argh::from_env();

    if let Err(err) = run(&args) {
        eprintln!("{}", Report::from_error(err));
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Whatever> {
    if args.test != "gc" && args.test != "mem" {
        snafu::whatever!("unknown workload {:?}, expected \"gc\" or \"mem\"", args.test);
    }
    println!(
        "gcbench: {} workers, batch {}, workload {}, {}s",
        args.nproc, args.batchsize, args.test, args.seconds
    );

    // One configuration write before any worker starts.
    ctl(&args.device, args.nproc as i32, args.batchsize, OP_CONFIG)
        .whatever_context("configuring the benchmark device")?;

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let errors: Vec<Whatever> = thread::scope(|scope| {
        let workers: Vec<_> = (0..args.nproc)
            .map(|worker| scope.spawn(move || child(args, worker, deadline)))
            .collect();
        workers
            .into_iter()
            .filter_map(|handle| handle.join().expect("worker panicked").err())
            .collect()
    });
    if let Some(err) = errors.into_iter().next() {
        return Err(err);
    }

    let mut device = File::open(&args.device).whatever_context("opening the stats device")?;
    for (i, stat) in read_stats(&mut device)
        .whatever_context("reading stats")?
        .iter()
        .enumerate()
    {
        let cycles_per_op = if stat.nop > 0 { stat.ncycles / stat.nop } else { 0 };
        println!(
            "{i}: ndelay {} nfree {} nrun {} ncycles {} nop {} cycles/op {cycles_per_op} nalloc {}",
            stat.ndelay, stat.nfree, stat.nrun, stat.ncycles, stat.nop, stat.nalloc
        );
    }
    Ok(())
}

/// One worker: loops its workload until the deadline.
fn child(args: &Args, worker: usize, deadline: Instant) -> Result<(), Whatever> {
    let mut ops = 0_u64;
    while Instant::now() < deadline {
        for _ in 0..10 {
            if args.test == "mem" {
                ctl(&args.device, args.nproc as i32, MEM_BLOCK_SIZE, OP_ALLOC)
                    .whatever_context("alloc batch")?;
                ctl(&args.device, args.nproc as i32, 0, OP_FREE)
                    .whatever_context("free batch")?;
            } else {
                file_churn(worker).whatever_context("file churn")?;
            }
            ops += 1;
        }
    }
    if worker == 0 {
        println!("0: {ops} loops in {}s", args.seconds);
    }
    Ok(())
}

/// Writes one control record to the device.
fn ctl(device: &Path, ncore: i32, size: i32, op: i32) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(device)?;
    file.write_all(&ctl_record(ncore, size, op))
}

/// The `gc` workload: create and unlink a scratch file.
fn file_churn(worker: usize) -> std::io::Result<()> {
    let path = std::env::temp_dir().join(format!("gcbench.{}.{worker}", process::id()));
    File::create(&path)?;
    fs::remove_file(&path)
}

fn ctl_record(ncore: i32, size: i32, op: i32) -> [u8; CTL_RECORD_SIZE] {
    let mut buf = [0; CTL_RECORD_SIZE];
    buf[0..4].copy_from_slice(&ncore.to_le_bytes());
    buf[4..8].copy_from_slice(&size.to_le_bytes());
    buf[8..12].copy_from_slice(&op.to_le_bytes());
    buf
}

/// One decoded `gc_stat` record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct GcStat {
    ndelay: i32,
    nfree: i32,
    nrun: i32,
    ncycles: u64,
    nop: u64,
    nalloc: i32,
}

fn decode_stat(buf: &[u8; STAT_RECORD_SIZE]) -> GcStat {
    GcStat {
        ndelay: i32::from_le_bytes(buf[0..4].try_into().expect("sized")),
        nfree: i32::from_le_bytes(buf[4..8].try_into().expect("sized")),
        nrun: i32::from_le_bytes(buf[8..12].try_into().expect("sized")),
        ncycles: u64::from_le_bytes(buf[12..20].try_into().expect("sized")),
        nop: u64::from_le_bytes(buf[20..28].try_into().expect("sized")),
        nalloc: i32::from_le_bytes(buf[28..32].try_into().expect("sized")),
    }
}

/// Reads stat records until EOF.
fn read_stats<R: Read>(reader: &mut R) -> std::io::Result<Vec<GcStat>> {
    let mut stats = Vec::new();
    loop {
        let mut buf = [0_u8; STAT_RECORD_SIZE];
        match reader.read(&mut buf)? {
            0 => break,
            STAT_RECORD_SIZE => stats.push(decode_stat(&buf)),
            n => {
                return Err(std::io::Error::other(format!(
                    "short stats read: {n} bytes"
                )));
            }
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctl_record_layout() {
        let buf = ctl_record(8, 1_000_000, 2);
        assert_eq!(&buf[0..4], &8_i32.to_le_bytes());
        assert_eq!(&buf[4..8], &1_000_000_i32.to_le_bytes());
        assert_eq!(&buf[8..12], &2_i32.to_le_bytes());
    }

    #[test]
    fn stat_decoding_matches_device_layout() {
        let mut buf = [0_u8; STAT_RECORD_SIZE];
        buf[0..4].copy_from_slice(&5_i32.to_le_bytes());
        buf[4..8].copy_from_slice(&6_i32.to_le_bytes());
        buf[8..12].copy_from_slice(&2_i32.to_le_bytes());
        buf[12..20].copy_from_slice(&1000_u64.to_le_bytes());
        buf[20..28].copy_from_slice(&10_u64.to_le_bytes());
        buf[28..32].copy_from_slice(&7_i32.to_le_bytes());
        let stat = decode_stat(&buf);
        assert_eq!(
            stat,
            GcStat {
                ndelay: 5,
                nfree: 6,
                nrun: 2,
                ncycles: 1000,
                nop: 10,
                nalloc: 7,
            }
        );
        assert_eq!(stat.ncycles / stat.nop, 100);
    }

    #[test]
    fn read_stats_until_eof() {
        let mut image = Vec::new();
        for n in 0..3_i32 {
            let mut buf = [0_u8; STAT_RECORD_SIZE];
            buf[28..32].copy_from_slice(&n.to_le_bytes());
            image.extend_from_slice(&buf);
        }
        let stats = read_stats(&mut image.as_slice()).unwrap();
        assert_eq!(stats.len(), 3);
        assert_eq!(stats[2].nalloc, 2);
    }
}
