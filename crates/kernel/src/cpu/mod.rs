//! CPU identity and NUMA topology tables.
//!
//! Topology discovery itself lives elsewhere; this module only carries
//! the identifiers and the per-node descriptor the allocator consumes.
//! The current CPU id is published per hardware thread at bring-up and
//! read constantly on the allocation fast path.

use core::{fmt, ops::Range};

use arrayvec::ArrayVec;

mod imp;

/// Upper bound on CPUs the allocator tables are sized for.
pub const NCPU: usize = 64;

/// Upper bound on NUMA nodes.
pub const MAX_NUMA_NODES: usize = 8;

/// Upper bound on disjoint memory ranges per NUMA node.
pub const MAX_NODE_MEMS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Cpuid(usize);

impl fmt::Display for Cpuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Cpuid {
    #[must_use]
    pub fn value(self) -> usize {
        self.0
    }

    #[must_use]
    pub fn from_raw(value: usize) -> Self {
        assert!(value < NCPU, "cpuid {value} out of range");
        Self(value)
    }
}

/// A NUMA node as handed over by topology discovery: read-only after
/// boot.
#[derive(Debug, Clone)]
pub struct NumaNode {
    pub id: usize,
    pub cpus: ArrayVec<Cpuid, NCPU>,
    pub mems: ArrayVec<Range<usize>, MAX_NODE_MEMS>,
}

/// Publishes the calling hardware thread's CPU id.
pub fn set_current_cpuid(cpuid: Cpuid) {
    imp::set_current(cpuid.value());
}

/// Returns the current CPU id, or `None` before [`set_current_cpuid`].
#[must_use]
pub fn try_current_cpuid() -> Option<Cpuid> {
    imp::current().map(Cpuid)
}

/// Returns the current CPU id.
///
/// # Panics
///
/// Panics before [`set_current_cpuid`] has run on this hardware thread.
#[track_caller]
#[must_use]
pub fn current_cpuid() -> Cpuid {
    try_current_cpuid().expect("current cpu is not set")
}

/// Returns the free-running cycle counter, used by the benchmark stats.
#[must_use]
pub fn cycles() -> u64 {
    imp::cycles()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpuid_roundtrip() {
        let id = Cpuid::from_raw(3);
        assert_eq!(id.value(), 3);
        assert_eq!(format!("{id}"), "3");
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn cpuid_bounds_checked() {
        let _ = Cpuid::from_raw(NCPU);
    }

    #[test]
    fn current_is_per_thread() {
        set_current_cpuid(Cpuid::from_raw(61));
        assert_eq!(current_cpuid().value(), 61);

        std::thread::spawn(|| {
            assert!(try_current_cpuid().is_none());
            set_current_cpuid(Cpuid::from_raw(62));
            assert_eq!(current_cpuid().value(), 62);
        })
        .join()
        .unwrap();

        assert_eq!(current_cpuid().value(), 61);
    }

    #[test]
    fn cycles_advance() {
        let a = cycles();
        let b = cycles();
        assert!(b >= a);
    }
}
