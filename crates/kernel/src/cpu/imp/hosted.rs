//! Host-side stand-in for the per-hardware-thread identity registers.
//!
//! Tests simulate CPUs with threads; each sets its own id. The cycle
//! counter degrades to a monotonic nanosecond clock.

#[cfg(test)]
std::thread_local! {
    static CURRENT: core::cell::Cell<Option<usize>> = const { core::cell::Cell::new(None) };
}

#[cfg(test)]
pub fn set_current(cpuid: usize) {
    CURRENT.set(Some(cpuid));
}

#[cfg(test)]
pub fn current() -> Option<usize> {
    CURRENT.get()
}

#[cfg(test)]
pub fn cycles() -> u64 {
    use std::{sync::OnceLock, time::Instant};

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    u64::try_from(epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(not(test))]
pub fn set_current(_cpuid: usize) {
    unimplemented!("unsupported architecture");
}

#[cfg(not(test))]
pub fn current() -> Option<usize> {
    unimplemented!("unsupported architecture");
}

#[cfg(not(test))]
pub fn cycles() -> u64 {
    unimplemented!("unsupported architecture");
}
