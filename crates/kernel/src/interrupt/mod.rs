//! Local interrupt control.
//!
//! Per-CPU state (the hot-page cache, the current spinlock nesting) is
//! protected by disabling interrupts rather than by a lock: the only
//! concurrent access would come from an interrupt handler on the same
//! CPU. [`push_disabled`] returns a guard; disables nest, and the
//! interrupt flag is restored only when the outermost guard drops.

use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::cpu::{self, NCPU};

mod imp;

/// Disables interrupts on the current CPU until the guard is dropped.
///
/// Nests: the original interrupt state is captured by the outermost
/// guard and restored when it drops, no matter how many inner guards
/// come and go in between.
#[track_caller]
pub fn push_disabled() -> InterruptGuard {
    let state = imp::read_and_disable();
    cpu_state().push_interrupt_state(state);
    InterruptGuard {
        _not_send: PhantomData,
    }
}

/// Returns whether interrupts are currently enabled on this CPU.
pub fn is_enabled() -> bool {
    imp::is_enabled()
}

/// Returns the current interrupt-disable nesting depth.
pub fn disabled_depth() -> usize {
    cpu_state().depth.load(Ordering::Relaxed)
}

/// Witness that interrupts are disabled on the current CPU.
#[derive(Debug)]
pub struct InterruptGuard {
    // Guards pin the state of one CPU and must not migrate.
    _not_send: PhantomData<*mut ()>,
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if let Some(initial) = cpu_state().pop_interrupt_state() {
            imp::restore(initial);
        }
    }
}

impl InterruptGuard {
    pub fn pop(self) {
        let _ = self; // drop
    }
}

// Until a CPU has an identity, guards fall back to shared boot state.
static BOOT_CPU_STATE: CpuState = CpuState::new();
static CPU_STATES: [CpuState; NCPU] = [const { CpuState::new() }; NCPU];

fn cpu_state() -> &'static CpuState {
    match cpu::try_current_cpuid() {
        Some(id) => &CPU_STATES[id.value()],
        None => &BOOT_CPU_STATE,
    }
}

struct CpuState {
    depth: AtomicUsize,
    initial_state: UnsafeCell<imp::State>,
}

unsafe impl Sync for CpuState {}

impl CpuState {
    const fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            initial_state: UnsafeCell::new(imp::State::new()),
        }
    }

    fn push_interrupt_state(&self, state: imp::State) {
        let depth = self.depth.fetch_add(1, Ordering::Acquire);
        if depth == 0 {
            unsafe {
                *self.initial_state.get() = state;
            }
        }
    }

    fn pop_interrupt_state(&self) -> Option<imp::State> {
        let depth = self.depth.fetch_sub(1, Ordering::Release);
        assert_ne!(depth, 0, "interrupt guard underflow");
        if depth == 1 {
            unsafe { Some(*self.initial_state.get()) }
        } else {
            None
        }
    }
}
