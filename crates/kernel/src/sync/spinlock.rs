use core::{
    cell::UnsafeCell,
    fmt, hint,
    ops::{Deref, DerefMut},
    panic::Location,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::interrupt::{self, InterruptGuard};

/// A spinlock that disables interrupts for as long as it is held.
///
/// Interrupts must be off inside the critical section: an interrupt
/// handler on the same CPU could otherwise spin on a lock its own CPU
/// already holds.
pub struct SpinMutex<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
    locked_at: UnsafeCell<&'static Location<'static>>,
}

impl<T> Default for SpinMutex<T>
where
    T: Default,
{
    #[track_caller]
    fn default() -> Self {
        Self::new(T::default())
    }
}

unsafe impl<T> Sync for SpinMutex<T> where T: Send {}

impl<T> fmt::Debug for SpinMutex<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("SpinMutex");
        match self.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &"<locked>"),
        };
        d.finish()
    }
}

impl<T> SpinMutex<T> {
    #[track_caller]
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
            locked_at: UnsafeCell::new(Location::caller()),
        }
    }

    #[track_caller]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        let interrupt_guard = interrupt::push_disabled();

        while self.locked.swap(true, Ordering::Acquire) {
            hint::spin_loop();
        }

        unsafe {
            *self.locked_at.get() = Location::caller();
        }

        SpinMutexGuard {
            mutex: self,
            _interrupt_guard: interrupt_guard,
        }
    }

    #[track_caller]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        let interrupt_guard = interrupt::push_disabled();

        if self.locked.swap(true, Ordering::Acquire) {
            return None;
        }

        unsafe {
            *self.locked_at.get() = Location::caller();
        }

        Some(SpinMutexGuard {
            mutex: self,
            _interrupt_guard: interrupt_guard,
        })
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
    _interrupt_guard: InterruptGuard,
}

unsafe impl<T> Send for SpinMutexGuard<'_, T> where T: Send {}
unsafe impl<T> Sync for SpinMutexGuard<'_, T> where T: Sync {}

impl<T> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        assert!(
            self.mutex.is_locked(),
            "SpinMutexGuard dropped without holding the lock"
        );
        self.mutex.locked.store(false, Ordering::Release);
    }
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> SpinMutexGuard<'_, T> {
    pub fn unlock(self) {
        let _ = self; // drop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{self, Cpuid};

    #[test]
    fn lock_excludes_and_disables_interrupts() {
        cpu::set_current_cpuid(Cpuid::from_raw(59));
        let mutex = SpinMutex::new(7);

        let mut guard = mutex.lock();
        assert!(!interrupt::is_enabled());
        assert!(mutex.try_lock().is_none());
        *guard += 1;
        guard.unlock();

        assert!(interrupt::is_enabled());
        assert_eq!(*mutex.lock(), 8);
    }

    #[test]
    fn contended_counter_stays_consistent() {
        let mutex = SpinMutex::new(0_usize);
        std::thread::scope(|s| {
            let mutex = &mutex;
            for cpuid in 48..52 {
                s.spawn(move || {
                    cpu::set_current_cpuid(Cpuid::from_raw(cpuid));
                    for _ in 0..1000 {
                        *mutex.lock() += 1;
                    }
                });
            }
        });
        assert_eq!(*mutex.lock(), 4000);
    }
}
