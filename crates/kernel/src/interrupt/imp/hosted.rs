//! Host-side stand-in for the interrupt flag.
//!
//! Tests model the per-CPU interrupt enable bit as a thread-local, so the
//! guard discipline is exercised for real. Outside tests there is no
//! interrupt controller to talk to.

#[derive(Debug, Clone, Copy)]
pub struct State {
    #[cfg_attr(not(test), expect(dead_code))]
    enabled: bool,
}

impl State {
    pub const fn new() -> Self {
        Self { enabled: false }
    }
}

#[cfg(test)]
std::thread_local! {
    static ENABLED: core::cell::Cell<bool> = const { core::cell::Cell::new(true) };
}

#[cfg(test)]
pub fn read_and_disable() -> State {
    State {
        enabled: ENABLED.replace(false),
    }
}

#[cfg(test)]
pub fn is_enabled() -> bool {
    ENABLED.get()
}

#[cfg(test)]
pub fn restore(state: State) {
    assert!(!is_enabled());
    ENABLED.set(state.enabled);
}

#[cfg(not(test))]
pub fn read_and_disable() -> State {
    unimplemented!("unsupported architecture");
}

#[cfg(not(test))]
pub fn is_enabled() -> bool {
    unimplemented!("unsupported architecture");
}

#[cfg(not(test))]
pub fn restore(_state: State) {
    unimplemented!("unsupported architecture");
}
