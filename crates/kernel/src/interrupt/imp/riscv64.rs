use riscv::register::sstatus;

#[derive(Debug, Clone, Copy)]
pub struct State {
    enabled: bool,
}

impl State {
    pub const fn new() -> Self {
        Self { enabled: false }
    }
}

pub fn read_and_disable() -> State {
    let enabled = sstatus::read().sie();
    // An interrupt taken between the read and the clear returns with SIE
    // restored, so the captured state stays accurate.
    unsafe {
        sstatus::clear_sie();
    }
    State { enabled }
}

pub fn is_enabled() -> bool {
    sstatus::read().sie()
}

pub fn restore(state: State) {
    assert!(!is_enabled());
    if state.enabled {
        unsafe {
            sstatus::set_sie();
        }
    }
}
