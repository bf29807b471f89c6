use core::{
    fmt::{self, Write as _},
    hint,
    sync::atomic::{AtomicBool, Ordering},
};

use self::line_buffered::LineBufferedConsole;
use crate::sync::spinlock::SpinMutex;

mod imp;
mod line_buffered;

static CONSOLE: SpinMutex<LineBufferedConsole<imp::DebugConsole>> =
    SpinMutex::new(LineBufferedConsole::new(imp::DebugConsole::new()));
static PANICKED: AtomicBool = AtomicBool::new(false);

pub(crate) trait Console {
    type Error;
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<usize, Self::Error>;
}

pub fn print(args: fmt::Arguments) {
    if PANICKED.load(Ordering::Acquire) {
        loop {
            // The panic path owns the console now.
            hint::spin_loop();
        }
    }
    let _ = CONSOLE.lock().write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*))
    };
}

#[cfg(all(not(test), target_arch = "riscv64"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    use crate::cpu;

    PANICKED.store(true, Ordering::Release);

    let mut console = CONSOLE.lock();
    let _ = writeln!(console);
    let _ = writeln!(console, "!!! KERNEL PANIC !!!");
    match cpu::try_current_cpuid() {
        Some(cpuid) => {
            let _ = writeln!(console, "CPU: {cpuid}");
        }
        None => {
            let _ = writeln!(console, "CPU: <unknown>");
        }
    }
    if let Some(loc) = info.location() {
        let _ = writeln!(console, "Location: {loc}");
    }
    let _ = writeln!(console, "Message: {}", info.message());
    loop {
        hint::spin_loop();
    }
}
