#[cfg(all(target_arch = "riscv64", not(test)))]
mod riscv64;
#[cfg(all(target_arch = "riscv64", not(test)))]
pub(super) use self::riscv64::DebugConsole;

#[cfg(not(all(target_arch = "riscv64", not(test))))]
mod hosted;
#[cfg(not(all(target_arch = "riscv64", not(test))))]
pub(super) use self::hosted::DebugConsole;
