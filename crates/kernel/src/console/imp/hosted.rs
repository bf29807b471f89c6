use core::convert::Infallible;

use super::super::Console;

/// Forwards to stdout under test, discards output otherwise.
pub(in super::super) struct DebugConsole {}

impl DebugConsole {
    pub(in super::super) const fn new() -> Self {
        Self {}
    }
}

impl Console for DebugConsole {
    type Error = Infallible;

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<usize, Self::Error> {
        #[cfg(test)]
        {
            use std::io::Write as _;
            let _ = std::io::stdout().write_all(bytes);
        }
        Ok(bytes.len())
    }
}
