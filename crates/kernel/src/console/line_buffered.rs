use core::fmt;

use super::Console;

/// Collects output into whole lines before handing it to the sink, so
/// concurrent CPUs do not interleave mid-line.
pub(super) struct LineBufferedConsole<C> {
    buffer: [u8; 512],
    filled: usize,
    console: C,
}

impl<C> LineBufferedConsole<C>
where
    C: Console,
{
    pub(super) const fn new(console: C) -> Self {
        Self {
            buffer: [0; 512],
            filled: 0,
            console,
        }
    }

    fn flush(&mut self) -> Result<(), C::Error> {
        let mut written = 0;
        while written < self.filled {
            let n = self.console.write_bytes(&self.buffer[written..self.filled])?;
            if n == 0 {
                break;
            }
            written += n;
        }
        self.filled = 0;
        Ok(())
    }

    fn push_bytes(&mut self, mut bytes: &[u8]) -> Result<(), C::Error> {
        while !bytes.is_empty() {
            let n = usize::min(bytes.len(), self.buffer.len() - self.filled);
            self.buffer[self.filled..][..n].copy_from_slice(&bytes[..n]);
            self.filled += n;
            bytes = &bytes[n..];
            if !bytes.is_empty() {
                self.flush()?;
            }
        }
        Ok(())
    }
}

impl<C> fmt::Write for LineBufferedConsole<C>
where
    C: Console,
{
    fn write_str(&mut self, mut s: &str) -> fmt::Result {
        while let Some(n) = s.find('\n') {
            let (line, rest) = s.split_at(n + 1);
            self.push_bytes(line.as_bytes()).map_err(|_| fmt::Error)?;
            self.flush().map_err(|_| fmt::Error)?;
            s = rest;
        }
        self.push_bytes(s.as_bytes()).map_err(|_| fmt::Error)
    }
}
