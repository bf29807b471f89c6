use core::{error::Error, fmt};

/// Formats an error together with its source chain.
struct ErrorChain<'a>(&'a dyn Error);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, "\n  caused by: {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

/// Surfaces an unrecoverable error and halts.
///
/// Boot-time failures (a corrupt firmware map, a NUMA coverage gap) end
/// up here; nothing can run without a working page allocator.
#[track_caller]
pub fn report<E>(err: E) -> !
where
    E: Error,
{
    panic!("critical error\n{}", ErrorChain(&err));
}
