use std::error::Error;
use std::fmt;

/// Display an error with its whole source chain on a single line.
///
/// Useful in log statements, where the multi-line `Debug` output
/// of a deeply nested error is more noise than signal.
pub struct CompactFmt<'e>(&'e (dyn Error + 'static));

impl fmt::Display for CompactFmt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;

        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

pub trait FmtCompact {
    fn fmt_compact(&self) -> CompactFmt<'_>;
}

impl<E> FmtCompact for E
where
    E: Error + 'static,
{
    fn fmt_compact(&self) -> CompactFmt<'_> {
        CompactFmt(self)
    }
}

impl FmtCompact for dyn Error + 'static {
    fn fmt_compact(&self) -> CompactFmt<'_> {
        CompactFmt(self)
    }
}
