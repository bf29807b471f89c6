//! Per-CPU steal order over the buddy table.
//!
//! Each CPU consults buddies in a fixed order: its own share first, then
//! the rest of its NUMA node, then everything. The order is a short list
//! of disjoint index ranges; [`StealOrder::add`] subtracts whatever has
//! already been added, so each index appears exactly once no matter how
//! the strata overlap.

use core::fmt;

use arrayvec::ArrayVec;

/// Three strata can produce at most five disjoint segments.
const MAX_SEGMENTS: usize = 5;

/// A half-open range of buddy indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub low: usize,
    pub high: usize,
}

#[derive(Debug, Clone, Default)]
pub struct StealOrder {
    segments: ArrayVec<Segment, MAX_SEGMENTS>,
}

impl StealOrder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The first segment added: the CPU's own buddies.
    ///
    /// # Panics
    ///
    /// Panics if nothing has been added yet.
    #[must_use]
    pub fn get_local(&self) -> Segment {
        *self.segments.first().expect("steal order is empty")
    }

    /// Returns whether `index` belongs to the local segment.
    #[must_use]
    pub fn is_local(&self, index: usize) -> bool {
        let local = self.get_local();
        local.low <= index && index < local.high
    }

    /// Yields every buddy index in steal order, each exactly once.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.segments.iter().flat_map(|seg| seg.low..seg.high)
    }

    /// Adds `[low, high)`, subtracting any part already present.
    ///
    /// A range that straddles an existing segment on both sides is split,
    /// and the upper half is added first. Different CPUs add different
    /// local ranges, so the split desynchronizes their fallback orders
    /// and keeps them from converging on the same remote buddy.
    pub fn add(&mut self, mut low: usize, mut high: usize) {
        let mut i = 0;
        while i < self.segments.len() {
            let seg = self.segments[i];
            if seg.low <= low && high <= seg.high {
                // Already fully covered.
                return;
            } else if low < seg.low && high > seg.high {
                self.add(seg.high, high);
                high = seg.low;
            } else if low < seg.low && high > seg.low {
                // Straddles the low boundary.
                high = seg.low;
            } else if low < seg.high && high > seg.high {
                // Straddles the high boundary.
                low = seg.high;
            }
            i += 1;
        }
        if low >= high {
            return;
        }
        // Merge with the last segment where possible, but never grow the
        // local segment: it has to stay identifiable.
        if self.segments.len() > 1 {
            let last = self.segments.last_mut().expect("checked nonempty");
            if last.high == low {
                last.high = high;
                return;
            }
            if high == last.low {
                last.low = low;
                return;
            }
        }
        self.segments.push(Segment { low, high });
    }

    #[cfg(test)]
    fn segments(&self) -> &[Segment] {
        &self.segments
    }
}

impl fmt::Display for StealOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            let (open, close) = if i == 0 { ("<", ">") } else { ("", "") };
            if seg.low == seg.high - 1 {
                write!(f, "{open}{}{close}", seg.low)?;
            } else {
                write!(f, "{open}{}..{}{close}", seg.low, seg.high - 1)?;
            }
        }
        Ok(())
    }
}
