//! Mempools and the cross-CPU balancer.
//!
//! A mempool wraps one buddy allocator and the span of memory that was
//! seeded into it. Pools and the balancer refer to each other by table
//! index, never by pointer; the allocator context owns the tables and
//! dispatches by id.

use core::{
    ops::Range,
    sync::atomic::{AtomicUsize, Ordering},
};

/// One pool: a buddy index plus the local span seeded into that buddy.
#[derive(Debug)]
pub struct Mempool {
    /// Index of the backing buddy. The buddy can end up holding any
    /// physical memory its window covers, not just the local span.
    pub(crate) buddy: usize,
    /// First address of this pool's local memory.
    pub(crate) base: usize,
    /// First address beyond this pool's local memory.
    pub(crate) limit: usize,
    /// NUMA node the local memory belongs to.
    pub(crate) node: usize,
    /// Advisory free-page count, refreshed on locked reads.
    cached_free: AtomicUsize,
}

impl Mempool {
    pub(crate) fn new(buddy: usize, base: usize, size: usize, node: usize, free: usize) -> Self {
        Self {
            buddy,
            base,
            limit: base + size,
            node,
            cached_free: AtomicUsize::new(free),
        }
    }

    /// The span of local memory this pool was seeded with. The backing
    /// buddy may hold donated memory outside of it.
    pub fn local_range(&self) -> Range<usize> {
        self.base..self.limit
    }

    /// Lock-free advisory free count. May be stale; a decision made from
    /// it can at worst cause a no-op move.
    pub fn cached_free(&self) -> usize {
        self.cached_free.load(Ordering::Relaxed)
    }

    pub(crate) fn set_cached_free(&self, free: usize) {
        self.cached_free.store(free, Ordering::Relaxed);
    }
}

/// Capability interface the balancer works against. Today the only pool
/// is a buddy-backed [`Mempool`] view; an object cache or a large-object
/// pool can plug in by implementing this.
pub trait BalancePool {
    /// Identity within the pool table.
    fn pool_id(&self) -> usize;

    /// Advisory free-page count, readable without the pool's lock.
    fn advisory_count(&self) -> usize;

    /// Precise free-page count, read under the pool's lock.
    fn balance_count(&self) -> usize;

    /// Whether memory moved out of `self` can land in `target`.
    fn can_donate_to(&self, target: &Self) -> bool;

    /// Interconnect distance to `other`; lower is closer.
    fn locality(&self, other: &Self) -> usize;

    /// Moves up to half of this pool's free memory to `target` as one
    /// block. A move the pool cannot afford is a no-op.
    fn balance_move_to(&self, target: &Self);
}

/// Picks donors for starved pools.
#[derive(Debug)]
pub struct Balancer {
    margin_pages: usize,
}

impl Balancer {
    #[must_use]
    pub const fn new(margin_pages: usize) -> Self {
        Self { margin_pages }
    }

    /// Moves memory toward `recipient` from the best donor among
    /// `pools`, if any donor's advisory count exceeds the recipient's by
    /// the margin. Donors are ranked by count, then locality, then the
    /// lowest pool id, so the choice is deterministic.
    ///
    /// Returns whether a donation was attempted.
    pub fn rebalance<P, I>(&self, recipient: &P, pools: I) -> bool
    where
        P: BalancePool,
        I: IntoIterator<Item = P>,
    {
        let need = recipient.balance_count();
        let floor = need.saturating_add(self.margin_pages);

        let mut best: Option<(P, usize)> = None;
        for pool in pools {
            if pool.pool_id() == recipient.pool_id() || !pool.can_donate_to(recipient) {
                continue;
            }
            let count = pool.advisory_count();
            if count <= floor {
                continue;
            }
            let better = match &best {
                None => true,
                Some((chosen, chosen_count)) => {
                    count > *chosen_count
                        || (count == *chosen_count
                            && (pool.locality(recipient), pool.pool_id())
                                < (chosen.locality(recipient), chosen.pool_id()))
                }
            };
            if better {
                best = Some((pool, count));
            }
        }

        match best {
            Some((donor, _)) => {
                donor.balance_move_to(recipient);
                true
            }
            None => false,
        }
    }
}
