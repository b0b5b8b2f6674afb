//! Logical clocks and last-writer-wins registers.
//!
//! DESIGN
//! ======
//! Every write carries a `Stamp` of (Lamport clock, replica id). Stamps are
//! totally ordered lexicographically, so replicas that observe the same set
//! of writes in any order select the same winner per register.

use std::cmp::Ordering;

// =============================================================================
// STAMP
// =============================================================================

/// Largest clock value accepted from a peer. Local ticks above it still fit
/// in a `u64`.
pub const MAX_CLOCK: u64 = u64::MAX >> 1;

/// Write identity. Field order matters: derived `Ord` compares `clock` first,
/// then `replica`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Stamp {
    pub clock: u64,
    pub replica: u64,
}

impl Stamp {
    #[must_use]
    pub fn new(clock: u64, replica: u64) -> Self {
        Self { clock, replica }
    }
}

/// Lamport clock owned by one replica.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    replica: u64,
    time: u64,
}

impl Clock {
    #[must_use]
    pub fn new(replica: u64) -> Self {
        Self { replica, time: 0 }
    }

    #[must_use]
    pub fn replica(&self) -> u64 {
        self.replica
    }

    /// Advance for a local write and return its stamp.
    pub fn tick(&mut self) -> Stamp {
        self.time = self.time.saturating_add(1);
        Stamp::new(self.time, self.replica)
    }

    /// Fold in a remote write so later local writes order after it.
    pub fn observe(&mut self, stamp: Stamp) {
        self.time = self.time.max(stamp.clock);
    }
}

// =============================================================================
// REGISTER
// =============================================================================

/// Deterministic order between two values written under the same stamp.
///
/// Identical stamps only occur for the same write, so this only matters when
/// a peer sends conflicting data under a reused stamp; the result still has to
/// be independent of arrival order.
pub trait TieBreak {
    fn tie_break(&self, other: &Self) -> Ordering;
}

impl TieBreak for String {
    fn tie_break(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}

impl TieBreak for f64 {
    fn tie_break(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
}

/// Last-writer-wins register.
#[derive(Debug, Clone, PartialEq)]
pub struct Register<T> {
    pub value: T,
    pub stamp: Stamp,
}

impl<T: Clone + PartialEq + TieBreak> Register<T> {
    #[must_use]
    pub fn new(value: T, stamp: Stamp) -> Self {
        Self { value, stamp }
    }

    /// True if `other` should replace `self`.
    fn loses_to(&self, other: &Self) -> bool {
        match other.stamp.cmp(&self.stamp) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => other.value.tie_break(&self.value) == Ordering::Greater,
        }
    }
}

/// Merge an incoming register into an optional slot. Returns true when the
/// slot changed.
pub fn merge_slot<T>(slot: &mut Option<Register<T>>, incoming: Option<&Register<T>>) -> bool
where
    T: Clone + PartialEq + TieBreak,
{
    let Some(incoming) = incoming else {
        return false;
    };
    match slot {
        Some(current) if !current.loses_to(incoming) => false,
        _ => {
            *slot = Some(incoming.clone());
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_orders_by_clock_then_replica() {
        assert!(Stamp::new(2, 1) > Stamp::new(1, 9));
        assert!(Stamp::new(3, 7) > Stamp::new(3, 2));
        assert_eq!(Stamp::new(4, 4), Stamp::new(4, 4));
    }

    #[test]
    fn clock_tick_and_observe() {
        let mut clock = Clock::new(7);
        assert_eq!(clock.tick(), Stamp::new(1, 7));
        clock.observe(Stamp::new(10, 3));
        assert_eq!(clock.tick(), Stamp::new(11, 7));
        clock.observe(Stamp::new(2, 3));
        assert_eq!(clock.tick(), Stamp::new(12, 7));
    }

    #[test]
    fn tick_after_max_clock_stays_in_range() {
        let mut clock = Clock::new(1);
        clock.observe(Stamp::new(MAX_CLOCK, 9));
        assert_eq!(clock.tick(), Stamp::new(MAX_CLOCK + 1, 1));

        let mut pinned = Clock::new(2);
        pinned.observe(Stamp::new(u64::MAX, 9));
        assert_eq!(pinned.tick(), Stamp::new(u64::MAX, 2));
    }

    #[test]
    fn merge_slot_keeps_greatest_stamp_in_either_order() {
        let low = Register::new("low".to_string(), Stamp::new(1, 9));
        let high = Register::new("high".to_string(), Stamp::new(2, 1));

        let mut a = Some(low.clone());
        assert!(merge_slot(&mut a, Some(&high)));
        let mut b = Some(high.clone());
        assert!(!merge_slot(&mut b, Some(&low)));

        assert_eq!(a, b);
        assert_eq!(a.map(|r| r.value), Some("high".to_string()));
    }

    #[test]
    fn merge_slot_breaks_equal_stamp_ties_by_value() {
        let stamp = Stamp::new(5, 5);
        let mut a = Some(Register::new(1.0_f64, stamp));
        let mut b = Some(Register::new(2.0_f64, stamp));
        merge_slot(&mut a, Some(&Register::new(2.0, stamp)));
        merge_slot(&mut b, Some(&Register::new(1.0, stamp)));
        assert_eq!(a, b);
    }

    #[test]
    fn merge_slot_none_incoming_is_noop() {
        let mut slot = Some(Register::new(3.0_f64, Stamp::new(1, 1)));
        assert!(!merge_slot(&mut slot, None));
        let mut empty: Option<Register<f64>> = None;
        assert!(merge_slot(&mut empty, Some(&Register::new(1.0, Stamp::new(1, 1)))));
    }
}
