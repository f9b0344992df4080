//! Fair-share allocation and the synchronized reset round
//!
//! A join lowers everybody's share, so the new value may only be broadcast once
//! every member has confirmed it is drawing zero. [`ResetRound`] tracks those
//! confirmations for one grid.

use std::collections::HashSet;
use std::time::Instant;

use crate::types::{Amperes, StationId};

/// Equal integral share of `capacity` for `station_count` stations.
///
/// The remainder of the division is left unused.
pub fn compute_allocation(capacity: Amperes, station_count: usize) -> Amperes {
    if station_count == 0 {
        return 0;
    }
    let count = Amperes::try_from(station_count).unwrap_or(Amperes::MAX);
    capacity / count
}

/// Acknowledgement state of an open reset round
#[derive(Debug, Clone)]
pub struct ResetRound {
    acknowledged: HashSet<StationId>,
    started_at: Instant,
    retries: u32,
}

impl ResetRound {
    pub fn new(now: Instant) -> Self {
        Self {
            acknowledged: HashSet::new(),
            started_at: now,
            retries: 0,
        }
    }

    /// Record an acknowledgement. Returns false if it was already recorded.
    pub fn acknowledge(&mut self, station_id: &str) -> bool {
        self.acknowledged.insert(station_id.to_string())
    }

    /// Forget a station that left mid-round
    pub fn forget(&mut self, station_id: &str) {
        self.acknowledged.remove(station_id);
    }

    pub fn is_acknowledged(&self, station_id: &str) -> bool {
        self.acknowledged.contains(station_id)
    }

    pub fn acknowledged_count(&self) -> usize {
        self.acknowledged.len()
    }

    /// The round is complete once every current member has acknowledged
    pub fn is_complete<'a>(&self, members: impl IntoIterator<Item = &'a StationId>) -> bool {
        members.into_iter().all(|m| self.acknowledged.contains(m))
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Restart the deadline after re-broadcasting the zero allocation
    pub fn retry(&mut self, now: Instant) {
        self.retries += 1;
        self.started_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_allocation() {
        assert_eq!(compute_allocation(60, 0), 0);
        assert_eq!(compute_allocation(60, 1), 60);
        assert_eq!(compute_allocation(60, 2), 30);
        assert_eq!(compute_allocation(60, 7), 8); // remainder 4 stays unused
        assert_eq!(compute_allocation(60, 61), 0);
        assert_eq!(compute_allocation(0, 3), 0);
    }

    #[test]
    fn test_reset_round_completion() {
        let members: Vec<StationId> = vec!["s1".into(), "s2".into()];
        let mut round = ResetRound::new(Instant::now());

        assert!(!round.is_complete(&members));
        assert!(round.acknowledge("s1"));
        assert!(!round.acknowledge("s1"));
        assert!(!round.is_complete(&members));
        assert!(round.acknowledge("s2"));
        assert!(round.is_complete(&members));
        assert_eq!(round.acknowledged_count(), 2);
    }

    #[test]
    fn test_reset_round_forget() {
        let mut round = ResetRound::new(Instant::now());
        round.acknowledge("s1");
        round.forget("s1");
        assert!(!round.is_acknowledged("s1"));
    }
}
