//! Grid registry owned by the manager
//!
//! Every mutation keeps the member set and the allocation consistent in a
//! single step: a join zeroes the allocation and opens a reset round, a
//! completed round or a leave stores the recomputed share.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::allocation::{compute_allocation, ResetRound};
use crate::types::{Amperes, GridId, StationId};

/// Default total current budget of a newly created grid
pub const DEFAULT_GRID_CAPACITY: Amperes = 60;

/// One group of stations sharing a fixed capacity
#[derive(Debug, Clone)]
pub struct Grid {
    capacity: Amperes,
    stations: BTreeSet<StationId>,
    current_allocation: Amperes,
    round: Option<ResetRound>,
}

impl Grid {
    pub fn new(capacity: Amperes) -> Self {
        Self {
            capacity,
            stations: BTreeSet::new(),
            current_allocation: 0,
            round: None,
        }
    }

    pub fn capacity(&self) -> Amperes {
        self.capacity
    }

    pub fn current_allocation(&self) -> Amperes {
        self.current_allocation
    }

    pub fn station_count(&self) -> usize {
        self.stations.len()
    }

    pub fn contains(&self, station_id: &str) -> bool {
        self.stations.contains(station_id)
    }

    pub fn stations(&self) -> impl Iterator<Item = &StationId> {
        self.stations.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn round(&self) -> Option<&ResetRound> {
        self.round.as_ref()
    }

    pub fn round_mut(&mut self) -> Option<&mut ResetRound> {
        self.round.as_mut()
    }

    /// Add a member and open a fresh reset round.
    ///
    /// Returns true if the station was not a member before. A repeated join
    /// still restarts the round.
    pub fn admit(&mut self, station_id: &str, now: Instant) -> bool {
        let added = self.stations.insert(station_id.to_string());
        self.round = Some(ResetRound::new(now));
        self.current_allocation = 0;
        added
    }

    /// Remove a member. Any open round is cancelled and the share recomputed.
    ///
    /// Returns the new allocation, or `None` if the station was not a member.
    pub fn remove(&mut self, station_id: &str) -> Option<Amperes> {
        if !self.stations.remove(station_id) {
            return None;
        }
        if self.round.take().is_some() {
            debug!("Registry: leave of {} cancelled open reset round", station_id);
        }
        Some(self.recompute())
    }

    /// True when an open round has collected every member's acknowledgement
    pub fn round_complete(&self) -> bool {
        self.round
            .as_ref()
            .map(|r| r.is_complete(&self.stations))
            .unwrap_or(false)
    }

    /// Close the open round and store the new share
    pub fn complete_round(&mut self) -> Amperes {
        self.round = None;
        self.recompute()
    }

    /// Members that have not acknowledged the open round
    pub fn unacknowledged(&self) -> Vec<StationId> {
        let Some(round) = self.round.as_ref() else {
            return Vec::new();
        };
        self.stations
            .iter()
            .filter(|s| !round.is_acknowledged(s))
            .cloned()
            .collect()
    }

    fn recompute(&mut self) -> Amperes {
        self.current_allocation = compute_allocation(self.capacity, self.stations.len());
        self.current_allocation
    }
}

/// All grids known to the manager
#[derive(Debug)]
pub struct GridRegistry {
    default_capacity: Amperes,
    grids: HashMap<GridId, Grid>,
}

impl GridRegistry {
    pub fn new(default_capacity: Amperes) -> Self {
        Self {
            default_capacity,
            grids: HashMap::new(),
        }
    }

    /// Look up a grid, creating it with the default capacity if absent
    pub fn get_or_create(&mut self, grid_id: &str) -> &mut Grid {
        let capacity = self.default_capacity;
        self.grids.entry(grid_id.to_string()).or_insert_with(|| {
            debug!("Registry: creating grid {} (capacity {} A)", grid_id, capacity);
            Grid::new(capacity)
        })
    }

    /// Delete a grid once its last station is gone. Returns true if deleted.
    pub fn remove_if_empty(&mut self, grid_id: &str) -> bool {
        if self.grids.get(grid_id).is_some_and(Grid::is_empty) {
            self.grids.remove(grid_id);
            debug!("Registry: grid {} deleted", grid_id);
            true
        } else {
            false
        }
    }

    pub fn get(&self, grid_id: &str) -> Option<&Grid> {
        self.grids.get(grid_id)
    }

    pub fn get_mut(&mut self, grid_id: &str) -> Option<&mut Grid> {
        self.grids.get_mut(grid_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GridId, &Grid)> {
        self.grids.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&GridId, &mut Grid)> {
        self.grids.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.grids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grids.is_empty()
    }

    pub fn default_capacity(&self) -> Amperes {
        self.default_capacity
    }

    /// Point-in-time copy for console rendering
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut grids: Vec<GridSnapshot> = self
            .grids
            .iter()
            .map(|(id, grid)| GridSnapshot {
                grid_id: id.clone(),
                capacity: grid.capacity,
                current_allocation: grid.current_allocation,
                stations: grid
                    .stations
                    .iter()
                    .map(|s| StationSnapshotEntry {
                        station_id: s.clone(),
                        ready: grid.round.as_ref().map_or(true, |r| r.is_acknowledged(s)),
                    })
                    .collect(),
                resetting: grid.round.is_some(),
            })
            .collect();
        grids.sort_by(|a, b| a.grid_id.cmp(&b.grid_id));

        RegistrySnapshot {
            taken_at: Utc::now(),
            grids,
        }
    }
}

impl Default for GridRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_GRID_CAPACITY)
    }
}

/// Copy of the registry state
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub taken_at: DateTime<Utc>,
    pub grids: Vec<GridSnapshot>,
}

impl Default for RegistrySnapshot {
    fn default() -> Self {
        Self {
            taken_at: Utc::now(),
            grids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GridSnapshot {
    pub grid_id: GridId,
    pub capacity: Amperes,
    pub current_allocation: Amperes,
    pub stations: Vec<StationSnapshotEntry>,
    pub resetting: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StationSnapshotEntry {
    pub station_id: StationId,
    pub ready: bool,
}
