//! Manager state machine
//!
//! Turns membership events into allocation broadcasts. It performs no I/O: the
//! service feeds it decoded events and publishes whatever it returns.
//!
//! ## Join
//!
//! ```text
//! s2 ── join ──► Manager ── properties {0} ──► s1, s2
//! s1 ── reset ─► Manager
//! s2 ── reset ─► Manager ── properties {C/2} ─► s1, s2
//! ```
//!
//! ## Leave
//!
//! ```text
//! s1 ── leave ─► Manager ── properties {C/1} ─► s2
//! ```

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::error::PayloadError;
use crate::registry::{GridRegistry, RegistrySnapshot};
use crate::topics::Topic;
use crate::types::{Amperes, GridId, StationEvent, StationId};

/// Membership event decoded from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    Join { grid_id: GridId, station_id: StationId },
    Leave { grid_id: GridId, station_id: StationId },
    Reset { grid_id: GridId, station_id: StationId },
}

impl ManagerEvent {
    /// Decode a raw bus message. Topics the manager does not consume are errors.
    pub fn from_message(topic: &str, payload: &[u8]) -> Result<Self, PayloadError> {
        let topic = Topic::parse(topic)?;
        let station_id = || StationEvent::from_bytes(payload).map(|e| e.station_id);

        match topic {
            Topic::Join(grid_id) => Ok(ManagerEvent::Join {
                grid_id,
                station_id: station_id()?,
            }),
            Topic::Leave(grid_id) => Ok(ManagerEvent::Leave {
                grid_id,
                station_id: station_id()?,
            }),
            Topic::Reset(grid_id) => Ok(ManagerEvent::Reset {
                grid_id,
                station_id: station_id()?,
            }),
            other => Err(PayloadError::UnknownTopic(other.to_string())),
        }
    }
}

/// A `grids/{grid}/properties` broadcast the manager wants published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub grid_id: GridId,
    pub charge_current: Amperes,
}

impl Allocation {
    fn new(grid_id: &str, charge_current: Amperes) -> Self {
        Self {
            grid_id: grid_id.to_string(),
            charge_current,
        }
    }
}

/// Membership and allocation state machine
pub struct Manager {
    registry: GridRegistry,
    reset_timeout: Duration,
    max_reset_retries: u32,
}

impl Manager {
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            registry: GridRegistry::new(config.default_capacity),
            reset_timeout: config.reset_timeout,
            max_reset_retries: config.max_reset_retries,
        }
    }

    pub fn registry(&self) -> &GridRegistry {
        &self.registry
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    /// Apply one event and return the broadcasts it causes
    pub fn handle(&mut self, event: ManagerEvent, now: Instant) -> Vec<Allocation> {
        match event {
            ManagerEvent::Join { grid_id, station_id } => self.handle_join(&grid_id, &station_id, now),
            ManagerEvent::Leave { grid_id, station_id } => self.handle_leave(&grid_id, &station_id),
            ManagerEvent::Reset { grid_id, station_id } => self.handle_reset(&grid_id, &station_id),
        }
    }

    fn handle_join(&mut self, grid_id: &str, station_id: &str, now: Instant) -> Vec<Allocation> {
        let grid = self.registry.get_or_create(grid_id);
        let added = grid.admit(station_id, now);

        info!(
            "Manager: {} {} grid {} ({} stations)",
            station_id,
            if added { "joined" } else { "re-joined" },
            grid_id,
            grid.station_count()
        );

        // Nobody else draws current, so there is nothing to drain first
        if grid.station_count() == 1 {
            let current = grid.complete_round();
            info!("Manager: grid {} allocation {} A", grid_id, current);
            return vec![Allocation::new(grid_id, current)];
        }

        info!("Manager: grid {} reset round started", grid_id);
        vec![Allocation::new(grid_id, 0)]
    }

    fn handle_leave(&mut self, grid_id: &str, station_id: &str) -> Vec<Allocation> {
        let Some(grid) = self.registry.get_mut(grid_id) else {
            debug!("Manager: leave of {} for unknown grid {} ignored", station_id, grid_id);
            return Vec::new();
        };

        let Some(current) = grid.remove(station_id) else {
            debug!("Manager: leave of non-member {} in grid {} ignored", station_id, grid_id);
            return Vec::new();
        };

        info!(
            "Manager: {} left grid {} ({} stations)",
            station_id,
            grid_id,
            grid.station_count()
        );

        if self.registry.remove_if_empty(grid_id) {
            info!("Manager: grid {} is empty, removed", grid_id);
            return Vec::new();
        }

        info!("Manager: grid {} allocation {} A", grid_id, current);
        vec![Allocation::new(grid_id, current)]
    }

    fn handle_reset(&mut self, grid_id: &str, station_id: &str) -> Vec<Allocation> {
        let Some(grid) = self.registry.get_mut(grid_id) else {
            debug!("Manager: reset from {} for unknown grid {} ignored", station_id, grid_id);
            return Vec::new();
        };
        if !grid.contains(station_id) {
            debug!("Manager: reset from non-member {} in grid {} ignored", station_id, grid_id);
            return Vec::new();
        }

        let member_count = grid.station_count();
        let Some(round) = grid.round_mut() else {
            debug!("Manager: reset from {} with no open round in grid {}", station_id, grid_id);
            return Vec::new();
        };

        if !round.acknowledge(station_id) {
            debug!("Manager: duplicate reset from {} in grid {}", station_id, grid_id);
            return Vec::new();
        }

        debug!(
            "Manager: grid {} reset {}/{} acknowledged",
            grid_id,
            round.acknowledged_count(),
            member_count
        );

        if !grid.round_complete() {
            return Vec::new();
        }

        let current = grid.complete_round();
        info!(
            "Manager: grid {} reset round complete, allocation {} A",
            grid_id, current
        );
        vec![Allocation::new(grid_id, current)]
    }

    /// Retry or resolve reset rounds older than the configured timeout.
    ///
    /// A stale round re-broadcasts the zero allocation. Once the retries are
    /// used up the round completes anyway. Silent members stay in the grid and
    /// keep their place in the share until their leave or last will arrives.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<Allocation> {
        let mut out = Vec::new();

        for (grid_id, grid) in self.registry.iter_mut() {
            let Some(round) = grid.round_mut() else {
                continue;
            };
            if now.saturating_duration_since(round.started_at()) < self.reset_timeout {
                continue;
            }

            if round.retries() < self.max_reset_retries {
                round.retry(now);
                warn!(
                    "Manager: grid {} reset round timed out, retry {}/{}",
                    grid_id,
                    round.retries(),
                    self.max_reset_retries
                );
                out.push(Allocation::new(grid_id, 0));
                continue;
            }

            warn!(
                "Manager: grid {} reset round gave up waiting for {:?}",
                grid_id,
                grid.unacknowledged()
            );

            let current = grid.complete_round();
            info!("Manager: grid {} allocation {} A", grid_id, current);
            out.push(Allocation::new(grid_id, current));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(grid: &str, station: &str) -> ManagerEvent {
        ManagerEvent::Join {
            grid_id: grid.into(),
            station_id: station.into(),
        }
    }

    fn leave(grid: &str, station: &str) -> ManagerEvent {
        ManagerEvent::Leave {
            grid_id: grid.into(),
            station_id: station.into(),
        }
    }

    fn reset(grid: &str, station: &str) -> ManagerEvent {
        ManagerEvent::Reset {
            grid_id: grid.into(),
            station_id: station.into(),
        }
    }

    fn currents(out: &[Allocation]) -> Vec<Amperes> {
        out.iter().map(|a| a.charge_current).collect()
    }

    fn manager() -> Manager {
        Manager::new(&ManagerConfig::default())
    }

    #[test]
    fn test_event_decoding() {
        let event = ManagerEvent::from_message("grids/g1/join", br#"{"station_id":"s1"}"#).unwrap();
        assert_eq!(event, join("g1", "s1"));

        assert!(ManagerEvent::from_message("grids/g1/join", b"{}").is_err());
        assert!(ManagerEvent::from_message("grids/g1/properties", br#"{"charge_current":1}"#).is_err());
        assert!(ManagerEvent::from_message("services/manager", br#"{"online":true}"#).is_err());
    }

    #[test]
    fn test_first_join_allocates_directly() {
        let mut m = manager();
        let out = m.handle(join("g1", "s1"), Instant::now());
        assert_eq!(out, vec![Allocation::new("g1", 60)]);
        assert!(m.registry().get("g1").unwrap().round().is_none());
    }

    #[test]
    fn test_join_waits_for_all_acks() {
        let mut m = manager();
        let now = Instant::now();
        m.handle(join("g1", "s1"), now);

        assert_eq!(currents(&m.handle(join("g1", "s2"), now)), vec![0]);
        assert!(m.handle(reset("g1", "s2"), now).is_empty());
        // Duplicate ack changes nothing
        assert!(m.handle(reset("g1", "s2"), now).is_empty());
        assert_eq!(currents(&m.handle(reset("g1", "s1"), now)), vec![30]);
    }

    #[test]
    fn test_join_during_round_restarts_it() {
        let mut m = manager();
        let now = Instant::now();
        m.handle(join("g1", "s1"), now);
        m.handle(join("g1", "s2"), now);
        m.handle(reset("g1", "s1"), now);

        assert_eq!(currents(&m.handle(join("g1", "s3"), now)), vec![0]);
        assert!(m.handle(reset("g1", "s2"), now).is_empty());
        assert!(m.handle(reset("g1", "s3"), now).is_empty());
        assert_eq!(currents(&m.handle(reset("g1", "s1"), now)), vec![20]);
    }

    #[test]
    fn test_duplicate_join_keeps_membership() {
        let mut m = manager();
        let now = Instant::now();
        m.handle(join("g1", "s1"), now);
        m.handle(join("g1", "s2"), now);
        m.handle(reset("g1", "s1"), now);
        m.handle(reset("g1", "s2"), now);

        assert_eq!(currents(&m.handle(join("g1", "s2"), now)), vec![0]);
        assert_eq!(m.registry().get("g1").unwrap().station_count(), 2);
    }

    #[test]
    fn test_leave_broadcasts_immediately() {
        let mut m = manager();
        let now = Instant::now();
        m.handle(join("g1", "s1"), now);
        m.handle(join("g1", "s2"), now);
        m.handle(reset("g1", "s1"), now);
        m.handle(reset("g1", "s2"), now);

        assert_eq!(m.handle(leave("g1", "s1"), now), vec![Allocation::new("g1", 60)]);
        assert!(m.handle(leave("g1", "s2"), now).is_empty());
        assert!(m.registry().get("g1").is_none());
    }

    #[test]
    fn test_unknown_references_ignored() {
        let mut m = manager();
        let now = Instant::now();
        assert!(m.handle(leave("nope", "s1"), now).is_empty());
        assert!(m.handle(reset("nope", "s1"), now).is_empty());

        m.handle(join("g1", "s1"), now);
        assert!(m.handle(leave("g1", "ghost"), now).is_empty());
        assert!(m.handle(reset("g1", "ghost"), now).is_empty());
        // No round open
        assert!(m.handle(reset("g1", "s1"), now).is_empty());
        assert_eq!(m.registry().get("g1").unwrap().station_count(), 1);
    }

    #[test]
    fn test_leave_mid_round_cancels_it() {
        let mut m = manager();
        let now = Instant::now();
        m.handle(join("g1", "s1"), now);
        m.handle(join("g1", "s2"), now);

        assert_eq!(currents(&m.handle(leave("g1", "s2"), now)), vec![60]);
        // Late ack is ignored
        assert!(m.handle(reset("g1", "s1"), now).is_empty());
    }

    #[test]
    fn test_timeout_retries_then_completes() {
        let config = ManagerConfig::default()
            .with_reset_timeout(Duration::from_secs(5))
            .with_max_reset_retries(1);
        let mut m = Manager::new(&config);
        let t0 = Instant::now();
        m.handle(join("g1", "s1"), t0);
        m.handle(join("g1", "s2"), t0);
        m.handle(reset("g1", "s1"), t0);

        assert!(m.check_timeouts(t0 + Duration::from_secs(1)).is_empty());

        let t1 = t0 + Duration::from_secs(5);
        assert_eq!(currents(&m.check_timeouts(t1)), vec![0]);

        // Silent s2 keeps its share
        let t2 = t1 + Duration::from_secs(5);
        assert_eq!(currents(&m.check_timeouts(t2)), vec![30]);
        let grid = m.registry().get("g1").unwrap();
        assert!(grid.contains("s2"));
        assert!(grid.round().is_none());
        assert!(m.check_timeouts(t2 + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn test_timeout_with_no_acks_keeps_grid() {
        let config = ManagerConfig::default()
            .with_reset_timeout(Duration::from_secs(1))
            .with_max_reset_retries(0);
        let mut m = Manager::new(&config);
        let t0 = Instant::now();
        m.handle(join("g1", "s1"), t0);
        m.handle(join("g1", "s2"), t0);

        assert_eq!(currents(&m.check_timeouts(t0 + Duration::from_secs(2))), vec![30]);
        assert_eq!(m.registry().get("g1").unwrap().station_count(), 2);

        // The last will of the silent station releases its share
        assert_eq!(currents(&m.handle(leave("g1", "s2"), t0)), vec![60]);
    }
}
