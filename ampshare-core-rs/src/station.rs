//! Station agent state machine
//!
//! ```text
//! Disconnected ──connect──► Idle ──alloc>0──► Charging ──alloc=0──► ResetWait
//!                            ▲                    ▲                     │
//!                            │                    └──────alloc>0────────┘
//!                       manager online
//!                            │
//!                        Suspended ◄──manager offline── (any connected phase)
//! ```
//!
//! Any connection loss returns to `Disconnected` with the rate forced to zero.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::StationConfig;
use crate::error::PayloadError;
use crate::topics::{Topic, MANAGER_PRESENCE};
use crate::types::{Amperes, GridId, GridProperties, ManagerPresence, StationEvent, StationId};

/// Hardware limit of a single station
pub const MAX_CHARGE_CURRENT: Amperes = 32;

/// Charge gained per ampere per simulation tick, in percent
pub const CHARGE_PERCENT_PER_AMP: f64 = 0.05;

/// Lifecycle phase of a station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StationPhase {
    /// No bus connection
    Disconnected,
    /// Joined, waiting for the first allocation
    Idle,
    /// Drawing a non-zero current
    Charging,
    /// Drained to zero and acknowledged, waiting for the new share
    ResetWait,
    /// Manager reported offline
    Suspended,
}

impl std::fmt::Display for StationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StationPhase::Disconnected => "disconnected",
            StationPhase::Idle => "idle",
            StationPhase::Charging => "charging",
            StationPhase::ResetWait => "reset-wait",
            StationPhase::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

/// Bus operation requested by the station
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Subscribe(String),
    Publish { topic: String, event: StationEvent },
}

/// Linear charge ramp that saturates at 100% and then starts over
#[derive(Debug, Clone, Default)]
pub struct ChargeSimulator {
    percent: f64,
}

impl ChargeSimulator {
    pub fn percent(&self) -> f64 {
        self.percent
    }

    /// Advance one tick at `rate` amperes
    pub fn step(&mut self, rate: Amperes) -> f64 {
        if self.percent >= 100.0 && rate > 0 {
            // Vehicle full, next one plugs in
            self.percent = 0.0;
        }
        self.percent = (self.percent + f64::from(rate) * CHARGE_PERCENT_PER_AMP).min(100.0);
        self.percent
    }
}

/// Per-station protocol state
#[derive(Debug)]
pub struct Station {
    grid_id: GridId,
    station_id: StationId,
    phase: StationPhase,
    charge_rate: Amperes,
    simulator: ChargeSimulator,
}

impl Station {
    pub fn new(config: &StationConfig) -> Self {
        Self {
            grid_id: config.grid_id.clone(),
            station_id: config.station_id.clone(),
            phase: StationPhase::Disconnected,
            charge_rate: 0,
            simulator: ChargeSimulator::default(),
        }
    }

    pub fn grid_id(&self) -> &str {
        &self.grid_id
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    pub fn phase(&self) -> StationPhase {
        self.phase
    }

    pub fn charge_rate(&self) -> Amperes {
        self.charge_rate
    }

    pub fn charge_percent(&self) -> f64 {
        self.simulator.percent()
    }

    /// Leave event the broker publishes for us on an ungraceful disconnect
    pub fn last_will(&self) -> (String, StationEvent) {
        (Topic::leave(&self.grid_id), self.event())
    }

    /// Subscribe to our grid and the manager, then announce ourselves
    pub fn on_connected(&mut self) -> Vec<Outgoing> {
        info!("Station: {} connected, joining grid {}", self.station_id, self.grid_id);
        self.phase = StationPhase::Idle;
        vec![
            Outgoing::Subscribe(Topic::properties(&self.grid_id)),
            Outgoing::Subscribe(MANAGER_PRESENCE.to_string()),
            self.publish(Topic::join(&self.grid_id)),
        ]
    }

    pub fn on_disconnected(&mut self) {
        warn!("Station: {} lost connection, charge rate 0 A", self.station_id);
        self.phase = StationPhase::Disconnected;
        self.charge_rate = 0;
    }

    /// Dispatch a raw bus message
    pub fn on_message(&mut self, topic: &str, payload: &[u8]) -> Result<Vec<Outgoing>, PayloadError> {
        match Topic::parse(topic)? {
            Topic::Properties(grid) if grid == self.grid_id => {
                let props = GridProperties::from_bytes(payload)?;
                Ok(self.on_allocation(props.charge_current))
            }
            Topic::Properties(grid) => {
                debug!("Station: ignoring properties for foreign grid {}", grid);
                Ok(Vec::new())
            }
            Topic::ManagerPresence => {
                let presence = ManagerPresence::from_bytes(payload)?;
                Ok(self.on_manager_presence(presence))
            }
            other => Err(PayloadError::UnknownTopic(other.to_string())),
        }
    }

    /// Apply a new allocation. Zero means a reset round: drain and acknowledge.
    pub fn on_allocation(&mut self, charge_current: Amperes) -> Vec<Outgoing> {
        match self.phase {
            StationPhase::Disconnected => {
                debug!("Station: allocation while disconnected ignored");
                return Vec::new();
            }
            // Stays at 0 A until the manager announces itself again
            StationPhase::Suspended => {
                debug!(
                    "Station: {} allocation {} A ignored while manager offline",
                    self.station_id, charge_current
                );
                return Vec::new();
            }
            _ => {}
        }

        if charge_current == 0 {
            self.charge_rate = 0;
            self.phase = StationPhase::ResetWait;
            info!("Station: {} reset to 0 A, acknowledging", self.station_id);
            return vec![self.publish(Topic::reset(&self.grid_id))];
        }

        self.charge_rate = charge_current.min(MAX_CHARGE_CURRENT);
        self.phase = StationPhase::Charging;
        if self.charge_rate < charge_current {
            info!(
                "Station: {} allocated {} A, limited to {} A",
                self.station_id, charge_current, self.charge_rate
            );
        } else {
            info!("Station: {} charging at {} A", self.station_id, self.charge_rate);
        }
        Vec::new()
    }

    /// React to the manager's presence notice
    pub fn on_manager_presence(&mut self, presence: ManagerPresence) -> Vec<Outgoing> {
        if self.phase == StationPhase::Disconnected {
            return Vec::new();
        }

        if presence.online {
            // The manager keeps no state across restarts; announce ourselves again
            info!("Station: manager online, re-joining grid {}", self.grid_id);
            if self.phase == StationPhase::Suspended {
                self.phase = StationPhase::Idle;
            }
            vec![self.publish(Topic::join(&self.grid_id))]
        } else {
            warn!("Station: manager offline, suspending charge");
            self.charge_rate = 0;
            self.phase = StationPhase::Suspended;
            Vec::new()
        }
    }

    /// Graceful departure
    pub fn leave(&mut self) -> Outgoing {
        info!("Station: {} leaving grid {}", self.station_id, self.grid_id);
        self.charge_rate = 0;
        self.publish(Topic::leave(&self.grid_id))
    }

    /// Advance the charge simulation by one tick
    pub fn tick(&mut self) -> f64 {
        self.simulator.step(self.charge_rate)
    }

    pub fn snapshot(&self) -> StationSnapshot {
        StationSnapshot {
            grid_id: self.grid_id.clone(),
            station_id: self.station_id.clone(),
            phase: self.phase,
            charge_rate: self.charge_rate,
            charge_percent: self.simulator.percent(),
            updated_at: Utc::now(),
        }
    }

    fn event(&self) -> StationEvent {
        StationEvent::new(self.station_id.clone())
    }

    fn publish(&self, topic: String) -> Outgoing {
        Outgoing::Publish {
            topic,
            event: self.event(),
        }
    }
}

/// Copy of a station's state for console rendering
#[derive(Debug, Clone, Serialize)]
pub struct StationSnapshot {
    pub grid_id: GridId,
    pub station_id: StationId,
    pub phase: StationPhase,
    pub charge_rate: Amperes,
    pub charge_percent: f64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station() -> Station {
        Station::new(&StationConfig::new("g1", "s1").unwrap())
    }

    fn published_topics(out: &[Outgoing]) -> Vec<&str> {
        out.iter()
            .filter_map(|o| match o {
                Outgoing::Publish { topic, .. } => Some(topic.as_str()),
                Outgoing::Subscribe(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_subscribes_then_joins() {
        let mut s = station();
        let out = s.on_connected();

        assert_eq!(
            out,
            vec![
                Outgoing::Subscribe("grids/g1/properties".into()),
                Outgoing::Subscribe("services/manager".into()),
                Outgoing::Publish {
                    topic: "grids/g1/join".into(),
                    event: StationEvent::new("s1"),
                },
            ]
        );
        assert_eq!(s.phase(), StationPhase::Idle);
    }

    #[test]
    fn test_allocation_is_clamped() {
        let mut s = station();
        s.on_connected();

        assert!(s.on_allocation(60).is_empty());
        assert_eq!(s.charge_rate(), MAX_CHARGE_CURRENT);
        assert_eq!(s.phase(), StationPhase::Charging);

        s.on_allocation(20);
        assert_eq!(s.charge_rate(), 20);
    }

    #[test]
    fn test_zero_allocation_acknowledges() {
        let mut s = station();
        s.on_connected();
        s.on_allocation(30);

        let out = s.on_allocation(0);
        assert_eq!(published_topics(&out), vec!["grids/g1/reset"]);
        assert_eq!(s.charge_rate(), 0);
        assert_eq!(s.phase(), StationPhase::ResetWait);
    }

    #[test]
    fn test_manager_presence() {
        let mut s = station();
        s.on_connected();
        s.on_allocation(30);

        assert!(s.on_manager_presence(ManagerPresence::offline()).is_empty());
        assert_eq!(s.charge_rate(), 0);
        assert_eq!(s.phase(), StationPhase::Suspended);

        let out = s.on_manager_presence(ManagerPresence::online());
        assert_eq!(published_topics(&out), vec!["grids/g1/join"]);
        assert_eq!(s.phase(), StationPhase::Idle);
    }

    #[test]
    fn test_suspended_ignores_allocations_until_online() {
        let mut s = station();
        s.on_connected();
        s.on_allocation(30);
        s.on_manager_presence(ManagerPresence::offline());

        // Properties published before the offline notice can still arrive after it
        assert!(s.on_allocation(30).is_empty());
        assert!(s.on_allocation(0).is_empty());
        assert_eq!(s.charge_rate(), 0);
        assert_eq!(s.phase(), StationPhase::Suspended);

        s.on_manager_presence(ManagerPresence::online());
        s.on_allocation(30);
        assert_eq!(s.charge_rate(), 30);
        assert_eq!(s.phase(), StationPhase::Charging);
    }

    #[test]
    fn test_disconnect_zeroes_rate() {
        let mut s = station();
        s.on_connected();
        s.on_allocation(30);
        s.on_disconnected();

        assert_eq!(s.charge_rate(), 0);
        assert_eq!(s.phase(), StationPhase::Disconnected);
        assert!(s.on_allocation(30).is_empty());
        assert_eq!(s.charge_rate(), 0);
    }

    #[test]
    fn test_on_message_dispatch() {
        let mut s = station();
        s.on_connected();

        let out = s.on_message("grids/g1/properties", br#"{"charge_current":0}"#).unwrap();
        assert_eq!(published_topics(&out), vec!["grids/g1/reset"]);

        assert!(s
            .on_message("grids/g2/properties", br#"{"charge_current":10}"#)
            .unwrap()
            .is_empty());
        assert!(s.on_message("grids/g1/properties", b"garbage").is_err());
        assert!(s.on_message("grids/g1/join", br#"{"station_id":"x"}"#).is_err());
        assert_eq!(s.charge_rate(), 0);
    }

    #[test]
    fn test_last_will_is_leave() {
        let s = station();
        let (topic, event) = s.last_will();
        assert_eq!(topic, "grids/g1/leave");
        assert_eq!(event.station_id, "s1");
    }

    #[test]
    fn test_charge_simulation_saturates_and_loops() {
        let mut sim = ChargeSimulator::default();
        assert_eq!(sim.step(0), 0.0);

        // 20 A => 1% per tick
        for _ in 0..99 {
            sim.step(20);
        }
        assert!((sim.percent() - 99.0).abs() < 1e-9);
        assert_eq!(sim.step(32), 100.0);
        assert_eq!(sim.step(32), 32.0 * CHARGE_PERCENT_PER_AMP);
    }

    #[test]
    fn test_full_vehicle_waits_for_current() {
        let mut sim = ChargeSimulator::default();
        for _ in 0..100 {
            sim.step(20);
        }
        assert_eq!(sim.percent(), 100.0);

        // No current, no new vehicle
        assert_eq!(sim.step(0), 100.0);
        assert_eq!(sim.step(0), 100.0);
        assert_eq!(sim.step(20), 1.0);
    }
}
