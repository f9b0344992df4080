//! Configuration for the manager and station services
//!
//! Combines broker connection settings with protocol tunables.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::registry::DEFAULT_GRID_CAPACITY;
use crate::types::{is_valid_identifier, Amperes, GridId, StationId};

/// Broker address parsed from `scheme://host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerUri {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl FromStr for BrokerUri {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| ConfigError::MalformedUri(s.to_string()))?;

        if !matches!(scheme, "mqtt" | "tcp") {
            return Err(ConfigError::UnsupportedScheme(scheme.to_string()));
        }

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::MalformedUri(s.to_string()))?;

        if host.is_empty() || host.contains('/') {
            return Err(ConfigError::MalformedUri(s.to_string()));
        }

        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| ConfigError::InvalidPort(s.to_string()))?;

        Ok(Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for BrokerUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Connection settings shared by both services
#[derive(Debug, Clone)]
pub struct BusOptions {
    pub broker: BrokerUri,

    /// MQTT client id
    pub client_id: String,

    /// Keep-alive interval; also bounds how quickly a dead peer's will fires
    pub keep_alive: Duration,

    /// Initial reconnect delay
    pub reconnect_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    pub max_reconnect_delay: Duration,

    /// Request queue capacity of the client
    pub queue_capacity: usize,
}

impl BusOptions {
    pub fn new(broker: BrokerUri, client_id: impl Into<String>) -> Self {
        Self {
            broker,
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(5),
            reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(30),
            queue_capacity: 64,
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }
}

/// Manager tunables
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Capacity given to grids created on first join
    pub default_capacity: Amperes,

    /// How long a reset round may wait for acknowledgements
    pub reset_timeout: Duration,

    /// Zero re-broadcasts before a round completes without every acknowledgement
    pub max_reset_retries: u32,

    /// How often open rounds are checked against the timeout
    pub timeout_check_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_capacity: DEFAULT_GRID_CAPACITY,
            reset_timeout: Duration::from_secs(5),
            max_reset_retries: 3,
            timeout_check_interval: Duration::from_millis(500),
        }
    }
}

impl ManagerConfig {
    pub fn with_capacity(mut self, capacity: Amperes) -> Self {
        self.default_capacity = capacity;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_max_reset_retries(mut self, retries: u32) -> Self {
        self.max_reset_retries = retries;
        self
    }

    pub fn with_timeout_check_interval(mut self, interval: Duration) -> Self {
        self.timeout_check_interval = interval;
        self
    }
}

/// Station identity and simulation settings
#[derive(Debug, Clone)]
pub struct StationConfig {
    pub grid_id: GridId,
    pub station_id: StationId,

    /// Charge simulation time step
    pub tick: Duration,
}

impl StationConfig {
    /// Validate ids; they become topic levels
    pub fn new(
        grid_id: impl Into<GridId>,
        station_id: impl Into<StationId>,
    ) -> Result<Self, ConfigError> {
        let grid_id = grid_id.into();
        let station_id = station_id.into();

        if !is_valid_identifier(&grid_id) {
            return Err(ConfigError::InvalidIdentifier {
                kind: "grid id",
                value: grid_id,
            });
        }
        if !is_valid_identifier(&station_id) {
            return Err(ConfigError::InvalidIdentifier {
                kind: "station id",
                value: station_id,
            });
        }

        Ok(Self {
            grid_id,
            station_id,
            tick: Duration::from_secs(1),
        })
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}
