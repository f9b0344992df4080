//! AmpShare Core Library
//!
//! Fair-share charging current allocation for groups of EV charging stations
//! ("grids") coordinated over an MQTT bus.
//!
//! ## Architecture
//!
//! ```text
//!  Station ──join/leave/reset──►  MQTT  ──► Manager
//!     ▲                                        │
//!     └──────── grids/{grid}/properties ◄──────┘
//! ```
//!
//! The manager and station state machines ([`Manager`], [`Station`]) are pure;
//! [`ManagerService`] and [`StationService`] connect them to a [`BusClient`].

pub mod allocation;
pub mod config;
pub mod error;
pub mod manager;
pub mod memory;
pub mod registry;
pub mod service;
pub mod station;
pub mod topics;
pub mod transport;
pub mod types;

pub use allocation::{compute_allocation, ResetRound};
pub use config::{BrokerUri, BusOptions, ManagerConfig, StationConfig};
pub use error::{ConfigError, PayloadError, TransportError};
pub use manager::{Allocation, Manager, ManagerEvent};
pub use memory::{MemoryBroker, MemoryClient};
pub use registry::{Grid, GridRegistry, RegistrySnapshot, DEFAULT_GRID_CAPACITY};
pub use service::{manager_will, station_will, ManagerService, StationService};
pub use station::{Station, StationPhase, StationSnapshot, MAX_CHARGE_CURRENT};
pub use topics::Topic;
pub use transport::{BusClient, BusEvent, BusEvents, MqttBus, Will};
pub use types::*;
