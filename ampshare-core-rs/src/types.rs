//! Core types for the AmpShare protocol

use serde::{Deserialize, Serialize};

use crate::error::PayloadError;

/// Identifier of a grid (opaque string key)
pub type GridId = String;

/// Identifier of a station, unique within its grid
pub type StationId = String;

/// Current in whole amperes
pub type Amperes = u32;

/// Payload of `join`, `leave` and `reset` messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationEvent {
    pub station_id: StationId,
}

impl StationEvent {
    pub fn new(station_id: impl Into<StationId>) -> Self {
        Self {
            station_id: station_id.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse and validate. A missing, empty or wildcard-bearing `station_id`
    /// is rejected here so handlers only ever see usable ids.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        let event: StationEvent = serde_json::from_slice(bytes).map_err(|e| {
            if e.is_data() {
                PayloadError::MissingStationId
            } else {
                PayloadError::Json(e)
            }
        })?;

        if event.station_id.is_empty() {
            return Err(PayloadError::MissingStationId);
        }
        if !is_valid_identifier(&event.station_id) {
            return Err(PayloadError::InvalidIdentifier(event.station_id));
        }
        Ok(event)
    }
}

/// Payload of `grids/{grid}/properties`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridProperties {
    pub charge_current: Amperes,
}

impl GridProperties {
    pub fn new(charge_current: Amperes) -> Self {
        Self { charge_current }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Payload of `services/manager`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerPresence {
    pub online: bool,
}

impl ManagerPresence {
    pub fn online() -> Self {
        Self { online: true }
    }

    pub fn offline() -> Self {
        Self { online: false }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Grid and station ids end up inside topic names, so they must not
/// contain level separators or wildcards.
pub fn is_valid_identifier(id: &str) -> bool {
    !id.is_empty() && !id.contains(['/', '+', '#'])
}
