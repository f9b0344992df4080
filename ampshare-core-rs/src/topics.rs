//! Topic layout of the AmpShare bus
//!
//! | Topic                        | Direction          |
//! |------------------------------|--------------------|
//! | `grids/{grid}/join`          | station -> manager |
//! | `grids/{grid}/leave`         | station -> manager |
//! | `grids/{grid}/reset`         | station -> manager |
//! | `grids/{grid}/properties`    | manager -> station |
//! | `services/manager`           | manager -> station |

use crate::error::PayloadError;
use crate::types::{is_valid_identifier, GridId};

/// Manager liveness topic
pub const MANAGER_PRESENCE: &str = "services/manager";

/// Wildcard filters the manager installs on every connect
pub const JOIN_FILTER: &str = "grids/+/join";
pub const LEAVE_FILTER: &str = "grids/+/leave";
pub const RESET_FILTER: &str = "grids/+/reset";

const GRIDS: &str = "grids";

/// A parsed AmpShare topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Join(GridId),
    Leave(GridId),
    Reset(GridId),
    Properties(GridId),
    ManagerPresence,
}

impl Topic {
    /// Parse a concrete (non-wildcard) topic name
    pub fn parse(topic: &str) -> Result<Self, PayloadError> {
        if topic == MANAGER_PRESENCE {
            return Ok(Topic::ManagerPresence);
        }

        let mut levels = topic.split('/');
        match (levels.next(), levels.next(), levels.next(), levels.next()) {
            (Some(GRIDS), Some(grid), Some(kind), None) if is_valid_identifier(grid) => {
                let grid = grid.to_string();
                match kind {
                    "join" => Ok(Topic::Join(grid)),
                    "leave" => Ok(Topic::Leave(grid)),
                    "reset" => Ok(Topic::Reset(grid)),
                    "properties" => Ok(Topic::Properties(grid)),
                    _ => Err(PayloadError::UnknownTopic(topic.to_string())),
                }
            }
            _ => Err(PayloadError::UnknownTopic(topic.to_string())),
        }
    }

    pub fn join(grid: &str) -> String {
        format!("{}/{}/join", GRIDS, grid)
    }

    pub fn leave(grid: &str) -> String {
        format!("{}/{}/leave", GRIDS, grid)
    }

    pub fn reset(grid: &str) -> String {
        format!("{}/{}/reset", GRIDS, grid)
    }

    pub fn properties(grid: &str) -> String {
        format!("{}/{}/properties", GRIDS, grid)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::Join(g) => f.write_str(&Topic::join(g)),
            Topic::Leave(g) => f.write_str(&Topic::leave(g)),
            Topic::Reset(g) => f.write_str(&Topic::reset(g)),
            Topic::Properties(g) => f.write_str(&Topic::properties(g)),
            Topic::ManagerPresence => f.write_str(MANAGER_PRESENCE),
        }
    }
}

/// MQTT topic filter matching (`+` matches one level, a trailing `#` matches the rest)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
