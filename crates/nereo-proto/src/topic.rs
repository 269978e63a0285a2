//! Push topics.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Logical push stream. One SSE connection exists per topic and tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Kanban-level booking changes for the operator kiosk.
    Bookings,
    /// Dashboard KPI and revenue changes for the admin dashboard.
    Analytics,
}

impl Topic {
    /// Every topic.
    pub const ALL: [Self; 2] = [Self::Bookings, Self::Analytics];

    /// Path segment and cache-key root for this topic.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bookings => "bookings",
            Self::Analytics => "analytics",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown topic name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown topic: {0}")]
pub struct UnknownTopic(pub String);

impl FromStr for Topic {
    type Err = UnknownTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|t| t.as_str() == s).ok_or_else(|| UnknownTopic(s.to_owned()))
    }
}
