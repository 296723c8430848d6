//! Common types used throughout the FerrumQ system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Timestamp type for message creation and expiration arithmetic.
pub type Timestamp = DateTime<Utc>;

/// Message priority in the range `0..=9`, selecting one of ten queue lanes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    /// Lowest priority.
    pub const MIN: Self = Self(0);

    /// Highest priority.
    pub const MAX: Self = Self(9);

    /// Number of distinct priority lanes.
    pub const COUNT: usize = 10;

    /// Create a new priority.
    ///
    /// # Errors
    /// Returns an error if `value` is outside `0..=9`.
    pub fn new(value: u8) -> crate::Result<Self> {
        if value > Self::MAX.0 {
            return Err(crate::Error::InvalidMessage {
                message: format!("priority {value} out of range 0..=9"),
            });
        }
        Ok(Self(value))
    }

    /// Get the raw priority value.
    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }

    /// Get the lane index for this priority.
    #[must_use]
    pub const fn lane(self) -> usize {
        self.0 as usize
    }

    /// Iterate over all priorities, lowest first.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..=Self::MAX.0).map(Self)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u8> for Priority {
    type Error = crate::Error;

    fn try_from(value: u8) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

/// Surrogate unique identifier for a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueId(Uuid);

impl QueueId {
    /// Generate a new unique queue ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for QueueId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new unique session ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a session ID from its string form.
    ///
    /// # Errors
    /// Returns an error if `s` is not a valid UUID.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let uuid = Uuid::parse_str(s).map_err(|e| crate::Error::InvalidMessage {
            message: format!("invalid session id {s:?}: {e}"),
        })?;
        Ok(Self(uuid))
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome class of a completed request, attached to every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionCode {
    /// Request succeeded
    Ok,
    /// Request completed without its primary effect (e.g. get timeout)
    Warn,
    /// Request failed
    Fail,
}

impl fmt::Display for CompletionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Warn => write!(f, "WARN"),
            Self::Fail => write!(f, "FAIL"),
        }
    }
}
