//! Identifier types shared between the signaling service and its test utilities.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque room identifier.
///
/// Rooms are either reserved static rooms (e.g. `"9999"`) or generated
/// collision-resistant IDs. The gateway may report a room as a JSON number
/// or a JSON string, so both forms deserialize into the same value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Create a room ID from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new random room ID (32 hex characters).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// The ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The numeric form of the ID, if it has one.
    #[must_use]
    pub fn as_numeric(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RoomId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Str(s) => Self(s),
            Raw::Num(n) => Self(n.to_string()),
        })
    }
}

/// Locally generated participant identifier (one per signaling connection).
///
/// This is not the account ID; it only lives as long as the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub Uuid);

impl ParticipantId {
    /// Create a new random participant ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Gateway-assigned identifier of a participant's outbound media stream.
///
/// Numeric by default; string when the gateway runs with string IDs.
/// Serializes back in the form it arrived in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeedId {
    Numeric(u64),
    Text(String),
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedId::Numeric(n) => write!(f, "{n}"),
            FeedId::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for FeedId {
    fn from(value: u64) -> Self {
        FeedId::Numeric(value)
    }
}

impl From<&str> for FeedId {
    fn from(value: &str) -> Self {
        FeedId::Text(value.to_string())
    }
}

/// Correlation ID attached to gateway join requests.
///
/// The gateway requires a numeric value, so this is a random `u32` rather
/// than the participant's UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrivateId(pub u32);

impl PrivateId {
    /// Generate a new random private ID (never zero).
    #[must_use]
    pub fn generate() -> Self {
        Self(rand::random::<u32>().max(1))
    }
}
