use std::fmt;
use std::sync::Arc;

/// A strongly typed identifier for a karaoke Room.
/// Wraps an `Arc<str>` for cheap cloning.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(pub Arc<str>);

/// A strongly typed identifier for one member of a room's bus.
/// Wraps an `Arc<str>` for cheap cloning.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberId(pub Arc<str>);

impl MemberId {
    pub fn random() -> Self {
        MemberId(Arc::from(uuid::Uuid::new_v4().to_string()))
    }
}

// Implement Display for easy logging
impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Implement conversion from String/&str
impl From<String> for RoomId {
    fn from(s: String) -> Self {
        RoomId(Arc::from(s))
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        RoomId(Arc::from(s))
    }
}

impl From<String> for MemberId {
    fn from(s: String) -> Self {
        MemberId(Arc::from(s))
    }
}

impl From<&str> for MemberId {
    fn from(s: &str) -> Self {
        MemberId(Arc::from(s))
    }
}

// Helper for referencing the inner string
impl AsRef<str> for RoomId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for MemberId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
