//! Unix timestamp type for message and record fields.
//!
//! Task-protocol messages and settlement records carry plain integer second
//! counts on the wire; token records carry 4-byte big-endian seconds. This
//! type keeps the arithmetic in one place.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::Add;
use std::time::SystemTime;

/// Seconds since the Unix epoch (1970-01-01T00:00:00Z).
///
/// Serialized as a JSON integer, matching the task-protocol wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimestamp(u64);

impl UnixTimestamp {
    /// Creates a [`UnixTimestamp`] from a raw seconds value.
    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Returns the current system time as a [`UnixTimestamp`].
    ///
    /// # Panics
    ///
    /// Panics if the system clock is set before the Unix epoch.
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("SystemTime before UNIX epoch?!?")
            .as_secs();
        Self(now)
    }

    /// Returns the timestamp as raw seconds since the Unix epoch.
    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// Returns the timestamp truncated to the token wire width (4 bytes).
    pub fn as_u32(&self) -> u32 {
        self.0.min(u32::MAX as u64) as u32
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        UnixTimestamp(self.0 + rhs)
    }
}

impl From<u32> for UnixTimestamp {
    fn from(secs: u32) -> Self {
        UnixTimestamp(secs as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_integer() {
        let ts = UnixTimestamp::from_secs(1_700_000_000);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "1700000000");
        let back: UnixTimestamp = serde_json::from_str("1700000000").unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn test_ordering_and_add() {
        let issued = UnixTimestamp::from_secs(100);
        let expires = issued + 3600;
        assert!(issued < expires);
        assert_eq!(expires.as_secs(), 3700);
    }
}
