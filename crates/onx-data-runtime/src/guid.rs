use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Process-unique identifier of an asset, batch or entity.
///
/// Monotonically allocated 64-bit value; `0` means *invalid*. Serialized as a
/// decimal string in human-readable formats and as a raw `u64` otherwise.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Guid(u64);

/// Batches are identified by ordinary guids.
pub type BatchId = Guid;

static NEXT_GUID: AtomicU64 = AtomicU64::new(1);

impl Guid {
    pub const INVALID: Self = Self(0);

    /// Allocates the next process-unique guid.
    pub fn generate() -> Self {
        Self(NEXT_GUID.fetch_add(1, Ordering::Relaxed))
    }

    /// Reconstructs a guid from a serialized value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self.0)
    }
}

impl FromStr for Guid {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse::<u64>()?))
    }
}

impl Serialize for Guid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.0.to_string())
        } else {
            serializer.serialize_u64(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let text = String::deserialize(deserializer)?;
            text.parse().map_err(serde::de::Error::custom)
        } else {
            Ok(Self(u64::deserialize(deserializer)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Guid;

    #[test]
    fn generated_guids_are_unique_and_valid() {
        let a = Guid::generate();
        let b = Guid::generate();
        assert!(a.is_valid());
        assert!(b.is_valid());
        assert_ne!(a, b);
    }

    #[test]
    fn default_is_invalid() {
        assert!(!Guid::default().is_valid());
        assert_eq!(Guid::default(), Guid::INVALID);
    }

    #[test]
    fn json_round_trip_as_string() {
        let guid = Guid::from_raw(42);
        let json = serde_json::to_string(&guid).unwrap();
        assert_eq!(json, "\"42\"");
        let back: Guid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, guid);
    }

    #[test]
    fn parallel_generation_never_collides() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..100).map(|_| Guid::generate()).collect::<Vec<_>>()))
            .collect();

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for guid in handle.join().unwrap() {
                assert!(seen.insert(guid));
            }
        }
    }
}
