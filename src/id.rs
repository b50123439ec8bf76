//! Compact random identifiers for groups and rules
//!
//! An [`Id`] is 4 raw bytes rendered as 8 lowercase hex characters. IDs are
//! generated randomly on create and round-trip through config files and the
//! REST API as strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IdError;

/// 4-byte identifier, rendered as 8 lowercase hex chars
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id([u8; 4]);

impl Id {
    /// Generate a random ID
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> [u8; 4] {
        self.0
    }
}

impl From<[u8; 4]> for Id {
    fn from(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Id {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 8 {
            return Err(IdError::WrongLength);
        }
        let mut bytes = [0u8; 4];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|_| IdError::NotHex(s.to_string()))?;
            bytes[i] = u8::from_str_radix(hex, 16).map_err(|_| IdError::NotHex(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let id = Id::from([0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(id.to_string(), "deadbeef");
        let parsed: Id = "deadbeef".parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.as_bytes(), [0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_wrong_length() {
        assert_eq!("deadbee".parse::<Id>().unwrap_err(), IdError::WrongLength);
        assert_eq!("deadbeef0".parse::<Id>().unwrap_err(), IdError::WrongLength);
        assert_eq!("".parse::<Id>().unwrap_err(), IdError::WrongLength);
    }

    #[test]
    fn test_not_hex() {
        assert!(matches!(
            "zzzzzzzz".parse::<Id>().unwrap_err(),
            IdError::NotHex(_)
        ));
    }

    #[test]
    fn test_leading_zero() {
        let id: Id = "00ff00ff".parse().unwrap();
        assert_eq!(id.to_string(), "00ff00ff");
    }

    #[test]
    fn test_serde_round_trip() {
        let id = Id::from([1, 2, 3, 4]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"01020304\"");
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_random_ids_differ() {
        // Collision over a handful of draws is astronomically unlikely
        let a = Id::random();
        let b = Id::random();
        let c = Id::random();
        assert!(a != b || b != c);
    }
}
