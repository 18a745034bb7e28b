//! Time-sortable 128-bit identifiers used for leases, run ids and cron item ids.
//!
//! Layout: 48 bits of unix milliseconds followed by 80 random bits, written as
//! 26 Crockford base32 characters. Lexicographic order matches time order.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const ENCODED_LEN: usize = 26;
const RANDOM_MASK: u128 = (1u128 << 80) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ulid(u128);

/// Lease ids embed the lease expiry as their timestamp.
pub type LeaseId = Ulid;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UlidParseError {
    #[error("ulid must be {ENCODED_LEN} characters, got {0}")]
    Length(usize),
    #[error("invalid character {0:?} in ulid")]
    Char(char),
}

impl Ulid {
    /// New id stamped at `ms` with fresh entropy.
    pub fn new(ms: i64) -> Self {
        let random: u128 = rand::random::<u128>() & RANDOM_MASK;
        Self::from_parts(ms, random)
    }

    pub fn from_parts(ms: i64, random: u128) -> Self {
        let ts = (ms.max(0) as u128) & ((1u128 << 48) - 1);
        Ulid((ts << 80) | (random & RANDOM_MASK))
    }

    /// Embedded timestamp in unix ms.
    pub fn timestamp_ms(&self) -> i64 {
        (self.0 >> 80) as i64
    }

    /// True once the embedded timestamp is at or before `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.timestamp_ms() <= now_ms
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }
}

impl fmt::Display for Ulid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [0u8; ENCODED_LEN];
        let mut v = self.0;
        for slot in buf.iter_mut().rev() {
            *slot = ALPHABET[(v & 0x1f) as usize];
            v >>= 5;
        }
        // every byte comes from ALPHABET
        f.write_str(std::str::from_utf8(&buf).map_err(|_| fmt::Error)?)
    }
}

impl FromStr for Ulid {
    type Err = UlidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ENCODED_LEN {
            return Err(UlidParseError::Length(s.len()));
        }
        let mut v: u128 = 0;
        for c in s.chars() {
            let upper = c.to_ascii_uppercase();
            let idx = ALPHABET
                .iter()
                .position(|&a| a as char == upper)
                .ok_or(UlidParseError::Char(c))?;
            v = (v << 5) | idx as u128;
        }
        Ok(Ulid(v))
    }
}

impl Serialize for Ulid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ulid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_parse_keeps_timestamp() {
        let id = Ulid::new(1_700_000_000_123);
        let parsed: Ulid = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.timestamp_ms(), 1_700_000_000_123);
    }

    #[test]
    fn string_order_follows_time() {
        let a = Ulid::from_parts(1_000, RANDOM_MASK);
        let b = Ulid::from_parts(1_001, 0);
        assert!(a.to_string() < b.to_string());
        assert!(a < b);
    }

    #[test]
    fn expiry_is_inclusive_of_timestamp() {
        let id = Ulid::from_parts(5_000, 7);
        assert!(!id.is_expired(4_999));
        assert!(id.is_expired(5_000));
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!("abc".parse::<Ulid>(), Err(UlidParseError::Length(3)));
        let bad = "U".repeat(ENCODED_LEN);
        assert_eq!(bad.parse::<Ulid>(), Err(UlidParseError::Char('U')));
    }
}
