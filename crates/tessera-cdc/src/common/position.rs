//! # Log Positions
//!
//! Opaque, totally ordered coordinates into a source's change log.
//!
//! A [`LogPosition`] is a 64-bit monotonic value. Sources map their native
//! coordinates onto it:
//!
//! | Source | Native format | Mapping |
//! |--------|---------------|---------|
//! | PostgreSQL | LSN `16/B374D848` | high/low 32-bit halves |
//! | MySQL | binlog `mysql-bin.000003:12345` | file sequence / offset |
//!
//! Positions serialize as the LSN-style string `HI/LO` (hex), so persisted
//! checkpoints stay human-readable.

use crate::common::{CdcError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A point in the change log.
///
/// Two readers observing the same position see the same logical cut of
/// the log. Positions grow strictly as the log advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LogPosition(u64);

impl LogPosition {
    /// The position before any log record.
    pub const ZERO: LogPosition = LogPosition(0);

    /// Create a position from its raw offset.
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Create a position from a binlog file sequence number and byte offset.
    pub fn from_binlog(file_sequence: u32, offset: u32) -> Self {
        Self(((file_sequence as u64) << 32) | offset as u64)
    }

    /// Raw offset value.
    pub fn offset(&self) -> u64 {
        self.0
    }

    /// Binlog file sequence and byte offset for binlog-based sources.
    pub fn as_binlog(&self) -> (u32, u32) {
        ((self.0 >> 32) as u32, (self.0 & 0xFFFF_FFFF) as u32)
    }

    /// The position immediately after this one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for LogPosition {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        let (high, low) = s
            .split_once('/')
            .ok_or_else(|| CdcError::config(format!("invalid log position: {s}")))?;
        let high = u64::from_str_radix(high, 16)
            .map_err(|e| CdcError::config(format!("invalid log position {s}: {e}")))?;
        let low = u64::from_str_radix(low, 16)
            .map_err(|e| CdcError::config(format!("invalid log position {s}: {e}")))?;
        if high > u32::MAX as u64 || low > u32::MAX as u64 {
            return Err(CdcError::config(format!("log position out of range: {s}")));
        }
        Ok(Self((high << 32) | low))
    }
}

impl From<u64> for LogPosition {
    fn from(offset: u64) -> Self {
        Self(offset)
    }
}

impl Serialize for LogPosition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LogPosition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
