//! # Primary Key Values
//!
//! Chunk boundaries are expressed as typed primary-key values. Every kind
//! has an explicit arithmetic and comparison table; combining two different
//! kinds is rejected with [`CdcError::KeyArithmetic`] instead of widening
//! silently.
//!
//! | Kind | `plus(n)` | `minus(other)` | ordering |
//! |------|-----------|----------------|----------|
//! | `Int` | checked `i32` add | exact | numeric |
//! | `Long` | checked `i64` add | exact | numeric |
//! | `BigInt` | unbounded | exact | numeric |
//! | `Decimal` | exact | exact | numeric |
//! | `String` | unsupported | unsupported | lexicographic |

use crate::common::{CdcError, Result};
use bigdecimal::BigDecimal;
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Column types reported by a source catalog for a primary-key column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Int,
    Long,
    BigInt,
    Decimal,
    String,
    Boolean,
    Float,
    Double,
    Binary,
    Json,
    /// Source-specific type without a mapping
    Other(String),
}

/// Primary-key kinds that can be used to split a table into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKeyType {
    Int,
    Long,
    BigInt,
    Decimal,
    String,
}

impl ChunkKeyType {
    /// Integral keys can be range-partitioned with evenly spaced bounds.
    pub fn is_integral(&self) -> bool {
        matches!(self, Self::Int | Self::Long | Self::BigInt)
    }
}

impl TryFrom<&ColumnKind> for ChunkKeyType {
    type Error = CdcError;

    fn try_from(kind: &ColumnKind) -> Result<Self> {
        match kind {
            ColumnKind::Int => Ok(Self::Int),
            ColumnKind::Long => Ok(Self::Long),
            ColumnKind::BigInt => Ok(Self::BigInt),
            ColumnKind::Decimal => Ok(Self::Decimal),
            ColumnKind::String => Ok(Self::String),
            // NaN breaks total ordering for floating point keys
            other => Err(CdcError::unsupported_key_type(format!("{other:?}"))),
        }
    }
}

/// Primary-key column metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyColumn {
    /// Column name
    pub name: String,
    /// Catalog type
    pub kind: ColumnKind,
}

impl KeyColumn {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// A typed primary-key value.
///
/// The derived [`Ord`] orders values of different kinds by kind, which keeps
/// keyed collections well-defined. Use [`KeyValue::try_compare`] where mixing
/// kinds is a bug.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum KeyValue {
    Int(i32),
    Long(i64),
    BigInt(#[serde(with = "bigint_string")] BigInt),
    Decimal(BigDecimal),
    String(String),
}

impl KeyValue {
    /// Kind of this value.
    pub fn key_type(&self) -> ChunkKeyType {
        match self {
            Self::Int(_) => ChunkKeyType::Int,
            Self::Long(_) => ChunkKeyType::Long,
            Self::BigInt(_) => ChunkKeyType::BigInt,
            Self::Decimal(_) => ChunkKeyType::Decimal,
            Self::String(_) => ChunkKeyType::String,
        }
    }

    /// Compare two values of the same kind.
    pub fn try_compare(&self, other: &KeyValue) -> Result<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(a.cmp(b)),
            (Self::Long(a), Self::Long(b)) => Ok(a.cmp(b)),
            (Self::BigInt(a), Self::BigInt(b)) => Ok(a.cmp(b)),
            (Self::Decimal(a), Self::Decimal(b)) => Ok(a.cmp(b)),
            (Self::String(a), Self::String(b)) => Ok(a.cmp(b)),
            (a, b) => Err(CdcError::key_arithmetic(format!(
                "cannot compare {:?} with {:?}",
                a.key_type(),
                b.key_type()
            ))),
        }
    }

    /// Add an integer to a numeric key without changing its kind.
    pub fn plus(&self, augend: i64) -> Result<KeyValue> {
        let overflow = || CdcError::key_arithmetic(format!("{self} + {augend} overflows"));
        match self {
            Self::Int(v) => {
                let augend = i32::try_from(augend).map_err(|_| overflow())?;
                v.checked_add(augend).map(Self::Int).ok_or_else(overflow)
            }
            Self::Long(v) => v.checked_add(augend).map(Self::Long).ok_or_else(overflow),
            Self::BigInt(v) => Ok(Self::BigInt(v + BigInt::from(augend))),
            Self::Decimal(v) => Ok(Self::Decimal(v.clone() + BigDecimal::from(augend))),
            Self::String(_) => Err(CdcError::key_arithmetic(
                "unsupported type String for numeric plus",
            )),
        }
    }

    /// Exact difference `self - subtrahend` of two keys of the same kind.
    pub fn minus(&self, subtrahend: &KeyValue) -> Result<BigDecimal> {
        match (self, subtrahend) {
            (Self::Int(a), Self::Int(b)) => Ok(BigDecimal::from(*a as i64 - *b as i64)),
            (Self::Long(a), Self::Long(b)) => Ok(BigDecimal::new(
                BigInt::from(*a) - BigInt::from(*b),
                0,
            )),
            (Self::BigInt(a), Self::BigInt(b)) => Ok(BigDecimal::new(a - b, 0)),
            (Self::Decimal(a), Self::Decimal(b)) => Ok(a.clone() - b.clone()),
            (Self::String(_), Self::String(_)) => Err(CdcError::key_arithmetic(
                "unsupported type String for numeric minus",
            )),
            (a, b) => Err(CdcError::key_arithmetic(format!(
                "the minuend type {:?} is different from the subtrahend type {:?}",
                a.key_type(),
                b.key_type()
            ))),
        }
    }

    /// Extract a key of the given kind from a JSON cell.
    ///
    /// Numbers and their string renderings are both accepted so that sources
    /// emitting big integers as strings round-trip.
    pub fn from_json(value: &serde_json::Value, key_type: ChunkKeyType) -> Result<KeyValue> {
        use serde_json::Value;

        let mismatch = || CdcError::schema(format!("cannot read {key_type:?} key from {value}"));
        match (key_type, value) {
            (ChunkKeyType::Int, Value::Number(n)) => n
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(Self::Int)
                .ok_or_else(mismatch),
            (ChunkKeyType::Long, Value::Number(n)) => {
                n.as_i64().map(Self::Long).ok_or_else(mismatch)
            }
            (ChunkKeyType::BigInt, Value::Number(n)) => BigInt::from_str(&n.to_string())
                .map(Self::BigInt)
                .map_err(|_| mismatch()),
            (ChunkKeyType::BigInt, Value::String(s)) => {
                BigInt::from_str(s).map(Self::BigInt).map_err(|_| mismatch())
            }
            (ChunkKeyType::Decimal, Value::Number(n)) => BigDecimal::from_str(&n.to_string())
                .map(Self::Decimal)
                .map_err(|_| mismatch()),
            (ChunkKeyType::Decimal, Value::String(s)) => BigDecimal::from_str(s)
                .map(Self::Decimal)
                .map_err(|_| mismatch()),
            (ChunkKeyType::String, Value::String(s)) => Ok(Self::String(s.clone())),
            _ => Err(mismatch()),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::BigInt(v) => write!(f, "{v}"),
            Self::Decimal(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "'{v}'"),
        }
    }
}

impl From<i32> for KeyValue {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

mod bigint_string {
    use num_bigint::BigInt;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(value: &BigInt, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigInt, D::Error> {
        let s = String::deserialize(deserializer)?;
        BigInt::from_str(&s).map_err(serde::de::Error::custom)
    }
}
