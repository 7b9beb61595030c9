//! Typed cell values and the codec that moves them on and off the wire.
//!
//! The driver never interprets a cell beyond its declared [`SqlType`]; the actual
//! byte layout is delegated to a [`ValueCodec`]. [`BincodeCodec`] is the default
//! and uses the same big-endian fixed-int configuration as message framing.
use std::fmt;

use bincode::{Decode, Encode, decode_from_std_read, encode_into_std_write};
use thiserror::Error;

use crate::protocol::wire_config;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode value: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode {sql_type:?} value: {source}")]
    Decode {
        sql_type: SqlType,
        source: bincode::error::DecodeError,
    },

    #[error("value {value} does not match declared type {sql_type:?}")]
    Mismatch { sql_type: SqlType, value: String },

    #[error("null values are carried out of band and cannot be encoded")]
    Null,
}

/// Declared column or parameter type.
#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq, Hash)]
pub enum SqlType {
    Boolean,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Decimal,
    Char,
    Varchar,
    LongVarchar,
    Binary,
    VarBinary,
    /// Days since 1970-01-01.
    Date,
    /// Milliseconds since midnight.
    Time,
    /// Milliseconds since the Unix epoch.
    Timestamp,
}

impl SqlType {
    pub fn is_text(self) -> bool {
        matches!(self, SqlType::Char | SqlType::Varchar | SqlType::LongVarchar)
    }
}

/// A single decoded cell.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Real(f32),
    Double(f64),
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    Date(i32),
    Time(i64),
    Timestamp(i64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Natural declared type for a value, used when binding parameters.
    pub fn sql_type(&self) -> Option<SqlType> {
        Some(match self {
            Value::Null => return None,
            Value::Boolean(_) => SqlType::Boolean,
            Value::SmallInt(_) => SqlType::SmallInt,
            Value::Integer(_) => SqlType::Integer,
            Value::BigInt(_) => SqlType::BigInt,
            Value::Real(_) => SqlType::Real,
            Value::Double(_) => SqlType::Double,
            Value::Decimal(_) => SqlType::Decimal,
            Value::Text(_) => SqlType::Varchar,
            Value::Bytes(_) => SqlType::VarBinary,
            Value::Date(_) => SqlType::Date,
            Value::Time(_) => SqlType::Time,
            Value::Timestamp(_) => SqlType::Timestamp,
        })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::SmallInt(v) => Some(v.into()),
            Value::Integer(v) => Some(v.into()),
            Value::BigInt(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::SmallInt(v) => write!(f, "{v}"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::BigInt(v) => write!(f, "{v}"),
            Value::Real(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Decimal(v) | Value::Text(v) => write!(f, "{v}"),
            Value::Bytes(v) => {
                write!(f, "0x")?;
                v.iter().try_for_each(|b| write!(f, "{b:02x}"))
            }
            Value::Date(v) => write!(f, "date({v})"),
            Value::Time(v) => write!(f, "time({v})"),
            Value::Timestamp(v) => write!(f, "timestamp({v})"),
        }
    }
}

/// Serializes one typed value to a byte stream, and reads one back given its
/// declared type.
pub trait ValueCodec: Send + Sync {
    fn encode(&self, sql_type: SqlType, value: &Value, out: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Reads exactly one value from the front of `input`, advancing it.
    fn decode(&self, sql_type: SqlType, input: &mut &[u8]) -> Result<Value, CodecError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl BincodeCodec {
    fn read<T: Decode<()>>(sql_type: SqlType, input: &mut &[u8]) -> Result<T, CodecError> {
        decode_from_std_read(input, wire_config())
            .map_err(|source| CodecError::Decode { sql_type, source })
    }
}

impl ValueCodec for BincodeCodec {
    fn encode(&self, sql_type: SqlType, value: &Value, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let config = wire_config();
        match (sql_type, value) {
            (_, Value::Null) => return Err(CodecError::Null),
            (SqlType::Boolean, Value::Boolean(v)) => encode_into_std_write(v, out, config)?,
            (SqlType::SmallInt, Value::SmallInt(v)) => encode_into_std_write(v, out, config)?,
            (SqlType::Integer, Value::Integer(v)) => encode_into_std_write(v, out, config)?,
            (SqlType::BigInt, Value::BigInt(v)) => encode_into_std_write(v, out, config)?,
            (SqlType::Real, Value::Real(v)) => encode_into_std_write(v, out, config)?,
            (SqlType::Double, Value::Double(v)) => encode_into_std_write(v, out, config)?,
            (SqlType::Decimal, Value::Decimal(v)) => encode_into_std_write(v, out, config)?,
            (t, Value::Text(v)) if t.is_text() => encode_into_std_write(v, out, config)?,
            (SqlType::Binary | SqlType::VarBinary, Value::Bytes(v)) => {
                encode_into_std_write(v, out, config)?
            }
            (SqlType::Date, Value::Date(v)) => encode_into_std_write(v, out, config)?,
            (SqlType::Time, Value::Time(v)) => encode_into_std_write(v, out, config)?,
            (SqlType::Timestamp, Value::Timestamp(v)) => encode_into_std_write(v, out, config)?,
            (sql_type, value) => {
                return Err(CodecError::Mismatch {
                    sql_type,
                    value: value.to_string(),
                });
            }
        };
        Ok(())
    }

    fn decode(&self, sql_type: SqlType, input: &mut &[u8]) -> Result<Value, CodecError> {
        Ok(match sql_type {
            SqlType::Boolean => Value::Boolean(Self::read(sql_type, input)?),
            SqlType::SmallInt => Value::SmallInt(Self::read(sql_type, input)?),
            SqlType::Integer => Value::Integer(Self::read(sql_type, input)?),
            SqlType::BigInt => Value::BigInt(Self::read(sql_type, input)?),
            SqlType::Real => Value::Real(Self::read(sql_type, input)?),
            SqlType::Double => Value::Double(Self::read(sql_type, input)?),
            SqlType::Decimal => Value::Decimal(Self::read(sql_type, input)?),
            SqlType::Char | SqlType::Varchar | SqlType::LongVarchar => {
                Value::Text(Self::read(sql_type, input)?)
            }
            SqlType::Binary | SqlType::VarBinary => Value::Bytes(Self::read(sql_type, input)?),
            SqlType::Date => Value::Date(Self::read(sql_type, input)?),
            SqlType::Time => Value::Time(Self::read(sql_type, input)?),
            SqlType::Timestamp => Value::Timestamp(Self::read(sql_type, input)?),
        })
    }
}
