use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Arbitrary-precision decimal, kept exact across database round trips.
///
/// Stored as an unscaled integer plus a base-10 scale, so `1.10` and
/// `1.1` compare equal while neither loses digits.
#[derive(Debug, Clone, Copy)]
pub struct Decimal {
    unscaled: i128,
    scale: u32,
}

impl Decimal {
    pub const fn new(unscaled: i128, scale: u32) -> Self {
        Decimal { unscaled, scale }
    }

    pub fn unscaled(&self) -> i128 {
        self.unscaled
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Strip trailing zero digits so equal quantities share one form.
    fn normalized(&self) -> (i128, u32) {
        let mut unscaled = self.unscaled;
        let mut scale = self.scale;
        while scale > 0 && unscaled % 10 == 0 {
            unscaled /= 10;
            scale -= 1;
        }
        (unscaled, scale)
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for Decimal {}

impl Hash for Decimal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.unscaled);
        }
        let sign = if self.unscaled < 0 { "-" } else { "" };
        let digits = self.unscaled.unsigned_abs().to_string();
        let scale = self.scale as usize;
        if digits.len() > scale {
            let (int, frac) = digits.split_at(digits.len() - scale);
            write!(f, "{sign}{int}.{frac}")
        } else {
            write!(f, "{sign}0.{:0>width$}", digits, width = scale)
        }
    }
}

impl FromStr for Decimal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::InvalidDecimal(s.to_string());
        let (sign, body) = match s.strip_prefix('-') {
            Some(rest) => (-1i128, rest),
            None => (1i128, s.strip_prefix('+').unwrap_or(s)),
        };
        if body.is_empty() {
            return Err(bad());
        }
        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => (i, f),
            None => (body, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(bad());
        }
        let mut unscaled: i128 = 0;
        for ch in int_part.chars().chain(frac_part.chars()) {
            let digit = ch.to_digit(10).ok_or_else(bad)? as i128;
            unscaled = unscaled
                .checked_mul(10)
                .and_then(|v| v.checked_add(digit))
                .ok_or_else(bad)?;
        }
        Ok(Decimal::new(sign * unscaled, frac_part.len() as u32))
    }
}

/// A single typed cell value, in memory or on the wire.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Decimal(Decimal),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Decimal(_) => "decimal",
        }
    }
}

// Floats compare bitwise here: values are compared for cache keying and
// checkpoint diffing, where NaN must equal itself.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Int(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Value::Float(f) => {
                3u8.hash(state);
                f.to_bits().hash(state);
            }
            Value::Text(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            Value::Bytes(b) => {
                5u8.hash(state);
                b.hash(state);
            }
            Value::Decimal(d) => {
                6u8.hash(state);
                d.hash(state);
            }
        }
    }
}

/// Declared kind of a column, with conversions between the in-memory
/// representation and the database-native one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    Decimal,
}

impl Kind {
    pub fn name(&self) -> &'static str {
        match self {
            Kind::Bool => "bool",
            Kind::Int => "int",
            Kind::Float => "float",
            Kind::Text => "text",
            Kind::Bytes => "bytes",
            Kind::Decimal => "decimal",
        }
    }

    /// Convert an in-memory value to its database-native form.
    ///
    /// Booleans are stored as integers and decimals as text, which is
    /// what keeps decimal round trips exact.
    pub fn to_database(&self, value: Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match (self, value) {
            (Kind::Bool, Value::Bool(b)) => Ok(Value::Int(i64::from(b))),
            (Kind::Int, v @ Value::Int(_)) => Ok(v),
            (Kind::Float, v @ Value::Float(_)) => Ok(v),
            (Kind::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
            (Kind::Text, v @ Value::Text(_)) => Ok(v),
            (Kind::Bytes, v @ Value::Bytes(_)) => Ok(v),
            (Kind::Decimal, Value::Decimal(d)) => Ok(Value::Text(d.to_string())),
            (kind, value) => Err(Error::TypeMismatch {
                expected: kind.name(),
                found: value.type_name(),
            }),
        }
    }

    /// Convert a database-native value back to its in-memory form.
    pub fn from_database(&self, value: Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match (self, value) {
            (Kind::Bool, Value::Int(i)) => Ok(Value::Bool(i != 0)),
            (Kind::Bool, v @ Value::Bool(_)) => Ok(v),
            (Kind::Int, v @ Value::Int(_)) => Ok(v),
            (Kind::Float, v @ Value::Float(_)) => Ok(v),
            (Kind::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
            (Kind::Text, v @ Value::Text(_)) => Ok(v),
            (Kind::Bytes, v @ Value::Bytes(_)) => Ok(v),
            (Kind::Bytes, Value::Text(s)) => Ok(Value::Bytes(s.into_bytes())),
            (Kind::Decimal, Value::Text(s)) => Ok(Value::Decimal(s.parse()?)),
            (Kind::Decimal, Value::Int(i)) => Ok(Value::Decimal(Decimal::new(i as i128, 0))),
            (Kind::Decimal, v @ Value::Decimal(_)) => Ok(v),
            (kind, value) => Err(Error::TypeMismatch {
                expected: kind.name(),
                found: value.type_name(),
            }),
        }
    }
}

/// Conversion from a Rust value into a cell value.
pub trait ToValue {
    fn to_value(self) -> Value;
}

/// Conversion from a cell value back into a Rust value.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

impl ToValue for Value {
    fn to_value(self) -> Value {
        self
    }
}

impl ToValue for bool {
    fn to_value(self) -> Value {
        Value::Bool(self)
    }
}

impl ToValue for i64 {
    fn to_value(self) -> Value {
        Value::Int(self)
    }
}

impl ToValue for i32 {
    fn to_value(self) -> Value {
        Value::Int(i64::from(self))
    }
}

impl ToValue for f64 {
    fn to_value(self) -> Value {
        Value::Float(self)
    }
}

impl ToValue for String {
    fn to_value(self) -> Value {
        Value::Text(self)
    }
}

impl ToValue for &str {
    fn to_value(self) -> Value {
        Value::Text(self.to_string())
    }
}

impl ToValue for Vec<u8> {
    fn to_value(self) -> Value {
        Value::Bytes(self)
    }
}

impl ToValue for Decimal {
    fn to_value(self) -> Value {
        Value::Decimal(self)
    }
}

impl<T: ToValue> ToValue for Option<T> {
    fn to_value(self) -> Value {
        match self {
            Some(v) => v.to_value(),
            None => Value::Null,
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Text(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bytes(b) => Some(b.clone()),
            _ => None,
        }
    }
}

impl FromValue for Decimal {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Decimal(d) => Some(*d),
            _ => None,
        }
    }
}
