//! Tagged attribute values.
//!
//! A [`TaggedValue`] is immutable once built. Numbers keep the sub-tag they
//! were created with so that JSON emission and increments preserve the
//! caller's numeric family.

use std::fmt;

use serde_json::Value as JsonValue;

use crate::codec::{self, FieldReader};
use crate::error::{AnalyticsError, Result};

/// Top-level value category, with its stable serialization tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    String = 0,
    Number = 1,
    Boolean = 2,
}

/// Numeric sub-tag, with its stable serialization tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumberKind {
    Long = 0,
    UnsignedLong = 1,
    Double = 2,
}

/// A number carrying its sub-tag.
#[derive(Debug, Clone, Copy)]
pub enum Number {
    Long(i64),
    UnsignedLong(u64),
    Double(f64),
}

impl Number {
    pub fn kind(&self) -> NumberKind {
        match self {
            Number::Long(_) => NumberKind::Long,
            Number::UnsignedLong(_) => NumberKind::UnsignedLong,
            Number::Double(_) => NumberKind::Double,
        }
    }

    /// The raw 64-bit pattern used for equality.
    pub fn bits(&self) -> u64 {
        match *self {
            Number::Long(v) => v as u64,
            Number::UnsignedLong(v) => v,
            Number::Double(v) => v.to_bits(),
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Number::Long(v) => v as f64,
            Number::UnsignedLong(v) => v as f64,
            Number::Double(v) => v,
        }
    }

    /// Add `delta`, keeping the family of `self`.
    ///
    /// A double on either side yields a double. Two integers stay integral:
    /// the result is unsigned when `self` was unsigned and the total is
    /// non-negative, signed otherwise. Integer overflow yields `None`.
    pub fn checked_add(&self, delta: &Number) -> Option<Number> {
        match (*self, *delta) {
            (Number::Double(_), _) | (_, Number::Double(_)) => {
                Some(Number::Double(self.as_f64() + delta.as_f64()))
            }
            (lhs, rhs) => {
                let total = lhs.as_i128()? + rhs.as_i128()?;
                match lhs {
                    Number::UnsignedLong(_) if total >= 0 => {
                        u64::try_from(total).ok().map(Number::UnsignedLong)
                    }
                    _ => match i64::try_from(total) {
                        Ok(v) => Some(Number::Long(v)),
                        Err(_) => u64::try_from(total).ok().map(Number::UnsignedLong),
                    },
                }
            }
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match *self {
            Number::Long(v) => Some(v as i128),
            Number::UnsignedLong(v) => Some(v as i128),
            Number::Double(_) => None,
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.bits() == other.bits()
    }
}

/// An immutable string, number or boolean.
#[derive(Debug, Clone, PartialEq)]
pub enum TaggedValue {
    /// Escaped string. The raw input is not retained.
    String(String),
    Number(Number),
    Boolean(bool),
}

impl TaggedValue {
    /// Build a string value, escaping control characters.
    pub fn string(value: impl AsRef<str>) -> Self {
        TaggedValue::String(codec::escape(value.as_ref()).into_owned())
    }

    pub fn long(value: i64) -> Self {
        TaggedValue::Number(Number::Long(value))
    }

    pub fn unsigned(value: u64) -> Self {
        TaggedValue::Number(Number::UnsignedLong(value))
    }

    pub fn double(value: f64) -> Self {
        TaggedValue::Number(Number::Double(value))
    }

    pub fn boolean(value: bool) -> Self {
        TaggedValue::Boolean(value)
    }

    pub fn category(&self) -> Category {
        match self {
            TaggedValue::String(_) => Category::String,
            TaggedValue::Number(_) => Category::Number,
            TaggedValue::Boolean(_) => Category::Boolean,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TaggedValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<Number> {
        match self {
            TaggedValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TaggedValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Append `category TAB [subtag TAB] payload TAB` to `out`.
    pub fn serialize_to(&self, out: &mut String) {
        codec::write_display(out, self.category() as u8);
        match self {
            TaggedValue::String(s) => codec::write_field(out, s),
            TaggedValue::Number(n) => {
                codec::write_display(out, n.kind() as u8);
                match *n {
                    Number::Long(v) => codec::write_display(out, v),
                    Number::UnsignedLong(v) => codec::write_display(out, v),
                    Number::Double(v) => codec::write_display(out, v),
                }
            }
            TaggedValue::Boolean(b) => codec::write_display(out, b),
        }
    }

    /// Serialized text of this value alone.
    pub fn to_serialized(&self) -> String {
        let mut out = String::new();
        self.serialize_to(&mut out);
        out
    }

    /// Read one value from the reader, the inverse of [`serialize_to`](Self::serialize_to).
    pub fn deserialize(reader: &mut FieldReader<'_>) -> Result<TaggedValue> {
        let category: u8 = reader.parse_field("value category")?;
        match category {
            c if c == Category::String as u8 => {
                let payload = reader.expect_field("string payload")?;
                Ok(TaggedValue::string(payload))
            }
            c if c == Category::Number as u8 => {
                let kind: u8 = reader.parse_field("number kind")?;
                let number = match kind {
                    k if k == NumberKind::Long as u8 => Number::Long(reader.parse_field("long")?),
                    k if k == NumberKind::UnsignedLong as u8 => {
                        Number::UnsignedLong(reader.parse_field("unsigned long")?)
                    }
                    k if k == NumberKind::Double as u8 => {
                        Number::Double(reader.parse_field("double")?)
                    }
                    other => {
                        return Err(AnalyticsError::Deserialization(format!(
                            "unknown number kind {}",
                            other
                        )))
                    }
                };
                Ok(TaggedValue::Number(number))
            }
            c if c == Category::Boolean as u8 => {
                let payload = reader.expect_field("boolean payload")?;
                match payload {
                    "true" | "1" => Ok(TaggedValue::Boolean(true)),
                    "false" | "0" => Ok(TaggedValue::Boolean(false)),
                    other => Err(AnalyticsError::Deserialization(format!(
                        "malformed boolean: {:?}",
                        other
                    ))),
                }
            }
            other => Err(AnalyticsError::Deserialization(format!(
                "unknown value category {}",
                other
            ))),
        }
    }

    /// Parse a standalone serialized value. Trailing fields are an error.
    pub fn from_serialized(text: &str) -> Result<TaggedValue> {
        let mut reader = FieldReader::new(text);
        let value = Self::deserialize(&mut reader)?;
        if !reader.is_at_end() {
            return Err(AnalyticsError::Deserialization(
                "trailing data after value".into(),
            ));
        }
        Ok(value)
    }

    /// JSON form: integers stay integers, doubles become floats.
    pub fn to_json(&self) -> JsonValue {
        match self {
            TaggedValue::String(s) => JsonValue::String(s.clone()),
            TaggedValue::Number(Number::Long(v)) => JsonValue::from(*v),
            TaggedValue::Number(Number::UnsignedLong(v)) => JsonValue::from(*v),
            TaggedValue::Number(Number::Double(v)) => JsonValue::from(*v),
            TaggedValue::Boolean(b) => JsonValue::Bool(*b),
        }
    }
}

impl fmt::Display for TaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaggedValue::String(s) => f.write_str(s),
            TaggedValue::Number(Number::Long(v)) => write!(f, "{}", v),
            TaggedValue::Number(Number::UnsignedLong(v)) => write!(f, "{}", v),
            TaggedValue::Number(Number::Double(v)) => write!(f, "{}", v),
            TaggedValue::Boolean(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for TaggedValue {
    fn from(v: &str) -> Self {
        TaggedValue::string(v)
    }
}

impl From<String> for TaggedValue {
    fn from(v: String) -> Self {
        TaggedValue::string(v)
    }
}

impl From<i64> for TaggedValue {
    fn from(v: i64) -> Self {
        TaggedValue::long(v)
    }
}

impl From<i32> for TaggedValue {
    fn from(v: i32) -> Self {
        TaggedValue::long(v as i64)
    }
}

impl From<u64> for TaggedValue {
    fn from(v: u64) -> Self {
        TaggedValue::unsigned(v)
    }
}

impl From<u32> for TaggedValue {
    fn from(v: u32) -> Self {
        TaggedValue::unsigned(v as u64)
    }
}

impl From<f64> for TaggedValue {
    fn from(v: f64) -> Self {
        TaggedValue::double(v)
    }
}

impl From<bool> for TaggedValue {
    fn from(v: bool) -> Self {
        TaggedValue::boolean(v)
    }
}
