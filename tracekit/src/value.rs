use serde::{Deserialize, Serialize};
use std::fmt;

/// A scalar annotation value.
///
/// Tags and log payloads are restricted to these kinds; anything else is
/// unrepresentable. Storage engines persist the stringified form, so a
/// value read back from a collector is always [`TagValue::String`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Null,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    String(String),
}

impl TagValue {
    /// Returns the numeric value for the number kinds.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::I64(n) => Some(*n as f64),
            TagValue::U64(n) => Some(*n as f64),
            TagValue::F64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Null => Ok(()),
            TagValue::Bool(b) => b.fmt(f),
            TagValue::I64(n) => n.fmt(f),
            TagValue::U64(n) => n.fmt(f),
            TagValue::F64(n) => n.fmt(f),
            TagValue::String(s) => s.fmt(f),
        }
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

impl From<i32> for TagValue {
    fn from(value: i32) -> Self {
        TagValue::I64(i64::from(value))
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::I64(value)
    }
}

impl From<u64> for TagValue {
    fn from(value: u64) -> Self {
        TagValue::U64(value)
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::F64(value)
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::String(value.to_owned())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::String(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stringifies_like_the_wire_format() {
        assert_eq!(TagValue::Null.to_string(), "");
        assert_eq!(TagValue::Bool(true).to_string(), "true");
        assert_eq!(TagValue::I64(-3).to_string(), "-3");
        assert_eq!(TagValue::F64(0.25).to_string(), "0.25");
        assert_eq!(TagValue::from("hi").to_string(), "hi");
    }

    #[test]
    fn serializes_as_bare_scalars() {
        assert_eq!(serde_json::to_string(&TagValue::Null).unwrap(), "null");
        assert_eq!(serde_json::to_string(&TagValue::Bool(false)).unwrap(), "false");
        assert_eq!(serde_json::to_string(&TagValue::U64(7)).unwrap(), "7");
        assert_eq!(
            serde_json::to_string(&TagValue::from("x")).unwrap(),
            "\"x\""
        );
    }
}
