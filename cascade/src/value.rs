//! Typed values and positional records flowing through stage pipelines.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Index;

/// A single typed field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
            Self::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// Positional vector of values (a tuple).
///
/// Iterators lend their current record by reference for one streaming cycle;
/// stages that need to keep data copy the values they care about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record(Vec<Value>);

impl Record {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn with_capacity(n: usize) -> Self {
        Self(Vec::with_capacity(n))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn get(&self, pos: usize) -> Option<&Value> {
        self.0.get(pos)
    }

    pub fn push(&mut self, value: impl Into<Value>) {
        self.0.push(value.into());
    }

    /// Overwrites position `pos`, padding with [`Value::Null`] if needed.
    pub fn set(&mut self, pos: usize, value: impl Into<Value>) {
        if pos >= self.0.len() {
            self.0.resize(pos + 1, Value::Null);
        }
        self.0[pos] = value.into();
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

impl Index<usize> for Record {
    type Output = Value;

    fn index(&self, pos: usize) -> &Value {
        &self.0[pos]
    }
}

impl From<Vec<Value>> for Record {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl FromIterator<Value> for Record {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_pads_with_null() {
        let mut r = Record::new();
        r.set(2, 7_i64);
        assert_eq!(r.values(), &[Value::Null, Value::Null, Value::Int(7)]);
    }

    #[test]
    fn display_record() {
        let r: Record = vec![Value::Int(1), Value::from("a"), Value::Null].into();
        assert_eq!(format!("{r}"), "(1, \"a\", null)");
    }
}
