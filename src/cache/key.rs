//! Call keys: the canonical encoding of one invocation's arguments.
//!
//! A [`CallKey`] holds the ordered positional arguments plus the named
//! arguments sorted by name. Argument values are restricted to [`ArgValue`],
//! which only admits types that survive a JSON round-trip unchanged (no
//! floats), so a key read back from disk compares equal to the key that was
//! written.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A serialization-stable argument value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    /// Ordered sequence. Stays ordered across persistence.
    Seq(Vec<ArgValue>),
    /// Mapping with keys in sorted order.
    Map(BTreeMap<String, ArgValue>),
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Str(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Str(value)
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        ArgValue::Bool(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        ArgValue::Int(value)
    }
}

impl From<i32> for ArgValue {
    fn from(value: i32) -> Self {
        ArgValue::Int(i64::from(value))
    }
}

impl From<u32> for ArgValue {
    fn from(value: u32) -> Self {
        ArgValue::Int(i64::from(value))
    }
}

impl<T: Into<ArgValue>> From<Vec<T>> for ArgValue {
    fn from(values: Vec<T>) -> Self {
        ArgValue::Seq(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<ArgValue>> From<Option<T>> for ArgValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ArgValue::Null, Into::into)
    }
}

impl From<BTreeMap<String, ArgValue>> for ArgValue {
    fn from(map: BTreeMap<String, ArgValue>) -> Self {
        ArgValue::Map(map)
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Null => write!(f, "null"),
            ArgValue::Bool(b) => write!(f, "{}", b),
            ArgValue::Int(i) => write!(f, "{}", i),
            ArgValue::Str(s) => write!(f, "{:?}", s),
            ArgValue::Seq(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            ArgValue::Map(map) => {
                write!(f, "{{")?;
                for (i, (name, value)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {}", name, value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Cache key for one call of a wrapped function.
///
/// Equality is structural: two calls with the same argument values map to
/// the same key regardless of the order named arguments were supplied in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallKey {
    args: Vec<ArgValue>,
    #[serde(default)]
    named: BTreeMap<String, ArgValue>,
}

impl CallKey {
    /// Key from positional arguments.
    pub fn new<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<ArgValue>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            named: BTreeMap::new(),
        }
    }

    /// Key for a single positional argument, e.g. `("192.0.2.10",)`.
    pub fn single(arg: impl Into<ArgValue>) -> Self {
        Self::new([arg.into()])
    }

    /// Adds a named argument. A later value for the same name replaces the
    /// earlier one, as a repeated keyword would.
    pub fn with_named(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.named.insert(name.into(), value.into());
        self
    }

    pub fn args(&self) -> &[ArgValue] {
        &self.args
    }

    pub fn named(&self) -> &BTreeMap<String, ArgValue> {
        &self.named
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for arg in &self.args {
            write!(f, "{},", arg)?;
        }
        for (name, value) in &self.named {
            write!(f, " {}={},", name, value)?;
        }
        write!(f, ")")
    }
}
