//! Operator attribute storage and typed accessors.
//!
//! Graph nodes carry an immutable [`AttrBag`]. Lowering policies read it through an [`AttrView`]
//! bound to the operator name, so a missing key and a value of the wrong shape surface as distinct
//! errors that name the operator, the attribute and the stored value.
//!
//! Attributes loaded from graph JSON are frequently stringly typed (`"(1, 1)"`, `"True"`); the
//! accessors parse those on demand.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{LoweringError, LoweringResult};

/// Integer tuple storage; convolution attributes are almost always pairs.
pub type IntTuple = SmallVec<[i64; 4]>;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    IntTuple(IntTuple),
    Str(String),
}

impl AttrValue {
    fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(value) => Some(*value),
            AttrValue::Int(0) => Some(false),
            AttrValue::Int(1) => Some(true),
            AttrValue::Str(raw) => match raw.trim() {
                "True" | "true" | "1" => Some(true),
                "False" | "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(value) => Some(*value),
            AttrValue::Str(raw) => raw.trim().parse().ok(),
            _ => None,
        }
    }

    fn as_float(&self) -> Option<f64> {
        match self {
            AttrValue::Float(value) => Some(*value),
            AttrValue::Int(value) => Some(*value as f64),
            AttrValue::Str(raw) => raw.trim().parse().ok(),
            _ => None,
        }
    }

    fn as_int_tuple(&self) -> Option<IntTuple> {
        match self {
            AttrValue::IntTuple(values) => Some(values.clone()),
            AttrValue::Int(value) => Some(smallvec::smallvec![*value]),
            AttrValue::Str(raw) => parse_int_tuple(raw),
            _ => None,
        }
    }
}

fn parse_int_tuple(raw: &str) -> Option<IntTuple> {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .or_else(|| {
            trimmed
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
        })
        .unwrap_or(trimmed);

    let mut values = IntTuple::new();
    for part in inner.split(',') {
        let part = part.trim();
        // "(1,)" leaves a trailing empty element.
        if part.is_empty() {
            continue;
        }
        values.push(part.parse().ok()?);
    }
    Some(values)
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(value) => write!(f, "{value}"),
            AttrValue::Int(value) => write!(f, "{value}"),
            AttrValue::Float(value) => write!(f, "{value}"),
            AttrValue::IntTuple(values) => {
                write!(f, "(")?;
                for (idx, value) in values.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{value}")?;
                }
                write!(f, ")")
            }
            AttrValue::Str(value) => write!(f, "{value:?}"),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<i32> for AttrValue {
    fn from(value: i32) -> Self {
        AttrValue::Int(i64::from(value))
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Str(value)
    }
}

impl<const N: usize> From<[i64; N]> for AttrValue {
    fn from(values: [i64; N]) -> Self {
        AttrValue::IntTuple(values.iter().copied().collect())
    }
}

impl<const N: usize> From<[i32; N]> for AttrValue {
    fn from(values: [i32; N]) -> Self {
        AttrValue::IntTuple(values.iter().map(|&value| i64::from(value)).collect())
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(values: Vec<i64>) -> Self {
        AttrValue::IntTuple(values.into_iter().collect())
    }
}

/// Immutable attribute map attached to a graph node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttrBag {
    values: BTreeMap<String, AttrValue>,
}

impl AttrBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion used while the IR constructs a node.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn from_json_str(src: &str) -> serde_json::Result<Self> {
        serde_json::from_str(src)
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.values.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Binds the bag to an operator name for typed reads.
    pub fn view<'a>(&'a self, op: &'a str) -> AttrView<'a> {
        AttrView::new(op, self)
    }
}

impl<K, V> FromIterator<(K, V)> for AttrBag
where
    K: Into<String>,
    V: Into<AttrValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

/// Read-only typed accessor over an [`AttrBag`].
#[derive(Debug, Clone, Copy)]
pub struct AttrView<'a> {
    op: &'a str,
    bag: &'a AttrBag,
}

impl<'a> AttrView<'a> {
    pub fn new(op: &'a str, bag: &'a AttrBag) -> Self {
        Self { op, bag }
    }

    /// Operator the attributes belong to.
    pub fn op(&self) -> &'a str {
        self.op
    }

    pub fn bag(&self) -> &'a AttrBag {
        self.bag
    }

    pub fn contains(&self, key: &str) -> bool {
        self.bag.contains(key)
    }

    /// Returns the raw value or [`LoweringError::MissingAttribute`].
    pub fn get(&self, key: &str) -> LoweringResult<&'a AttrValue> {
        self.bag
            .get(key)
            .ok_or_else(|| LoweringError::MissingAttribute {
                op: self.op.to_string(),
                attribute: key.to_string(),
            })
    }

    pub fn get_bool(&self, key: &str) -> LoweringResult<bool> {
        self.read(key, "bool", AttrValue::as_bool)
    }

    pub fn get_int(&self, key: &str) -> LoweringResult<i64> {
        self.read(key, "int", AttrValue::as_int)
    }

    pub fn get_float(&self, key: &str) -> LoweringResult<f64> {
        self.read(key, "float", AttrValue::as_float)
    }

    pub fn get_str(&self, key: &str) -> LoweringResult<&'a str> {
        let value = self.get(key)?;
        match value {
            AttrValue::Str(raw) => Ok(raw.as_str()),
            other => Err(self.type_error(key, "string", other)),
        }
    }

    pub fn get_int_tuple(&self, key: &str) -> LoweringResult<IntTuple> {
        self.read(key, "int tuple", AttrValue::as_int_tuple)
    }

    /// Reads a tuple that must hold exactly two integers (padding, strides, dilation, ...).
    pub fn get_int_pair(&self, key: &str) -> LoweringResult<[i64; 2]> {
        let value = self.get(key)?;
        match value.as_int_tuple() {
            Some(values) if values.len() == 2 => Ok([values[0], values[1]]),
            _ => Err(self.type_error(key, "int pair", value)),
        }
    }

    fn read<T>(
        &self,
        key: &str,
        expected: &'static str,
        convert: impl FnOnce(&AttrValue) -> Option<T>,
    ) -> LoweringResult<T> {
        let value = self.get(key)?;
        convert(value).ok_or_else(|| self.type_error(key, expected, value))
    }

    fn type_error(&self, key: &str, expected: &'static str, value: &AttrValue) -> LoweringError {
        LoweringError::AttributeType {
            op: self.op.to_string(),
            attribute: key.to_string(),
            expected,
            value: value.to_string(),
        }
    }
}
