//! Dynamic values carried by entities and parameters.
//!
//! Entities have a fixed core (id, primitive, breed, lineage) plus an open
//! attribute map of [`Value`]s. Parameters store a [`ParamValue`], whose
//! variant is dictated by the parameter's kind.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A scalar value stored in an entity attribute or a checkentry slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating-point number.
    Float(f64),
    /// Free text.
    Text(String),
}

impl Value {
    /// Numeric view of the value. Booleans map to 0 and 1; text does not
    /// convert.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Text(_) => None,
        }
    }

    /// Text view of the value, if it is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
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

// ---------------------------------------------------------------------------
// Check Entry
// ---------------------------------------------------------------------------

/// Value of a checkentry parameter: a toggle with an optional payload.
///
/// The payload is either a fixed value (a number or text, depending on the
/// parameter) or the name of a predicate the engine evaluates, such as a
/// milestone. The mode is always explicit, never inferred from the payload
/// type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum CheckEntry {
    /// Disabled.
    #[default]
    Off,
    /// Enabled with a fixed value.
    Fixed(Value),
    /// Enabled, driven by the named predicate.
    Predicate(String),
}

impl CheckEntry {
    /// Whether the entry is switched on.
    pub const fn is_on(&self) -> bool {
        !matches!(self, Self::Off)
    }
}

// ---------------------------------------------------------------------------
// Parameter Value
// ---------------------------------------------------------------------------

/// The stored value of a parameter slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    /// Slider value.
    Number(f64),
    /// Check toggle.
    Bool(bool),
    /// Menu selection (the option's value, not its label).
    Choice(String),
    /// Free text, used by hidden parameters.
    Text(String),
    /// Checkentry toggle with payload.
    Entry(CheckEntry),
    /// Checkgrid: flag name to enabled.
    Grid(BTreeMap<String, bool>),
}

impl ParamValue {
    /// Numeric view: slider numbers, and fixed numeric checkentries.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Entry(CheckEntry::Fixed(v)) => v.as_f64(),
            _ => None,
        }
    }

    /// Boolean view: check toggles, and whether a checkentry is on.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Entry(entry) => Some(entry.is_on()),
            _ => None,
        }
    }

    /// Text view: menu choices and free text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Choice(s) | Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Checkentry view.
    pub const fn as_entry(&self) -> Option<&CheckEntry> {
        match self {
            Self::Entry(entry) => Some(entry),
            _ => None,
        }
    }

    /// Checkgrid view.
    pub const fn as_grid(&self) -> Option<&BTreeMap<String, bool>> {
        match self {
            Self::Grid(flags) => Some(flags),
            _ => None,
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Choice(v.to_owned())
    }
}

impl From<CheckEntry> for ParamValue {
    fn from(v: CheckEntry) -> Self {
        Self::Entry(v)
    }
}

impl From<BTreeMap<String, bool>> for ParamValue {
    fn from(v: BTreeMap<String, bool>) -> Self {
        Self::Grid(v)
    }
}
