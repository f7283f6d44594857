//! Typed, named parameter store.
//!
//! A parameter has a kind (which fixes its legal values and the control a
//! front-end renders for it), a scope (one global slot, one slot per
//! non-money good, or one slot per breed of a primitive), a default, and a
//! runtime flag. Parameters without the runtime flag lock the first time
//! the model enters `Running`; writes to them are rejected from then on.
//!
//! Every write is validated before anything is stored, so a rejected
//! `set` leaves the previous value in place.
//!
//! The store itself never calls change callbacks; [`Model::set_param`]
//! does, after a successful write.
//!
//! [`Model::set_param`]: crate::Model::set_param

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tessera_types::{CheckEntry, ParamValue, Value};
use tracing::debug;

use crate::model::Model;

/// Tolerance for slider bound and step checks.
const EPSILON: f64 = 1e-9;

/// Change callback: model, parameter name, item, new value.
pub type ParamCallback =
    dyn Fn(&mut Model, &str, Option<&str>, &ParamValue) -> anyhow::Result<()> + Send + Sync;

/// Errors raised by the parameter store.
#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    /// No parameter with this name.
    #[error("unknown parameter: {0}")]
    Unknown(String),

    /// A parameter with this name already exists.
    #[error("parameter already registered: {0}")]
    Duplicate(String),

    /// The kind description itself is invalid (empty menu, inverted bounds).
    #[error("invalid definition for parameter {name}: {reason}")]
    InvalidSpec {
        /// Parameter name.
        name: String,
        /// What is wrong.
        reason: String,
    },

    /// The default value is outside the kind's domain.
    #[error("invalid default for parameter {name}: {reason}")]
    InvalidDefault {
        /// Parameter name.
        name: String,
        /// Why the default was rejected.
        reason: String,
    },

    /// A written value is outside the kind's domain.
    #[error("invalid value for parameter {name}: {reason}")]
    Validation {
        /// Parameter name.
        name: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A scoped parameter was accessed without an item.
    #[error("parameter {name} is per-item; an item is required")]
    ItemRequired {
        /// Parameter name.
        name: String,
    },

    /// A global parameter was accessed with an item.
    #[error("parameter {name} is global; no item expected")]
    ItemNotAllowed {
        /// Parameter name.
        name: String,
    },

    /// The item is not a slot of this parameter.
    #[error("parameter {name} has no slot for {item}")]
    UnknownItem {
        /// Parameter name.
        name: String,
        /// The requested item.
        item: String,
    },

    /// The parameter is locked for the rest of the run.
    #[error("parameter {name} cannot change while the model is running")]
    Locked {
        /// Parameter name.
        name: String,
    },

    /// The flag is not declared by the checkgrid.
    #[error("parameter {name} has no flag {flag}")]
    UnknownFlag {
        /// Parameter name.
        name: String,
        /// The requested flag.
        flag: String,
    },

    /// A checkgrid operation on a parameter of another kind.
    #[error("parameter {0} is not a checkgrid")]
    NotCheckGrid(String),
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// One entry of a menu parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenuOption {
    /// Stored value.
    pub value: String,
    /// Label shown by front-ends.
    pub label: String,
}

impl MenuOption {
    /// Create an option.
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }
}

/// Payload type of a checkentry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Numeric payload.
    Number,
    /// Text payload.
    Text,
}

/// One flag of a checkgrid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GridFlag {
    /// Flag name (map key).
    pub name: String,
    /// Label shown by front-ends.
    pub label: String,
}

impl GridFlag {
    /// Create a flag.
    pub fn new(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
        }
    }
}

/// Legal value domain and rendering hint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamKind {
    /// Number within `[low, high]` on a `step` lattice anchored at `low`.
    Slider {
        /// Lower bound.
        low: f64,
        /// Upper bound.
        high: f64,
        /// Step size, strictly positive.
        step: f64,
    },
    /// Boolean toggle.
    Check,
    /// One of a fixed set of options.
    Menu {
        /// Allowed options.
        options: Vec<MenuOption>,
    },
    /// Toggle with an optional payload or predicate.
    CheckEntry {
        /// Payload type when fixed.
        entry: EntryKind,
    },
    /// Independently toggleable flags.
    CheckGrid {
        /// Declared flags.
        flags: Vec<GridFlag>,
    },
    /// No control; any value.
    Hidden,
}

/// Which slots a parameter has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", content = "primitive", rename_all = "snake_case")]
pub enum ParamScope {
    /// A single slot.
    Global,
    /// One slot per non-money good.
    PerGood,
    /// One slot per breed of the named primitive.
    PerBreed(String),
}

/// Declaration of a parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDef {
    /// Unique name.
    pub name: String,
    /// Human-readable title.
    pub title: String,
    /// Value domain.
    pub kind: ParamKind,
    /// Slot layout.
    pub scope: ParamScope,
    /// Initial value of every slot.
    pub default: ParamValue,
    /// Whether the value may change once the model is running.
    pub runtime: bool,
    /// Optional longer description.
    pub description: Option<String>,
}

impl ParamDef {
    /// A global, runtime-mutable parameter.
    pub fn new(
        name: impl Into<String>,
        title: impl Into<String>,
        kind: ParamKind,
        default: impl Into<ParamValue>,
    ) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            kind,
            scope: ParamScope::Global,
            default: default.into(),
            runtime: true,
            description: None,
        }
    }

    /// Shorthand for a slider definition.
    pub fn slider(
        name: impl Into<String>,
        title: impl Into<String>,
        default: f64,
        low: f64,
        high: f64,
        step: f64,
    ) -> Self {
        Self::new(name, title, ParamKind::Slider { low, high, step }, default)
    }

    /// Shorthand for a check definition.
    pub fn check(name: impl Into<String>, title: impl Into<String>, default: bool) -> Self {
        Self::new(name, title, ParamKind::Check, default)
    }

    /// Set the scope.
    #[must_use]
    pub fn with_scope(mut self, scope: ParamScope) -> Self {
        self.scope = scope;
        self
    }

    /// Set the runtime flag.
    #[must_use]
    pub const fn runtime(mut self, runtime: bool) -> Self {
        self.runtime = runtime;
        self
    }

    /// Attach a description.
    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Catalogue entry consumed by control panels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamInfo {
    /// Parameter name.
    pub name: String,
    /// Title.
    pub title: String,
    /// Kind with its domain.
    pub kind: ParamKind,
    /// Scope.
    pub scope: ParamScope,
    /// Runtime flag.
    pub runtime: bool,
    /// Whether writes are currently rejected.
    pub locked: bool,
    /// Description, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Value of a global parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<ParamValue>,
    /// Values of a scoped parameter, by item.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub items: BTreeMap<String, ParamValue>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Slots {
    Global(ParamValue),
    Items(BTreeMap<String, ParamValue>),
}

struct Param {
    def: ParamDef,
    slots: Slots,
    callback: Option<Arc<ParamCallback>>,
}

/// All parameters of a model, in registration order.
#[derive(Default)]
pub struct Params {
    params: BTreeMap<String, Param>,
    order: Vec<String>,
    locked: bool,
}

impl core::fmt::Debug for Params {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Params")
            .field("names", &self.order)
            .field("locked", &self.locked)
            .finish()
    }
}

impl Params {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter with one slot per `items` entry (ignored for
    /// global parameters).
    ///
    /// # Errors
    ///
    /// Rejects duplicate names, invalid kind descriptions and defaults
    /// outside the domain.
    pub fn add(&mut self, def: ParamDef, items: &[String]) -> Result<(), ParamError> {
        if self.params.contains_key(&def.name) {
            return Err(ParamError::Duplicate(def.name));
        }
        check_kind(&def.kind).map_err(|reason| ParamError::InvalidSpec {
            name: def.name.clone(),
            reason,
        })?;
        let default =
            coerce(&def.kind, def.default.clone()).map_err(|reason| ParamError::InvalidDefault {
                name: def.name.clone(),
                reason,
            })?;

        let slots = match def.scope {
            ParamScope::Global => Slots::Global(default.clone()),
            ParamScope::PerGood | ParamScope::PerBreed(_) => Slots::Items(
                items
                    .iter()
                    .map(|item| (item.clone(), default.clone()))
                    .collect(),
            ),
        };

        debug!(param = %def.name, scope = ?def.scope, "parameter registered");
        let name = def.name.clone();
        self.order.push(name.clone());
        self.params.insert(
            name,
            Param {
                def: ParamDef { default, ..def },
                slots,
                callback: None,
            },
        );
        Ok(())
    }

    /// Remove a parameter. Returns whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.params.remove(name).is_some()
    }

    /// Attach or replace the change callback of a parameter.
    ///
    /// # Errors
    ///
    /// Returns [`ParamError::Unknown`] if the parameter does not exist.
    pub fn on_change<F>(&mut self, name: &str, callback: F) -> Result<(), ParamError>
    where
        F: Fn(&mut Model, &str, Option<&str>, &ParamValue) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        let param = self.lookup_mut(name)?;
        param.callback = Some(Arc::new(callback));
        Ok(())
    }

    /// Whether a parameter with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    /// Parameter names in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// The definition of a parameter.
    pub fn def(&self, name: &str) -> Option<&ParamDef> {
        self.params.get(name).map(|p| &p.def)
    }

    /// Read a slot. `item` selects the slot of a scoped parameter.
    ///
    /// # Errors
    ///
    /// Unknown names, missing or unexpected items, unknown items.
    pub fn get(&self, name: &str, item: Option<&str>) -> Result<&ParamValue, ParamError> {
        let param = self.lookup(name)?;
        match (&param.slots, item) {
            (Slots::Global(value), None) => Ok(value),
            (Slots::Global(_), Some(_)) => Err(ParamError::ItemNotAllowed {
                name: name.to_owned(),
            }),
            (Slots::Items(_), None) => Err(ParamError::ItemRequired {
                name: name.to_owned(),
            }),
            (Slots::Items(map), Some(item)) => {
                map.get(item).ok_or_else(|| ParamError::UnknownItem {
                    name: name.to_owned(),
                    item: item.to_owned(),
                })
            }
        }
    }

    /// Numeric view of a slot, if it has one.
    pub fn get_f64(&self, name: &str, item: Option<&str>) -> Option<f64> {
        self.get(name, item).ok().and_then(ParamValue::as_f64)
    }

    /// Boolean view of a slot, if it has one.
    pub fn get_bool(&self, name: &str, item: Option<&str>) -> Option<bool> {
        self.get(name, item).ok().and_then(ParamValue::as_bool)
    }

    /// Checkentry view of a slot.
    pub fn get_entry(&self, name: &str, item: Option<&str>) -> Option<&CheckEntry> {
        self.get(name, item).ok().and_then(ParamValue::as_entry)
    }

    /// Validate and store a value. Returns the value as stored (after
    /// coercion). Does not invoke the change callback.
    ///
    /// # Errors
    ///
    /// Lookup errors, [`ParamError::Locked`], [`ParamError::Validation`].
    /// The stored value is unchanged on error.
    pub fn set(
        &mut self,
        name: &str,
        item: Option<&str>,
        value: ParamValue,
    ) -> Result<ParamValue, ParamError> {
        let locked = self.locked;
        let param = self.lookup_mut(name)?;
        if locked && !param.def.runtime {
            return Err(ParamError::Locked {
                name: name.to_owned(),
            });
        }
        let value = coerce(&param.def.kind, value).map_err(|reason| ParamError::Validation {
            name: name.to_owned(),
            reason,
        })?;
        let slot = slot_mut(param, name, item)?;
        *slot = value.clone();
        debug!(param = name, item, value = ?value, "parameter set");
        Ok(value)
    }

    /// Toggle one flag of a checkgrid slot. Returns the whole grid as
    /// stored.
    ///
    /// # Errors
    ///
    /// [`ParamError::NotCheckGrid`], [`ParamError::UnknownFlag`], lock and
    /// lookup errors.
    pub fn set_flag(
        &mut self,
        name: &str,
        item: Option<&str>,
        flag: &str,
        on: bool,
    ) -> Result<ParamValue, ParamError> {
        let locked = self.locked;
        let param = self.lookup_mut(name)?;
        let ParamKind::CheckGrid { flags } = &param.def.kind else {
            return Err(ParamError::NotCheckGrid(name.to_owned()));
        };
        if !flags.iter().any(|f| f.name == flag) {
            return Err(ParamError::UnknownFlag {
                name: name.to_owned(),
                flag: flag.to_owned(),
            });
        }
        if locked && !param.def.runtime {
            return Err(ParamError::Locked {
                name: name.to_owned(),
            });
        }
        let slot = slot_mut(param, name, item)?;
        let mut grid = slot.as_grid().cloned().unwrap_or_default();
        grid.insert(flag.to_owned(), on);
        *slot = ParamValue::Grid(grid);
        Ok(slot.clone())
    }

    /// Add a slot holding the default to every parameter whose scope
    /// matches. Existing slots are left alone.
    pub fn extend_scope(&mut self, scope: &ParamScope, item: &str) {
        for param in self.params.values_mut() {
            if &param.def.scope != scope {
                continue;
            }
            if let Slots::Items(map) = &mut param.slots {
                map.entry(item.to_owned())
                    .or_insert_with(|| param.def.default.clone());
            }
        }
    }

    /// The change callback of a parameter, if any.
    pub(crate) fn callback(&self, name: &str) -> Option<Arc<ParamCallback>> {
        self.params.get(name).and_then(|p| p.callback.clone())
    }

    /// Reject writes to non-runtime parameters from now on.
    pub fn lock(&mut self) {
        if !self.locked {
            debug!("non-runtime parameters locked");
        }
        self.locked = true;
    }

    /// Whether non-runtime parameters are locked.
    pub const fn is_locked(&self) -> bool {
        self.locked
    }

    /// Serializable catalogue of every parameter with its current values.
    pub fn describe(&self) -> Vec<ParamInfo> {
        self.order
            .iter()
            .filter_map(|name| self.params.get(name))
            .map(|param| {
                let (value, items) = match &param.slots {
                    Slots::Global(v) => (Some(v.clone()), BTreeMap::new()),
                    Slots::Items(map) => (None, map.clone()),
                };
                ParamInfo {
                    name: param.def.name.clone(),
                    title: param.def.title.clone(),
                    kind: param.def.kind.clone(),
                    scope: param.def.scope.clone(),
                    runtime: param.def.runtime,
                    locked: self.locked && !param.def.runtime,
                    description: param.def.description.clone(),
                    value,
                    items,
                }
            })
            .collect()
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    fn lookup(&self, name: &str) -> Result<&Param, ParamError> {
        self.params
            .get(name)
            .ok_or_else(|| ParamError::Unknown(name.to_owned()))
    }

    fn lookup_mut(&mut self, name: &str) -> Result<&mut Param, ParamError> {
        self.params
            .get_mut(name)
            .ok_or_else(|| ParamError::Unknown(name.to_owned()))
    }
}

fn slot_mut<'a>(
    param: &'a mut Param,
    name: &str,
    item: Option<&str>,
) -> Result<&'a mut ParamValue, ParamError> {
    match (&mut param.slots, item) {
        (Slots::Global(value), None) => Ok(value),
        (Slots::Global(_), Some(_)) => Err(ParamError::ItemNotAllowed {
            name: name.to_owned(),
        }),
        (Slots::Items(_), None) => Err(ParamError::ItemRequired {
            name: name.to_owned(),
        }),
        (Slots::Items(map), Some(item)) => {
            map.get_mut(item).ok_or_else(|| ParamError::UnknownItem {
                name: name.to_owned(),
                item: item.to_owned(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn check_kind(kind: &ParamKind) -> Result<(), String> {
    match kind {
        ParamKind::Slider { low, high, step } => {
            if !low.is_finite() || !high.is_finite() || !step.is_finite() {
                return Err("slider bounds and step must be finite".to_owned());
            }
            if low > high {
                return Err(format!("low bound {low} exceeds high bound {high}"));
            }
            if *step <= 0.0 {
                return Err(format!("step must be positive, got {step}"));
            }
            Ok(())
        }
        ParamKind::Menu { options } => {
            if options.is_empty() {
                return Err("menu has no options".to_owned());
            }
            Ok(())
        }
        ParamKind::CheckGrid { flags } => {
            let mut seen = std::collections::BTreeSet::new();
            for flag in flags {
                if !seen.insert(flag.name.as_str()) {
                    return Err(format!("flag {} declared twice", flag.name));
                }
            }
            Ok(())
        }
        ParamKind::Check | ParamKind::CheckEntry { .. } | ParamKind::Hidden => Ok(()),
    }
}

/// Validate `value` against `kind`, applying the permitted coercions.
fn coerce(kind: &ParamKind, value: ParamValue) -> Result<ParamValue, String> {
    match kind {
        ParamKind::Slider { low, high, step } => {
            let Some(n) = value.as_f64() else {
                return Err(format!("expected a number, got {value:?}"));
            };
            if !n.is_finite() {
                return Err(format!("{n} is not finite"));
            }
            if n < low - EPSILON || n > high + EPSILON {
                return Err(format!("{n} is outside [{low}, {high}]"));
            }
            let steps = (n - low) / step;
            if (steps - steps.round()).abs() > EPSILON * steps.abs().max(1.0) {
                return Err(format!("{n} is not a multiple of step {step} from {low}"));
            }
            Ok(ParamValue::Number(n))
        }
        ParamKind::Check => coerce_bool(&value).map(ParamValue::Bool),
        ParamKind::Menu { options } => {
            let Some(choice) = value.as_str() else {
                return Err(format!("expected a menu option, got {value:?}"));
            };
            if options.iter().any(|o| o.value == choice) {
                Ok(ParamValue::Choice(choice.to_owned()))
            } else {
                Err(format!("{choice} is not one of the menu options"))
            }
        }
        ParamKind::CheckEntry { entry } => coerce_entry(*entry, value).map(ParamValue::Entry),
        ParamKind::CheckGrid { flags } => {
            let ParamValue::Grid(given) = value else {
                return Err(format!("expected a flag map, got {value:?}"));
            };
            if let Some(unknown) = given.keys().find(|k| !flags.iter().any(|f| &f.name == *k)) {
                return Err(format!("unknown flag {unknown}"));
            }
            Ok(ParamValue::Grid(
                flags
                    .iter()
                    .map(|f| (f.name.clone(), given.get(&f.name).copied().unwrap_or(false)))
                    .collect(),
            ))
        }
        ParamKind::Hidden => Ok(value),
    }
}

fn coerce_bool(value: &ParamValue) -> Result<bool, String> {
    match value {
        ParamValue::Bool(b) => Ok(*b),
        ParamValue::Number(n) => Ok(n.abs() > EPSILON),
        ParamValue::Choice(s) | ParamValue::Text(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "on" | "yes" | "1" => Ok(true),
            "false" | "off" | "no" | "0" => Ok(false),
            other => Err(format!("cannot read {other:?} as a boolean")),
        },
        ParamValue::Entry(_) | ParamValue::Grid(_) => {
            Err(format!("expected a boolean, got {value:?}"))
        }
    }
}

fn coerce_entry(kind: EntryKind, value: ParamValue) -> Result<CheckEntry, String> {
    let entry = match value {
        ParamValue::Entry(entry) => entry,
        ParamValue::Bool(false) => CheckEntry::Off,
        ParamValue::Number(n) => CheckEntry::Fixed(Value::Float(n)),
        ParamValue::Choice(s) | ParamValue::Text(s) => CheckEntry::Fixed(Value::Text(s)),
        other => return Err(format!("expected a checkentry value, got {other:?}")),
    };
    match (&entry, kind) {
        (CheckEntry::Off, _) => Ok(entry),
        (CheckEntry::Predicate(name), _) if name.is_empty() => {
            Err("predicate name is empty".to_owned())
        }
        (CheckEntry::Predicate(_), _) => Ok(entry),
        (CheckEntry::Fixed(v), EntryKind::Number) => match v.as_f64() {
            Some(n) if n.is_finite() && !matches!(v, Value::Bool(_)) => Ok(entry),
            _ => Err(format!("expected a numeric entry, got {v:?}")),
        },
        (CheckEntry::Fixed(Value::Text(_)), EntryKind::Text) => Ok(entry),
        (CheckEntry::Fixed(v), EntryKind::Text) => Err(format!("expected a text entry, got {v:?}")),
    }
}
