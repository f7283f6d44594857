//! Goods registry.
//!
//! Goods are the things entities hold stocks of. Each good has an initial
//! endowment given to every new entity. At most one good is the money good;
//! per-good parameters get a slot for every other good.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors raised by the goods registry.
#[derive(Debug, thiserror::Error)]
pub enum GoodsError {
    /// A good with this name already exists.
    #[error("good already registered: {0}")]
    Duplicate(String),

    /// A second money good was declared.
    #[error("cannot make {name} the money good: {existing} already is")]
    SecondMoney {
        /// The rejected good.
        name: String,
        /// The existing money good.
        existing: String,
    },

    /// The endowment is not a finite number.
    #[error("endowment of {name} must be finite, got {endowment}")]
    InvalidEndowment {
        /// The good.
        name: String,
        /// The rejected endowment.
        endowment: f64,
    },

    /// Goods cannot be added once the model is set up.
    #[error("goods are fixed once the model is set up")]
    Frozen,
}

/// Declaration of a good.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoodSpec {
    /// Starting stock of every new entity.
    #[serde(default)]
    pub endowment: f64,
    /// Whether this is the money good.
    #[serde(default)]
    pub money: bool,
}

impl GoodSpec {
    /// A non-money good with the given endowment.
    pub const fn new(endowment: f64) -> Self {
        Self {
            endowment,
            money: false,
        }
    }

    /// The money good with the given endowment.
    pub const fn money(endowment: f64) -> Self {
        Self {
            endowment,
            money: true,
        }
    }
}

/// Registered goods in registration order.
#[derive(Debug, Clone, Default)]
pub struct Goods {
    goods: Vec<(String, GoodSpec)>,
    frozen: bool,
}

impl Goods {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a good.
    pub fn add(&mut self, name: &str, spec: GoodSpec) -> Result<(), GoodsError> {
        if self.frozen {
            return Err(GoodsError::Frozen);
        }
        if self.get(name).is_some() {
            return Err(GoodsError::Duplicate(name.to_owned()));
        }
        if !spec.endowment.is_finite() {
            return Err(GoodsError::InvalidEndowment {
                name: name.to_owned(),
                endowment: spec.endowment,
            });
        }
        if spec.money {
            if let Some(existing) = self.money() {
                return Err(GoodsError::SecondMoney {
                    name: name.to_owned(),
                    existing: existing.to_owned(),
                });
            }
        }
        debug!(good = name, money = spec.money, "good registered");
        self.goods.push((name.to_owned(), spec));
        Ok(())
    }

    /// Look up a good.
    pub fn get(&self, name: &str) -> Option<&GoodSpec> {
        self.goods.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    /// Name of the money good, if one is declared.
    pub fn money(&self) -> Option<&str> {
        self.goods
            .iter()
            .find(|(_, s)| s.money)
            .map(|(n, _)| n.as_str())
    }

    /// Every good name, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.goods.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Non-money good names, in registration order.
    pub fn non_money(&self) -> Vec<String> {
        self.goods
            .iter()
            .filter(|(_, s)| !s.money)
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Starting stocks for a new entity.
    pub fn endowments(&self) -> BTreeMap<String, f64> {
        self.goods
            .iter()
            .map(|(n, s)| (n.clone(), s.endowment))
            .collect()
    }

    /// Number of goods.
    pub fn len(&self) -> usize {
        self.goods.len()
    }

    /// Whether no good is registered.
    pub fn is_empty(&self) -> bool {
        self.goods.is_empty()
    }

    pub(crate) const fn freeze(&mut self) {
        self.frozen = true;
    }
}
