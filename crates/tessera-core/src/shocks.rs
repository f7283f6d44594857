//! Shock manager: randomized, scheduled and manual perturbations.
//!
//! Shocks are evaluated once per period, after every stage has run and
//! before data collection. Active random shocks each draw one Bernoulli
//! trial from the model's random stream; inactive shocks are skipped
//! without drawing, so switching one off does not shift the stream seen by
//! everything else. Button shocks never fire from the periodic evaluation,
//! only through [`Model::trigger_shock`](crate::Model::trigger_shock).

use std::sync::Arc;

use rand::Rng;
use serde::Serialize;
use tracing::debug;

use crate::model::Model;

/// Action run when a shock fires.
pub type ShockAction = dyn Fn(&mut Model) -> anyhow::Result<()> + Send + Sync;

/// Errors raised by the shock manager.
#[derive(Debug, thiserror::Error)]
pub enum ShockError {
    /// A shock with this name already exists.
    #[error("shock already registered: {0}")]
    Duplicate(String),

    /// No shock with this name.
    #[error("unknown shock: {0}")]
    Unknown(String),

    /// Probability outside `[0, 1]`.
    #[error("shock {name}: probability {probability} is outside [0, 1]")]
    InvalidProbability {
        /// Shock name.
        name: String,
        /// The rejected probability.
        probability: f64,
    },

    /// An `Every` timer with a zero interval.
    #[error("shock {0}: interval must be at least 1")]
    ZeroInterval(String),
}

/// When a shock fires.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ShockTimer {
    /// Each active period, with this probability.
    Random {
        /// Per-period firing probability in `[0, 1]`.
        probability: f64,
    },
    /// Once, in this period.
    AtPeriod {
        /// The firing period.
        period: u64,
    },
    /// In every period divisible by `interval`.
    Every {
        /// Interval in periods, at least 1.
        interval: u64,
    },
    /// Only on explicit trigger.
    Button,
}

impl ShockTimer {
    fn validate(self, name: &str) -> Result<(), ShockError> {
        match self {
            Self::Random { probability } if !(0.0..=1.0).contains(&probability) => {
                Err(ShockError::InvalidProbability {
                    name: name.to_owned(),
                    probability,
                })
            }
            Self::Every { interval: 0 } => Err(ShockError::ZeroInterval(name.to_owned())),
            _ => Ok(()),
        }
    }
}

/// A registered shock.
pub struct Shock {
    name: String,
    timer: ShockTimer,
    active: bool,
    description: Option<String>,
    action: Arc<ShockAction>,
    fired: Vec<u64>,
}

impl Shock {
    /// Shock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Firing rule.
    pub const fn timer(&self) -> ShockTimer {
        self.timer
    }

    /// Whether the periodic evaluation considers this shock.
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Periods in which the shock fired.
    pub fn fired(&self) -> &[u64] {
        &self.fired
    }
}

impl core::fmt::Debug for Shock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Shock")
            .field("name", &self.name)
            .field("timer", &self.timer)
            .field("active", &self.active)
            .field("fired", &self.fired.len())
            .finish_non_exhaustive()
    }
}

/// Control descriptor of a shock for front-ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShockInfo {
    /// Shock name.
    pub name: String,
    /// Firing rule.
    pub timer: ShockTimer,
    /// Active flag.
    pub active: bool,
    /// Description, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Registered shocks, in registration order.
#[derive(Debug, Default)]
pub struct Shocks {
    shocks: Vec<Shock>,
}

impl Shocks {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an active shock.
    pub fn add<F>(&mut self, name: &str, timer: ShockTimer, action: F) -> Result<(), ShockError>
    where
        F: Fn(&mut Model) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if self.find(name).is_some() {
            return Err(ShockError::Duplicate(name.to_owned()));
        }
        timer.validate(name)?;
        debug!(shock = name, timer = ?timer, "shock registered");
        self.shocks.push(Shock {
            name: name.to_owned(),
            timer,
            active: true,
            description: None,
            action: Arc::new(action),
            fired: Vec::new(),
        });
        Ok(())
    }

    /// Attach a description shown by front-ends.
    pub fn describe(&mut self, name: &str, description: impl Into<String>) -> Result<(), ShockError> {
        self.find_mut(name)?.description = Some(description.into());
        Ok(())
    }

    /// Switch a shock on or off.
    pub fn set_active(&mut self, name: &str, active: bool) -> Result<(), ShockError> {
        self.find_mut(name)?.active = active;
        debug!(shock = name, active, "shock toggled");
        Ok(())
    }

    /// Look up a shock.
    pub fn get(&self, name: &str) -> Option<&Shock> {
        self.find(name)
    }

    /// Shock names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.shocks.iter().map(|s| s.name.as_str()).collect()
    }

    /// Control descriptors of every shock.
    pub fn info(&self) -> Vec<ShockInfo> {
        self.shocks
            .iter()
            .map(|s| ShockInfo {
                name: s.name.clone(),
                timer: s.timer,
                active: s.active,
                description: s.description.clone(),
            })
            .collect()
    }

    /// Number of shocks.
    pub fn len(&self) -> usize {
        self.shocks.len()
    }

    /// Whether no shock is registered.
    pub fn is_empty(&self) -> bool {
        self.shocks.is_empty()
    }

    /// Shocks due in `period`, drawing one trial per active random shock.
    pub(crate) fn due<R: Rng>(
        &self,
        period: u64,
        rng: &mut R,
    ) -> Vec<(String, Arc<ShockAction>)> {
        self.shocks
            .iter()
            .filter(|s| s.active)
            .filter(|s| match s.timer {
                ShockTimer::Random { probability } => rng.random_bool(probability),
                ShockTimer::AtPeriod { period: at } => at == period,
                ShockTimer::Every { interval } => {
                    period.checked_rem(interval).is_some_and(|r| r == 0)
                }
                ShockTimer::Button => false,
            })
            .map(|s| (s.name.clone(), Arc::clone(&s.action)))
            .collect()
    }

    /// The action of a shock, for manual triggering.
    pub(crate) fn action(&self, name: &str) -> Result<Arc<ShockAction>, ShockError> {
        self.find(name)
            .map(|s| Arc::clone(&s.action))
            .ok_or_else(|| ShockError::Unknown(name.to_owned()))
    }

    /// Record that a shock fired.
    pub(crate) fn record(&mut self, name: &str, period: u64) {
        if let Ok(shock) = self.find_mut(name) {
            shock.fired.push(period);
        }
    }

    fn find(&self, name: &str) -> Option<&Shock> {
        self.shocks.iter().find(|s| s.name == name)
    }

    fn find_mut(&mut self, name: &str) -> Result<&mut Shock, ShockError> {
        self.shocks
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| ShockError::Unknown(name.to_owned()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn noop(_model: &mut Model) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn probability_bounds_are_validated() {
        let mut shocks = Shocks::new();
        let bad = shocks.add("s", ShockTimer::Random { probability: 1.5 }, noop);
        assert!(matches!(bad, Err(ShockError::InvalidProbability { .. })));
        let zero = shocks.add("e", ShockTimer::Every { interval: 0 }, noop);
        assert!(matches!(zero, Err(ShockError::ZeroInterval(_))));
        assert!(shocks.is_empty());
    }

    #[test]
    fn certain_and_impossible_shocks() {
        let mut shocks = Shocks::new();
        shocks
            .add("always", ShockTimer::Random { probability: 1.0 }, noop)
            .unwrap();
        shocks
            .add("never", ShockTimer::Random { probability: 0.0 }, noop)
            .unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        for period in 0..1000 {
            let due = shocks.due(period, &mut rng);
            assert_eq!(due.len(), 1);
            assert_eq!(due[0].0, "always");
        }
    }

    #[test]
    fn inactive_shocks_do_not_draw() {
        let mut with_inactive = Shocks::new();
        with_inactive
            .add("off", ShockTimer::Random { probability: 0.5 }, noop)
            .unwrap();
        with_inactive.set_active("off", false).unwrap();

        let mut rng_a = StdRng::seed_from_u64(7);
        let mut rng_b = StdRng::seed_from_u64(7);
        for period in 0..10 {
            assert!(with_inactive.due(period, &mut rng_a).is_empty());
        }
        assert_eq!(rng_a.random::<u64>(), rng_b.random::<u64>());
    }

    #[test]
    fn scheduled_and_button_timers() {
        let mut shocks = Shocks::new();
        shocks
            .add("at", ShockTimer::AtPeriod { period: 3 }, noop)
            .unwrap();
        shocks
            .add("every", ShockTimer::Every { interval: 2 }, noop)
            .unwrap();
        shocks.add("button", ShockTimer::Button, noop).unwrap();
        let mut rng = StdRng::seed_from_u64(1);

        let fired: Vec<Vec<String>> = (0..4)
            .map(|p| shocks.due(p, &mut rng).into_iter().map(|(n, _)| n).collect())
            .collect();
        assert_eq!(fired[0], vec!["every"]);
        assert!(fired[1].is_empty());
        assert_eq!(fired[2], vec!["every"]);
        assert_eq!(fired[3], vec!["at"]);
    }

    #[test]
    fn unknown_shock_lookups_fail() {
        let mut shocks = Shocks::new();
        assert!(matches!(
            shocks.set_active("ghost", true),
            Err(ShockError::Unknown(_))
        ));
        assert!(shocks.action("ghost").is_err());
    }
}
