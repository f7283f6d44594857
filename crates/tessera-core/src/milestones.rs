//! Named predicates marking notable moments of a run.
//!
//! Milestones are checked once per period, right after data collection.
//! A non-repeating milestone fires at most once; a repeating one fires in
//! every period its trigger holds. The `stopafter` parameter can name a
//! milestone to end the run once it fires.

use std::sync::Arc;

use tracing::debug;

use crate::model::Model;

/// Milestone trigger.
pub type MilestoneTrigger = dyn Fn(&Model) -> bool + Send + Sync;

/// Errors raised by the milestone registry.
#[derive(Debug, thiserror::Error)]
pub enum MilestoneError {
    /// A milestone with this name already exists.
    #[error("milestone already registered: {0}")]
    Duplicate(String),
}

struct Milestone {
    name: String,
    repeat: bool,
    trigger: Arc<MilestoneTrigger>,
    fired: Vec<u64>,
}

/// Registered milestones, in registration order.
#[derive(Default)]
pub struct Milestones {
    list: Vec<Milestone>,
}

impl core::fmt::Debug for Milestones {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.list.iter().map(|m| (&m.name, &m.fired)))
            .finish()
    }
}

impl Milestones {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a milestone.
    pub fn add<F>(&mut self, name: &str, repeat: bool, trigger: F) -> Result<(), MilestoneError>
    where
        F: Fn(&Model) -> bool + Send + Sync + 'static,
    {
        if self.find(name).is_some() {
            return Err(MilestoneError::Duplicate(name.to_owned()));
        }
        debug!(milestone = name, repeat, "milestone registered");
        self.list.push(Milestone {
            name: name.to_owned(),
            repeat,
            trigger: Arc::new(trigger),
            fired: Vec::new(),
        });
        Ok(())
    }

    /// Whether a milestone with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Periods in which the milestone fired.
    pub fn fired(&self, name: &str) -> Option<&[u64]> {
        self.find(name).map(|m| m.fired.as_slice())
    }

    /// Most recent firing period.
    pub fn last_fired(&self, name: &str) -> Option<u64> {
        self.find(name).and_then(|m| m.fired.last().copied())
    }

    /// Milestone names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.list.iter().map(|m| m.name.as_str()).collect()
    }

    /// Triggers still eligible to fire.
    pub(crate) fn pending(&self) -> Vec<(String, Arc<MilestoneTrigger>)> {
        self.list
            .iter()
            .filter(|m| m.repeat || m.fired.is_empty())
            .map(|m| (m.name.clone(), Arc::clone(&m.trigger)))
            .collect()
    }

    pub(crate) fn record(&mut self, name: &str, period: u64) {
        if let Some(m) = self.list.iter_mut().find(|m| m.name == name) {
            m.fired.push(period);
        }
    }

    fn find(&self, name: &str) -> Option<&Milestone> {
        self.list.iter().find(|m| m.name == name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn non_repeating_milestone_leaves_pending_after_firing() {
        let mut milestones = Milestones::new();
        milestones.add("once", false, |_| true).unwrap();
        milestones.add("always", true, |_| true).unwrap();
        assert_eq!(milestones.pending().len(), 2);

        milestones.record("once", 4);
        milestones.record("always", 4);
        let pending: Vec<String> = milestones.pending().into_iter().map(|(n, _)| n).collect();
        assert_eq!(pending, vec!["always"]);
        assert_eq!(milestones.last_fired("once"), Some(4));
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut milestones = Milestones::new();
        milestones.add("m", false, |_| false).unwrap();
        assert!(milestones.add("m", false, |_| false).is_err());
        assert!(milestones.fired("ghost").is_none());
    }
}
