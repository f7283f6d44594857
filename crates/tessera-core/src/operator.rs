//! External control of a running model.
//!
//! The period loop runs on whatever thread calls
//! [`Model::start`](crate::Model::start). Other threads (a UI, a signal
//! handler) steer it through a [`ControlHandle`]: a clonable pair of
//! atomic flags that the loop polls at every stage boundary. Front-ends
//! follow the run through the [`ModelObserver`] subscription interface and
//! [`RunStatus`] snapshots; the engine depends on no particular front-end.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tessera_types::{RunState, Stage};

use crate::model::Model;
use crate::runner::PeriodReport;

#[derive(Debug, Default)]
struct ControlFlags {
    stop_requested: AtomicBool,
    terminate_requested: AtomicBool,
}

/// Thread-safe handle for stop and terminate requests.
#[derive(Debug, Clone, Default)]
pub struct ControlHandle {
    flags: Arc<ControlFlags>,
}

impl ControlHandle {
    /// Create a handle with no pending requests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to pause at the end of the current stage.
    pub fn request_stop(&self) {
        self.flags.stop_requested.store(true, Ordering::Release);
    }

    /// Whether a stop is pending.
    pub fn is_stop_requested(&self) -> bool {
        self.flags.stop_requested.load(Ordering::Acquire)
    }

    /// Ask the loop to terminate at the end of the current stage.
    /// Irreversible.
    pub fn request_terminate(&self) {
        self.flags.terminate_requested.store(true, Ordering::Release);
    }

    /// Whether termination is pending.
    pub fn is_terminate_requested(&self) -> bool {
        self.flags.terminate_requested.load(Ordering::Acquire)
    }

    /// Consume a pending stop request.
    pub(crate) fn take_stop(&self) -> bool {
        self.flags.stop_requested.swap(false, Ordering::AcqRel)
    }
}

/// Why the loop returned control to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// A stop was requested; the model is `Paused`.
    Paused,
    /// A stop condition held at a period boundary; the model is `Stopped`.
    StopCondition,
    /// `step` completed its period; the model is `Paused`.
    StepLimit,
    /// The run was terminated.
    Terminated,
}

/// Subscription interface for front-ends.
///
/// Both methods default to no-ops so observers implement only what they
/// need.
pub trait ModelObserver: Send {
    /// Called on every run-state transition.
    fn on_state_change(&mut self, _from: RunState, _to: RunState, _period: u64) {}

    /// Called after a period completes, every `refresh` periods.
    fn on_period(&mut self, _report: &PeriodReport, _model: &Model) {}
}

/// Serializable snapshot of a run for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStatus {
    /// Model name.
    pub name: String,
    /// Current period.
    pub period: u64,
    /// Run state.
    pub state: RunState,
    /// Stages per period.
    pub stages: Stage,
    /// Live entities per primitive.
    pub population: BTreeMap<String, usize>,
    /// When the loop first entered `Running`.
    pub started_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_request_is_consumed_once() {
        let handle = ControlHandle::new();
        assert!(!handle.take_stop());
        handle.request_stop();
        assert!(handle.is_stop_requested());
        assert!(handle.take_stop());
        assert!(!handle.is_stop_requested());
    }

    #[test]
    fn clones_share_flags() {
        let handle = ControlHandle::new();
        let remote = handle.clone();
        remote.request_terminate();
        assert!(handle.is_terminate_requested());
    }

    #[test]
    fn status_serializes_state_in_snake_case() {
        let status = RunStatus {
            name: "m".to_owned(),
            period: 3,
            state: RunState::Paused,
            stages: 1,
            population: BTreeMap::new(),
            started_at: None,
        };
        let json = serde_json::to_value(&status).ok();
        assert_eq!(
            json.as_ref().and_then(|j| j.get("state")).and_then(|s| s.as_str()),
            Some("paused")
        );
    }
}
