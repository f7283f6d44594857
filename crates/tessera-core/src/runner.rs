//! Run-state machine.
//!
//! ```text
//! Ready --start/step--> Running --stop--> Paused --start/step--> Running
//!                          |
//!                          +--stop condition--> Stopped --start/step--> Running
//!                          |
//!                          +--terminate--> Terminated
//! ```
//!
//! The loop runs synchronously on the calling thread and checks the
//! [`ControlHandle`](crate::operator::ControlHandle) at every stage
//! boundary, so a pause can leave a period half-finished; the next
//! `start` or `step` resumes it at the following stage. `Terminated` is
//! absorbing.

use chrono::Utc;
use serde::Serialize;
use tessera_types::{CheckEntry, RunState, Value};
use tracing::{error, info, warn};

use crate::error::{Failure, FailureSource, ModelError};
use crate::hooks::EventKind;
use crate::model::{CSV_EXPORT, Model};
use crate::operator::HaltReason;

/// Summary of one completed period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodReport {
    /// The period that completed.
    pub period: u64,
    /// Shocks fired in the period, in firing order.
    pub shocks_fired: Vec<String>,
    /// Milestones that fired at the end of the period.
    pub milestones: Vec<String>,
    /// Callback failures recorded during the period.
    pub failures: Vec<Failure>,
    /// Live entities after the period.
    pub population: usize,
}

/// What a call to [`Model::start`] or [`Model::step`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Why the loop returned.
    pub halt: HaltReason,
    /// Periods completed during the call.
    pub periods: u64,
    /// Every failure recorded during the call.
    pub failures: Vec<Failure>,
    /// Report of the last period completed during the call.
    pub last_report: Option<PeriodReport>,
}

/// Serializable form of a [`RunOutcome`] for logs and front-ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutcomeSummary {
    /// Why the loop returned.
    pub halt: HaltReason,
    /// Periods completed during the call.
    pub periods: u64,
    /// Number of recorded failures.
    pub failures: usize,
}

impl RunOutcome {
    /// Compact summary.
    pub fn summary(&self) -> OutcomeSummary {
        OutcomeSummary {
            halt: self.halt,
            periods: self.periods,
            failures: self.failures.len(),
        }
    }
}

impl Model {
    /// Run until stopped, a stop condition holds, or termination.
    ///
    /// Sets the model up on first use. Resumes a paused period at its next
    /// stage. Resuming a `Stopped` run skips the stop check at the first
    /// boundary so the run can continue past its stop condition.
    ///
    /// # Errors
    ///
    /// [`ModelError::Reentrant`] from inside a hook,
    /// [`ModelError::Terminated`] after termination. A fatal hook failure
    /// or invariant violation terminates the run and is returned.
    pub fn start(&mut self) -> Result<RunOutcome, ModelError> {
        self.run_loop(None)
    }

    /// Run exactly one period (the rest of the current one, if paused
    /// mid-period), then pause.
    pub fn step(&mut self) -> Result<RunOutcome, ModelError> {
        self.run_loop(Some(1))
    }

    /// Run at most `periods` periods, then pause.
    pub fn run_periods(&mut self, periods: u64) -> Result<RunOutcome, ModelError> {
        self.run_loop(Some(periods))
    }

    /// Ask the running loop to pause at the next stage boundary. From a
    /// setup hook the request is held until the loop starts. No-op
    /// otherwise.
    pub fn stop(&mut self) {
        if self.setting_up {
            self.setup_stop = true;
        } else if self.state == RunState::Running {
            self.control.request_stop();
        }
    }

    /// End the run. Immediate when idle; at the next stage boundary when
    /// called from inside the loop or from a setup hook. Idempotent.
    pub fn terminate(&mut self) {
        if self.state == RunState::Terminated {
            return;
        }
        if self.state == RunState::Running || self.setting_up {
            self.control.request_terminate();
        } else {
            self.terminate_now();
        }
    }

    fn run_loop(&mut self, limit: Option<u64>) -> Result<RunOutcome, ModelError> {
        match self.state {
            RunState::Running => return Err(ModelError::Reentrant),
            RunState::Terminated => return Err(ModelError::Terminated),
            RunState::Ready | RunState::Paused | RunState::Stopped => {}
        }
        let resumed = self.state != RunState::Ready;
        let skip_stop_check = self.state == RunState::Stopped;
        self.control.take_stop();

        let result = self.drive(limit, resumed, skip_stop_check);
        if let Err(err) = &result {
            error!(error = %err, period = self.clock.period(), "run aborted");
            if self.state != RunState::Terminated {
                self.terminate_now();
            }
        }
        result
    }

    fn drive(
        &mut self,
        limit: Option<u64>,
        resumed: bool,
        mut skip_stop_check: bool,
    ) -> Result<RunOutcome, ModelError> {
        if !self.setup_done {
            self.setup()?;
        }
        if self.control.is_terminate_requested() {
            return self.finish_run(HaltReason::Terminated, 0, Vec::new(), None);
        }
        if std::mem::take(&mut self.setup_stop) {
            self.control.request_stop();
        }
        self.transition(RunState::Running);
        self.params.lock();
        self.started_at.get_or_insert_with(Utc::now);
        let handlers = self.hooks.model_start.snapshot(None);
        self.dispatch(EventKind::ModelStart, handlers, |h, m| h(m, resumed))?;

        let mut periods: u64 = 0;
        let mut failures = Vec::new();
        let mut last_report = None;
        let halt = loop {
            if let Some(reason) = self.violation.clone() {
                return Err(ModelError::InvariantViolation { reason });
            }
            if self.control.is_terminate_requested() {
                break HaltReason::Terminated;
            }
            if self.control.take_stop() {
                break HaltReason::Paused;
            }
            if self.cursor.is_none() {
                if limit.is_some_and(|limit| periods >= limit) {
                    break HaltReason::StepLimit;
                }
                if skip_stop_check {
                    skip_stop_check = false;
                } else if self.stop_condition_met()? {
                    break HaltReason::StopCondition;
                }
                self.begin_period()?;
            }
            if let Some(report) = self.run_stage()? {
                periods = periods.saturating_add(1);
                failures.extend(report.failures.iter().cloned());
                last_report = Some(report);
            }
        };
        self.finish_run(halt, periods, failures, last_report)
    }

    fn finish_run(
        &mut self,
        halt: HaltReason,
        periods: u64,
        mut failures: Vec<Failure>,
        last_report: Option<PeriodReport>,
    ) -> Result<RunOutcome, ModelError> {
        match halt {
            HaltReason::Terminated => self.terminate_now(),
            HaltReason::Paused | HaltReason::StepLimit => {
                self.transition(RunState::Paused);
                self.fire(EventKind::ModelStop)?;
            }
            HaltReason::StopCondition => {
                self.transition(RunState::Stopped);
                self.fire(EventKind::ModelStop)?;
            }
        }
        failures.append(&mut self.failures);

        info!(
            halt = ?halt,
            periods,
            period = self.clock.period(),
            failures = failures.len(),
            "run halted"
        );
        Ok(RunOutcome {
            halt,
            periods,
            failures,
            last_report,
        })
    }

    /// Fire `terminate`, export the series if `csv` names a path, drop
    /// every entity, and enter `Terminated`.
    pub(crate) fn terminate_now(&mut self) {
        let period = self.clock.period();
        let handlers = self.hooks.terminate.snapshot(None);
        if let Err(err) = self.dispatch(EventKind::Terminate, handlers, |h, m| h(m)) {
            error!(error = %err, "terminate hook failed");
        }

        if let Some(CheckEntry::Fixed(Value::Text(path))) =
            self.params.get_entry(CSV_EXPORT, None).cloned()
        {
            if let Err(err) = self.data.export(std::path::Path::new(&path)) {
                warn!(path = %path, error = %err, "series export failed");
                self.failures.push(Failure {
                    source: FailureSource::Export { path },
                    period,
                    message: err.to_string(),
                });
            }
        }

        self.agents.clear();
        if let Some(grid) = self.grid.as_mut() {
            grid.clear();
        }
        self.cursor = None;
        self.transition(RunState::Terminated);
        info!(model = %self.name(), period, "model terminated");
    }

    pub(crate) fn transition(&mut self, to: RunState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        let period = self.clock.period();
        info!(from = %from, to = %to, period, "run state changed");
        let mut observers = std::mem::take(&mut self.observers);
        for observer in &mut observers {
            observer.on_state_change(from, to, period);
        }
        self.observers = observers;
    }

    pub(crate) fn notify_period(&mut self, report: &PeriodReport) {
        let mut observers = std::mem::take(&mut self.observers);
        for observer in &mut observers {
            observer.on_period(report, self);
        }
        self.observers = observers;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::agents::PrimitiveSpec;
    use crate::model::STOP_AFTER;
    use crate::operator::ModelObserver;

    fn model() -> Model {
        let mut model = Model::with_seed("runner", 3);
        model
            .add_primitive("agent", PrimitiveSpec::with_count(2))
            .unwrap();
        model
    }

    struct Recorder(Arc<Mutex<Vec<(RunState, RunState)>>>);

    impl ModelObserver for Recorder {
        fn on_state_change(&mut self, from: RunState, to: RunState, _period: u64) {
            self.0.lock().unwrap().push((from, to));
        }
    }

    #[test]
    fn step_from_ready_runs_one_period_and_pauses() {
        let mut model = model();
        let outcome = model.step().unwrap();
        assert_eq!(outcome.halt, HaltReason::StepLimit);
        assert_eq!(outcome.periods, 1);
        assert_eq!(model.state(), RunState::Paused);
        assert_eq!(model.period(), 1);
        assert_eq!(model.agents().count("agent"), 2);
    }

    #[test]
    fn start_runs_until_stopafter() {
        let mut model = model();
        model
            .set_param(STOP_AFTER, None, CheckEntry::Fixed(Value::Int(5)))
            .unwrap();
        let outcome = model.start().unwrap();
        assert_eq!(outcome.halt, HaltReason::StopCondition);
        assert_eq!(model.period(), 5);
        assert_eq!(model.state(), RunState::Stopped);

        let resumed = model.step().unwrap();
        assert_eq!(resumed.periods, 1);
        assert_eq!(model.period(), 6);
    }

    #[test]
    fn stop_from_a_hook_pauses_mid_period() {
        let mut model = model();
        model.set_stages(2).unwrap();
        model.hooks.model_step.register(|m, stage| {
            if stage == 1 {
                m.stop();
            }
            Ok(())
        });
        let outcome = model.start().unwrap();
        assert_eq!(outcome.halt, HaltReason::Paused);
        assert_eq!(outcome.periods, 0);
        assert_eq!(model.pending_stage(), Some(2));

        let outcome = model.step().unwrap();
        assert_eq!(outcome.periods, 1);
        assert_eq!(model.period(), 1);
    }

    #[test]
    fn reentrant_start_is_rejected() {
        let mut model = model();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        model.hooks.model_pre_step.register(move |m| {
            *slot.lock().unwrap() = Some(matches!(m.start(), Err(ModelError::Reentrant)));
            Ok(())
        });
        model.step().unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }

    #[test]
    fn terminate_is_absorbing_and_clears_entities() {
        let mut model = model();
        model.step().unwrap();
        model.terminate();
        assert_eq!(model.state(), RunState::Terminated);
        assert!(model.agents().is_empty());
        assert!(matches!(model.start(), Err(ModelError::Terminated)));
        model.terminate();
        assert_eq!(model.state(), RunState::Terminated);
    }

    #[test]
    fn terminate_request_from_a_hook_ends_the_run() {
        let mut model = model();
        model.hooks.model_post_step.register(|m| {
            m.terminate();
            Ok(())
        });
        let outcome = model.start().unwrap();
        assert_eq!(outcome.halt, HaltReason::Terminated);
        assert_eq!(outcome.periods, 1);
        assert_eq!(model.state(), RunState::Terminated);
    }

    #[test]
    fn terminate_from_a_setup_hook_runs_no_period() {
        let mut model = model();
        let steps = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&steps);
        model.hooks.model_post_setup.register(|m| {
            m.terminate();
            Ok(())
        });
        model.hooks.model_pre_step.register(move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        let outcome = model.step().unwrap();
        assert_eq!(outcome.halt, HaltReason::Terminated);
        assert_eq!(outcome.periods, 0);
        assert_eq!(model.state(), RunState::Terminated);
        assert_eq!(model.period(), 0);
        assert!(model.agents().is_empty());
        assert_eq!(*steps.lock().unwrap(), 0);
        assert!(matches!(model.start(), Err(ModelError::Terminated)));
    }

    #[test]
    fn stop_from_a_setup_hook_pauses_before_period_zero() {
        let mut model = model();
        model
            .set_param(STOP_AFTER, None, CheckEntry::Fixed(Value::Int(5)))
            .unwrap();
        model.hooks.agent_init.register(|id, m| {
            if id == tessera_types::EntityId(0) {
                m.stop();
            }
            Ok(())
        });

        let outcome = model.start().unwrap();
        assert_eq!(outcome.halt, HaltReason::Paused);
        assert_eq!(outcome.periods, 0);
        assert_eq!(model.state(), RunState::Paused);
        assert_eq!(model.agents().count("agent"), 2);

        let outcome = model.start().unwrap();
        assert_eq!(outcome.halt, HaltReason::StopCondition);
        assert_eq!(model.period(), 5);
    }

    #[test]
    fn fatal_setup_failure_terminates() {
        let mut model = model();
        model
            .hooks
            .model_pre_setup
            .register(|_| Err(anyhow::anyhow!("no data")));
        let result = model.start();
        assert!(matches!(result, Err(ModelError::HookFailed { .. })));
        assert_eq!(model.state(), RunState::Terminated);
    }

    #[test]
    fn observers_see_transitions() {
        let mut model = model();
        let log = Arc::new(Mutex::new(Vec::new()));
        model.add_observer(Box::new(Recorder(Arc::clone(&log))));
        model.step().unwrap();
        model.terminate();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                (RunState::Ready, RunState::Running),
                (RunState::Running, RunState::Paused),
                (RunState::Paused, RunState::Terminated),
            ]
        );
    }

    #[test]
    fn params_lock_once_running() {
        let mut model = model();
        model.step().unwrap();
        assert!(model.params().is_locked());
        assert!(model.set_param("num_agent", None, 5.0).is_ok());
    }

    #[test]
    fn changing_stages_mid_period_terminates() {
        let mut model = model();
        model.hooks.model_pre_step.register(|m| {
            assert!(m.set_stages(3).is_err());
            Ok(())
        });
        let result = model.start();
        assert!(matches!(
            result,
            Err(ModelError::InvariantViolation { .. })
        ));
        assert_eq!(model.state(), RunState::Terminated);
    }
}
