//! One simulation period.
//!
//! A period is: build the stepping order, `model_pre_step`, then for each
//! stage `model_step` followed by `agent_step` for every entity in order,
//! then shocks, data collection, milestones, `model_post_step`, and the
//! clock advance. The loop can halt at any stage boundary; the period
//! cursor remembers where to resume.

use std::sync::Arc;

use rand::seq::SliceRandom;
use tessera_types::{CheckEntry, EntityId, ExecutionOrder};
use tracing::{debug, info, warn};

use crate::error::{FailureSource, ModelError};
use crate::hooks::EventKind;
use crate::model::{Model, PeriodCursor, REFRESH, STOP_AFTER, whole_number};
use crate::runner::PeriodReport;

impl Model {
    /// Freeze the stepping order and fire `model_pre_step`.
    pub(crate) fn begin_period(&mut self) -> Result<(), ModelError> {
        let order = self.period_order()?;
        debug!(period = self.clock.period(), entities = order.len(), "period started");
        self.cursor = Some(PeriodCursor {
            next_stage: 1,
            order: order.into(),
        });
        self.fire(EventKind::ModelPreStep)
    }

    /// Primitives by descending priority; entities in creation order, or
    /// shuffled within each primitive under random order.
    fn period_order(&mut self) -> Result<Vec<EntityId>, ModelError> {
        let primitives: Vec<String> = self
            .agents
            .primitive_names()
            .into_iter()
            .map(str::to_owned)
            .collect();
        let mut order = Vec::with_capacity(self.agents.len());
        for primitive in primitives {
            let mut ids = self.agents.ids(&primitive)?;
            if self.order == ExecutionOrder::Random {
                ids.shuffle(&mut self.rng);
            }
            order.extend(ids);
        }
        Ok(order)
    }

    /// Run the next stage. Returns the period report when this stage
    /// completed the period.
    ///
    /// Entities removed earlier in the period are skipped. Entities
    /// created during the period first step in the next one.
    pub(crate) fn run_stage(&mut self) -> Result<Option<PeriodReport>, ModelError> {
        let Some((stage, order)) = self
            .cursor
            .as_ref()
            .map(|c| (c.next_stage, Arc::clone(&c.order)))
        else {
            return Err(ModelError::InvariantViolation {
                reason: "stage requested outside a period".to_owned(),
            });
        };

        let handlers = self.hooks.model_step.snapshot(None);
        self.dispatch(EventKind::ModelStep, handlers, |h, m| h(m, stage))?;

        let last = stage >= self.stages;
        for id in order.iter().copied() {
            if self.violation.is_some() {
                break;
            }
            let Some(primitive) = self.agents.get(id).map(|e| e.primitive().to_owned()) else {
                continue;
            };
            let handlers = self.hooks.agent_step.snapshot(Some(&primitive));
            self.dispatch(EventKind::AgentStep, handlers, |h, m| h(id, m, stage))?;
            if last {
                if let Some(entity) = self.agents.get_mut(id) {
                    entity.grow_older();
                }
            }
        }
        if let Some(reason) = self.violation.clone() {
            return Err(ModelError::InvariantViolation { reason });
        }

        if last {
            return self.finish_period().map(Some);
        }
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.next_stage = stage.saturating_add(1);
        }
        Ok(None)
    }

    fn finish_period(&mut self) -> Result<PeriodReport, ModelError> {
        let period = self.clock.period();

        let due = self.shocks.due(period, &mut self.rng);
        for (name, action) in due {
            self.run_shock(&name, &action);
        }
        self.collect_data(period);
        let milestones = self.check_milestones(period);
        self.fire(EventKind::ModelPostStep)?;

        self.clock.advance()?;
        self.cursor = None;

        let report = PeriodReport {
            period,
            shocks_fired: std::mem::take(&mut self.period_shocks),
            milestones,
            failures: std::mem::take(&mut self.failures),
            population: self.agents.len(),
        };
        debug!(
            period,
            population = report.population,
            failures = report.failures.len(),
            "period complete"
        );

        let refresh = self
            .params
            .get_f64(REFRESH, None)
            .and_then(whole_number)
            .unwrap_or(1)
            .max(1);
        if self.clock.period().checked_rem(refresh) == Some(0) {
            self.notify_period(&report);
        }
        Ok(report)
    }

    fn collect_data(&mut self, period: u64) {
        let reporters = self.data.reporters();
        let mut raw = Vec::with_capacity(reporters.len());
        for (index, name, reporter) in reporters {
            match reporter(self) {
                Ok(value) => raw.push((index, Some(value))),
                Err(err) => {
                    warn!(series = %name, period, error = %format!("{err:#}"), "reporter failed");
                    self.record_failure(FailureSource::Reporter { name }, &err);
                    raw.push((index, None));
                }
            }
        }
        self.data.push_period(period, &raw);
    }

    fn check_milestones(&mut self, period: u64) -> Vec<String> {
        let mut fired = Vec::new();
        for (name, trigger) in self.milestones.pending() {
            if trigger(self) {
                info!(milestone = %name, period, "milestone reached");
                self.milestones.record(&name, period);
                fired.push(name);
            }
        }
        fired
    }

    /// Whether the run should stop at this period boundary.
    ///
    /// `stopafter` holding `Fixed(n)` stops when `t == n`; holding
    /// `Predicate(name)` stops right after that milestone fired. Otherwise
    /// the first `stop_condition` handler returning `true` stops the run.
    pub(crate) fn stop_condition_met(&mut self) -> Result<bool, ModelError> {
        let period = self.clock.period();
        let by_param = match self.params.get_entry(STOP_AFTER, None) {
            Some(CheckEntry::Fixed(value)) => value.as_f64().and_then(whole_number) == Some(period),
            Some(CheckEntry::Predicate(milestone)) => {
                let last = self.milestones.last_fired(milestone);
                last.is_some() && last == self.clock.last_completed()
            }
            Some(CheckEntry::Off) | None => false,
        };
        if by_param {
            info!(period, "stop condition reached: {STOP_AFTER}");
            return Ok(true);
        }

        let handlers = self.hooks.stop_condition.snapshot(None);
        for (key, handler) in handlers {
            match handler(self) {
                Ok(true) => {
                    info!(period, key = %key, "stop condition reached");
                    return Ok(true);
                }
                Ok(false) => {}
                Err(err) => self.hook_failed(EventKind::StopCondition, &key, &err)?,
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::sync::Mutex;

    use tessera_types::Value;

    use super::*;
    use crate::agents::PrimitiveSpec;

    fn model(count: u64) -> Model {
        let mut model = Model::with_seed("period", 9);
        model
            .add_primitive("agent", PrimitiveSpec::with_count(count))
            .unwrap();
        model.setup().unwrap();
        model
    }

    #[test]
    fn higher_priority_primitives_step_first() {
        let mut model = Model::with_seed("period", 1);
        model
            .add_primitive("low", PrimitiveSpec::with_count(2))
            .unwrap();
        model
            .add_primitive(
                "high",
                PrimitiveSpec {
                    priority: 5,
                    ..PrimitiveSpec::with_count(2)
                },
            )
            .unwrap();
        model.setup().unwrap();
        let order = model.period_order().unwrap();
        let primitives: Vec<&str> = order
            .iter()
            .map(|id| model.entity(*id).unwrap().primitive())
            .collect();
        assert_eq!(primitives, vec!["high", "high", "low", "low"]);
    }

    #[test]
    fn random_order_is_a_permutation() {
        let mut model = model(20);
        model.set_order(ExecutionOrder::Random);
        let mut order = model.period_order().unwrap();
        let mut ids = model.agents().ids("agent").unwrap();
        order.sort();
        ids.sort();
        assert_eq!(order, ids);
    }

    #[test]
    fn stages_run_in_sequence_and_age_once() {
        let mut model = model(1);
        model.set_stages(3).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        model.hooks.agent_step.register(move |_, _, stage| {
            log.lock().unwrap().push(stage);
            Ok(())
        });

        model.begin_period().unwrap();
        assert!(model.run_stage().unwrap().is_none());
        assert!(model.run_stage().unwrap().is_none());
        let report = model.run_stage().unwrap().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(report.period, 0);
        assert_eq!(model.period(), 1);
        let id = model.agents().ids("agent").unwrap()[0];
        assert_eq!(model.entity(id).unwrap().age(), 1);
    }

    #[test]
    fn stage_outside_period_is_rejected() {
        let mut model = model(0);
        assert!(matches!(
            model.run_stage(),
            Err(ModelError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn stopafter_compares_for_equality() {
        let mut model = model(0);
        model
            .set_param(STOP_AFTER, None, CheckEntry::Fixed(Value::Int(1)))
            .unwrap();
        assert!(!model.stop_condition_met().unwrap());
        model.begin_period().unwrap();
        model.run_stage().unwrap();
        assert!(model.stop_condition_met().unwrap());
    }

    #[test]
    fn stopafter_milestone_stops_after_it_fires() {
        let mut model = model(0);
        model
            .milestones
            .add("late", false, |m| m.period() == 1)
            .unwrap();
        model
            .set_param(STOP_AFTER, None, CheckEntry::Predicate("late".to_owned()))
            .unwrap();
        for _ in 0..2 {
            assert!(!model.stop_condition_met().unwrap());
            model.begin_period().unwrap();
            model.run_stage().unwrap();
        }
        assert!(model.stop_condition_met().unwrap());
    }

    #[test]
    fn failing_reporter_records_missing_value() {
        let mut model = model(0);
        model
            .data
            .add_reporter("bad", |_| Err(anyhow::anyhow!("boom")))
            .unwrap();
        model.data.add_reporter("good", |_| Ok(1.0)).unwrap();
        model.begin_period().unwrap();
        let report = model.run_stage().unwrap().unwrap();
        assert_eq!(model.data.series("bad").unwrap(), &[None]);
        assert_eq!(model.data.last("good"), Some(1.0));
        assert_eq!(report.failures.len(), 1);
    }
}
