//! End-to-end properties of the period scheduler.
//!
//! Every test drives a seeded model through the public API only: hook
//! ordering, entity removal and lineage, random iteration order, parameter
//! locking, reporter failures, pause and resume, and shocks.

// Integration tests use unwrap and indexing for clarity -- panicking on
// failure is the correct behavior in test code.
#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

use std::sync::{Arc, Mutex};

use tessera_core::Model;
use tessera_core::agents::PrimitiveSpec;
use tessera_core::error::ModelError;
use tessera_core::hooks::HookOptions;
use tessera_core::model::STOP_AFTER;
use tessera_core::operator::HaltReason;
use tessera_core::params::{ParamDef, ParamError};
use tessera_core::shocks::ShockTimer;
use tessera_types::{CheckEntry, EntityId, ExecutionOrder, RunState, Stage, Value};

type Log<T> = Arc<Mutex<Vec<T>>>;

fn log<T>() -> Log<T> {
    Arc::new(Mutex::new(Vec::new()))
}

fn agents(seed: u64, count: u64) -> Model {
    let mut model = Model::with_seed("properties", seed);
    model
        .add_primitive("agent", PrimitiveSpec::with_count(count))
        .unwrap();
    model
}

/// Record the entity order of the first period's `agent_step` calls.
fn first_period_order(seed: u64) -> Vec<EntityId> {
    let mut model = agents(seed, 20);
    model.set_order(ExecutionOrder::Random);
    let seen = log();
    let sink = Arc::clone(&seen);
    model.hooks.agent_step.register(move |id, _, _| {
        sink.lock().unwrap().push(id);
        Ok(())
    });
    model.step().unwrap();
    let order = seen.lock().unwrap().clone();
    order
}

// =============================================================================
// Hook dispatch
// =============================================================================

#[test]
fn dispatch_follows_priority_then_registration_order() {
    let mut model = agents(1, 0);
    let seen: Log<&'static str> = log();

    let mut register = |label: &'static str, priority: i32| {
        let sink = Arc::clone(&seen);
        model
            .hooks
            .model_pre_step
            .register_with(
                HookOptions::default()
                    .with_priority(priority)
                    .with_key(label),
                move |_| {
                    sink.lock().unwrap().push(label);
                    Ok(())
                },
            )
            .unwrap()
    };
    register("low", -5);
    register("first-zero", 0);
    register("high", 10);
    register("doomed", 3);
    register("second-zero", 0);
    assert!(model.hooks.model_pre_step.remove("doomed"));
    assert!(!model.hooks.model_pre_step.remove("doomed"));

    model.step().unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["high", "first-zero", "second-zero", "low"]
    );
}

#[test]
fn failing_hook_is_skipped_and_reported() {
    let mut model = agents(1, 1);
    let ran = log();
    let sink = Arc::clone(&ran);
    model
        .hooks
        .model_post_step
        .register(|_| Err(anyhow::anyhow!("broken model code")));
    model.hooks.model_post_step.register(move |m| {
        sink.lock().unwrap().push(m.period());
        Ok(())
    });

    let outcome = model.step().unwrap();
    assert_eq!(*ran.lock().unwrap(), vec![0]);
    assert_eq!(outcome.failures.len(), 1);
    assert!(outcome.failures[0].message.contains("broken model code"));
}

// =============================================================================
// Entity lifecycle
// =============================================================================

#[test]
fn removing_the_middle_entity_keeps_relative_order() {
    let mut model = agents(1, 0);
    model.setup().unwrap();
    let ids = model.create_agents("agent", None, 3).unwrap();
    assert!(model.kill(ids[1]).unwrap());
    assert_eq!(model.agents().ids("agent").unwrap(), vec![ids[0], ids[2]]);
}

#[test]
fn removed_entities_never_reappear() {
    let mut model = agents(3, 4);
    model.setup().unwrap();
    let ids = model.agents().ids("agent").unwrap();
    let child = model.reproduce(&[ids[0], ids[1]]).unwrap();
    model.kill(ids[0]).unwrap();

    let stepped = log();
    let sink = Arc::clone(&stepped);
    model.hooks.agent_step.register(move |id, _, _| {
        sink.lock().unwrap().push(id);
        Ok(())
    });
    model.run_periods(3).unwrap();

    assert!(!stepped.lock().unwrap().contains(&ids[0]));
    assert!(model.agents().all().all(|e| !e.parents().contains(&ids[0])));
    assert_eq!(model.entity(child).unwrap().parents(), &[ids[1]]);
    let fresh = model.create_agents("agent", None, 1).unwrap();
    assert!(fresh[0] > child);
}

#[test]
fn entity_killed_mid_period_is_not_stepped() {
    let mut model = agents(1, 3);
    model.setup().unwrap();
    let ids = model.agents().ids("agent").unwrap();
    let victim = ids[2];
    let first = ids[0];

    let stepped = log();
    let sink = Arc::clone(&stepped);
    model.hooks.agent_step.register(move |id, m, _| {
        if id == first {
            m.kill(victim)?;
        }
        sink.lock().unwrap().push(id);
        Ok(())
    });
    model.step().unwrap();
    assert_eq!(*stepped.lock().unwrap(), vec![ids[0], ids[1]]);
}

#[test]
fn newborns_first_step_in_the_next_period() {
    let mut model = agents(1, 1);
    let stepped: Log<(u64, EntityId)> = log();
    let sink = Arc::clone(&stepped);
    model.hooks.agent_step.register(move |id, m, _| {
        if m.period() == 0 {
            m.reproduce(&[id])?;
        }
        sink.lock().unwrap().push((m.period(), id));
        Ok(())
    });
    model.run_periods(2).unwrap();

    let stepped = stepped.lock().unwrap();
    assert_eq!(stepped.iter().filter(|(p, _)| *p == 0).count(), 1);
    assert_eq!(stepped.iter().filter(|(p, _)| *p == 1).count(), 2);
}

// =============================================================================
// Random iteration order
// =============================================================================

#[test]
fn random_order_is_a_permutation_reproducible_by_seed() {
    let first = first_period_order(11);
    let again = first_period_order(11);
    let other = first_period_order(12);

    assert_eq!(first, again);
    assert_ne!(first, other);

    let mut sorted = first.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), 20);
    let mut expected = other;
    expected.sort();
    assert_eq!(sorted, expected);
}

// =============================================================================
// Parameters
// =============================================================================

#[test]
fn non_runtime_param_locks_while_running() {
    let mut model = agents(1, 0);
    model
        .add_param(ParamDef::slider("rate", "Rate", 1.0, 0.0, 5.0, 1.0).runtime(false))
        .unwrap();
    model.set_param("rate", None, 2.0).unwrap();

    let rejected = log();
    let sink = Arc::clone(&rejected);
    model.hooks.model_pre_step.register(move |m| {
        let err = m.set_param("rate", None, 4.0).unwrap_err();
        sink.lock().unwrap().push(matches!(
            err,
            ModelError::Param {
                source: ParamError::Locked { .. }
            }
        ));
        assert_eq!(m.param_f64("rate", None), Some(2.0));
        Ok(())
    });
    let outcome = model.step().unwrap();
    assert!(outcome.failures.is_empty());
    assert_eq!(*rejected.lock().unwrap(), vec![true]);
}

#[test]
fn slider_scenario() {
    let mut model = agents(1, 0);
    model
        .add_param(ParamDef::slider("x", "X", 5.0, 0.0, 10.0, 1.0))
        .unwrap();
    assert!(model.set_param("x", None, 12.0).is_err());
    assert_eq!(model.param_f64("x", None), Some(5.0));
    model.set_param("x", None, 7.0).unwrap();
    assert_eq!(model.param_f64("x", None), Some(7.0));
}

// =============================================================================
// Data collection
// =============================================================================

#[test]
fn failing_reporter_leaves_a_gap_and_the_run_continues() {
    let mut model = agents(1, 2);
    model
        .data
        .add_reporter("flaky", |m| {
            if m.period() == 1 {
                anyhow::bail!("sensor offline");
            }
            Ok(1.0)
        })
        .unwrap();
    let outcome = model.run_periods(3).unwrap();

    assert_eq!(outcome.periods, 3);
    assert_eq!(
        model.data.series("flaky").unwrap(),
        &[Some(1.0), None, Some(1.0)]
    );
    assert_eq!(outcome.failures.len(), 1);

    let mut csv = Vec::new();
    model.data.write_csv(&mut csv).unwrap();
    let csv = String::from_utf8(csv).unwrap();
    assert!(csv.contains("1,NA"));
}

// =============================================================================
// Pause and resume
// =============================================================================

#[test]
fn pause_mid_period_resumes_remaining_stages_once() {
    let mut model = agents(1, 1);
    model.set_stages(3).unwrap();
    let stages: Log<(u64, Stage)> = log();
    let sink = Arc::clone(&stages);
    model.hooks.model_step.register(move |m, stage| {
        sink.lock().unwrap().push((m.period(), stage));
        if m.period() == 0 && stage == 2 {
            m.stop();
        }
        Ok(())
    });

    let outcome = model.start().unwrap();
    assert_eq!(outcome.halt, HaltReason::Paused);
    assert_eq!(model.state(), RunState::Paused);
    assert_eq!(model.period(), 0);

    model.step().unwrap();
    model.step().unwrap();
    assert_eq!(
        *stages.lock().unwrap(),
        vec![(0, 1), (0, 2), (0, 3), (1, 1), (1, 2), (1, 3)]
    );
    assert_eq!(model.period(), 2);
}

#[test]
fn control_handle_stops_from_another_thread() {
    let mut model = agents(1, 1);
    let control = model.control();
    model.hooks.model_post_step.register(move |m| {
        if m.period() == 4 {
            control.request_stop();
        }
        Ok(())
    });
    let outcome = model.start().unwrap();
    assert_eq!(outcome.halt, HaltReason::Paused);
    assert_eq!(model.period(), 5);
}

#[test]
fn stopafter_halts_and_resume_continues() {
    let mut model = agents(1, 1);
    model
        .set_param(STOP_AFTER, None, CheckEntry::Fixed(Value::Int(3)))
        .unwrap();
    let outcome = model.start().unwrap();
    assert_eq!(outcome.halt, HaltReason::StopCondition);
    assert_eq!(outcome.periods, 3);
    assert_eq!(model.state(), RunState::Stopped);

    let control = model.control();
    model.hooks.model_post_step.register(move |m| {
        if m.period() == 5 {
            control.request_stop();
        }
        Ok(())
    });
    let outcome = model.start().unwrap();
    assert_eq!(outcome.halt, HaltReason::Paused);
    assert_eq!(model.period(), 6);
}

// =============================================================================
// Shocks
// =============================================================================

#[test]
fn certain_shock_fires_every_period_and_impossible_never() {
    let mut model = agents(5, 0);
    let hits = log();
    let sink = Arc::clone(&hits);
    model
        .shocks
        .add("always", ShockTimer::Random { probability: 1.0 }, move |m| {
            sink.lock().unwrap().push(m.period());
            Ok(())
        })
        .unwrap();
    model
        .shocks
        .add("never", ShockTimer::Random { probability: 0.0 }, |_| {
            Err(anyhow::anyhow!("must not fire"))
        })
        .unwrap();

    let outcome = model.run_periods(1000).unwrap();
    assert_eq!(outcome.periods, 1000);
    assert_eq!(hits.lock().unwrap().len(), 1000);
    assert!(model.shocks.get("never").unwrap().fired().is_empty());
    assert!(outcome.failures.is_empty());
}

#[test]
fn inactive_shock_is_skipped_but_can_be_triggered() {
    let mut model = agents(5, 0);
    model
        .shocks
        .add("boom", ShockTimer::Random { probability: 1.0 }, |_| Ok(()))
        .unwrap();
    model.shocks.set_active("boom", false).unwrap();
    model.run_periods(5).unwrap();
    assert!(model.shocks.get("boom").unwrap().fired().is_empty());

    model.trigger_shock("boom").unwrap();
    assert_eq!(model.shocks.get("boom").unwrap().fired(), &[5]);
}

// =============================================================================
// Termination
// =============================================================================

#[test]
fn terminate_exports_csv_and_is_irreversible() {
    let path = std::env::temp_dir().join(format!("tessera-export-{}.csv", std::process::id()));
    let mut model = agents(1, 2);
    model
        .data
        .add_reporter("agents", |m| {
            #[allow(clippy::cast_precision_loss)]
            let count = m.agents().count("agent") as f64;
            Ok(count)
        })
        .unwrap();
    model
        .set_param(
            "csv",
            None,
            CheckEntry::Fixed(Value::Text(path.display().to_string())),
        )
        .unwrap();
    model.run_periods(2).unwrap();
    model.terminate();

    let written = std::fs::read_to_string(&path).unwrap();
    assert_eq!(written, "period,agents\n0,2\n1,2\n");
    std::fs::remove_file(&path).unwrap();

    assert_eq!(model.state(), RunState::Terminated);
    assert!(matches!(model.step(), Err(ModelError::Terminated)));
}

#[test]
fn terminate_mid_stage_finishes_only_the_current_stage() {
    let mut model = agents(1, 2);
    model.set_stages(3).unwrap();
    let stages: Log<(&'static str, Stage)> = log();
    let model_sink = Arc::clone(&stages);
    model.hooks.model_step.register(move |_, stage| {
        model_sink.lock().unwrap().push(("model", stage));
        Ok(())
    });
    let agent_sink = Arc::clone(&stages);
    model.hooks.agent_step.register(move |_, m, stage| {
        agent_sink.lock().unwrap().push(("agent", stage));
        if stage == 1 {
            m.terminate();
        }
        Ok(())
    });
    let post_steps = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&post_steps);
    model.hooks.model_post_step.register(move |_| {
        *counter.lock().unwrap() += 1;
        Ok(())
    });

    let outcome = model.start().unwrap();
    assert_eq!(outcome.halt, HaltReason::Terminated);
    assert_eq!(outcome.periods, 0);
    assert_eq!(
        *stages.lock().unwrap(),
        vec![("model", 1), ("agent", 1), ("agent", 1)]
    );
    assert_eq!(*post_steps.lock().unwrap(), 0);
    assert_eq!(model.period(), 0);
    assert_eq!(model.state(), RunState::Terminated);
    assert!(model.agents().is_empty());
}
