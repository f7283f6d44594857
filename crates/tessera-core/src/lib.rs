//! Period scheduler, hook bus, parameters, and data collection for the
//! Tessera simulation engine.
//!
//! A [`Model`] drives a population of entities through discrete periods.
//! Model code attaches behavior through the typed hook bus, exposes tunable
//! parameters, schedules shocks, and records time series; front-ends follow
//! the run through observers and control it through a [`ControlHandle`].
//!
//! # Modules
//!
//! - [`agents`] -- Primitives, breeds, entities, and lineage.
//! - [`clock`] -- The period counter.
//! - [`config`] -- Configuration loading from `tessera-config.yaml`.
//! - [`data`] -- Reporters, derived series, summary statistics, CSV export.
//! - [`error`] -- [`ModelError`] and recorded [`Failure`]s.
//! - [`goods`] -- Goods and endowments.
//! - [`hooks`] -- The typed hook registry.
//! - [`milestones`] -- Named predicates checked every period.
//! - [`model`] -- The [`Model`] aggregate and the entity lifecycle.
//! - [`operator`] -- External control, observers, and status snapshots.
//! - [`params`] -- Parameter definitions, validation, and storage.
//! - [`runner`] -- The run-state machine.
//! - [`shocks`] -- Timed and manual perturbations.
//! - [`spatial`] -- The optional grid of patches.
//!
//! [`ControlHandle`]: operator::ControlHandle

pub mod agents;
pub mod clock;
pub mod config;
pub mod data;
pub mod error;
pub mod goods;
pub mod hooks;
pub mod milestones;
pub mod model;
pub mod operator;
pub mod params;
mod period;
pub mod runner;
pub mod shocks;
pub mod spatial;

pub use error::{Failure, FailureSource, ModelError};
pub use model::Model;
pub use runner::{PeriodReport, RunOutcome};
