//! Simulation driver for the Tessera engine.
//!
//! Loads configuration, builds the model, registers the default population
//! reporters and a logging observer, and runs the model until it stops,
//! its stop condition holds, or Ctrl-C requests termination.
//!
//! # Startup Sequence
//!
//! 1. Initialize structured logging (tracing)
//! 2. Load configuration (first argument, `TESSERA_CONFIG`, or
//!    `tessera-config.yaml`)
//! 3. Build the model and register reporters and the observer
//! 4. Run the period loop on a blocking task, listening for Ctrl-C
//! 5. Terminate the model (writes the CSV export if configured)
//! 6. Log the result

mod error;
mod observer_callback;
mod reporters;

use std::path::PathBuf;

use tessera_core::Model;
use tessera_core::config::SimulationConfig;
use tessera_core::operator::ControlHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;
use crate::observer_callback::LogObserver;

/// Default configuration file, relative to the working directory.
const DEFAULT_CONFIG: &str = "tessera-config.yaml";

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration, model construction, or the run fails.
#[tokio::main]
async fn main() -> Result<(), EngineError> {
    // 1. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("tessera-engine starting");

    // 2. Load configuration.
    let config = load_config()?;
    info!(
        model = %config.model.name,
        seed = ?config.model.seed,
        stages = config.model.stages,
        stop_after = ?config.model.stop_after,
        "Configuration loaded"
    );

    // 3. Build the model.
    let mut model = Model::from_config(&config)?;
    reporters::register(&mut model, &config)?;
    model.add_observer(Box::new(LogObserver::new()));
    let control = model.control();

    // 4. Run on a blocking task; Ctrl-C requests termination.
    let run = tokio::task::spawn_blocking(move || {
        let outcome = model.start();
        (model, outcome)
    });
    tokio::pin!(run);

    let joined = tokio::select! {
        joined = &mut run => joined,
        signal = tokio::signal::ctrl_c() => {
            on_ctrl_c(signal, &control);
            run.await
        }
    };
    let (mut model, outcome) = joined.map_err(|e| EngineError::Task {
        message: e.to_string(),
    })?;

    // 5. Terminate (idempotent after a terminated run).
    model.terminate();
    let outcome = outcome?;

    // 6. Log the result.
    match serde_json::to_string(&outcome.summary()) {
        Ok(summary) => info!(summary = %summary, "run summary"),
        Err(e) => warn!(error = %e, "failed to serialize run summary"),
    }
    for failure in &outcome.failures {
        warn!(%failure, "recorded failure");
    }
    info!(
        halt = ?outcome.halt,
        periods = outcome.periods,
        period = model.period(),
        "tessera-engine shutdown complete"
    );
    Ok(())
}

/// Request termination on Ctrl-C. A failed signal listener leaves the run
/// going.
fn on_ctrl_c(signal: std::io::Result<()>, control: &ControlHandle) {
    match signal {
        Ok(()) => {
            info!("Ctrl-C received, terminating at the next stage boundary");
            control.request_terminate();
        }
        Err(e) => warn!(error = %e, "failed to listen for Ctrl-C, running to completion"),
    }
}

/// Resolve the configuration path and load it, falling back to defaults
/// when the file does not exist.
fn load_config() -> Result<SimulationConfig, EngineError> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TESSERA_CONFIG").ok())
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG), PathBuf::from);
    if path.exists() {
        let config = SimulationConfig::from_file(&path)?;
        info!(path = %path.display(), "Config file loaded");
        Ok(config)
    } else {
        info!(path = %path.display(), "Config file not found, using defaults");
        let mut config = SimulationConfig::default();
        config.apply_env_overrides()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctrl_c_requests_termination() {
        let control = ControlHandle::new();
        on_ctrl_c(Ok(()), &control);
        assert!(control.is_terminate_requested());
    }

    #[test]
    fn failed_signal_listener_leaves_the_run_going() {
        let control = ControlHandle::new();
        on_ctrl_c(Err(std::io::Error::other("no signal handler")), &control);
        assert!(!control.is_terminate_requested());
    }
}
