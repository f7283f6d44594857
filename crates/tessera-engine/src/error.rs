//! Error types for the engine binary.
//!
//! [`EngineError`] wraps every failure mode of startup and the run so
//! `main` can propagate with `?`.

/// Top-level error for the engine binary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: tessera_core::config::ConfigError,
    },

    /// Building or running the model failed.
    #[error("model error: {source}")]
    Model {
        /// The underlying model error.
        #[from]
        source: tessera_core::ModelError,
    },

    /// The blocking simulation task panicked or was cancelled.
    #[error("simulation task failed: {message}")]
    Task {
        /// Description of the join failure.
        message: String,
    },
}
