//! Model-level errors and recorded callback failures.
//!
//! Configuration errors are returned synchronously from the call that
//! caused them and leave the model unchanged. Failures of user callbacks
//! during a run are not errors: they are captured as [`Failure`] records,
//! logged, and surfaced through the period report and the run outcome.

use tessera_types::RunState;

use crate::agents::AgentError;
use crate::clock::ClockError;
use crate::config::ConfigError;
use crate::data::DataError;
use crate::goods::GoodsError;
use crate::hooks::{EventKind, HookError, HookKey};
use crate::milestones::MilestoneError;
use crate::params::ParamError;
use crate::shocks::ShockError;
use crate::spatial::SpatialError;

/// Errors returned by [`Model`](crate::Model) operations.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// The period clock failed.
    #[error("clock error: {source}")]
    Clock {
        /// The underlying clock error.
        #[from]
        source: ClockError,
    },

    /// A hook could not be registered.
    #[error("hook error: {source}")]
    Hook {
        /// The underlying hook error.
        #[from]
        source: HookError,
    },

    /// A parameter operation was rejected.
    #[error("parameter error: {source}")]
    Param {
        /// The underlying parameter error.
        #[from]
        source: ParamError,
    },

    /// An agent registry operation was rejected.
    #[error("agent error: {source}")]
    Agent {
        /// The underlying registry error.
        #[from]
        source: AgentError,
    },

    /// A goods registry operation was rejected.
    #[error("goods error: {source}")]
    Goods {
        /// The underlying goods error.
        #[from]
        source: GoodsError,
    },

    /// A shock operation was rejected.
    #[error("shock error: {source}")]
    Shock {
        /// The underlying shock error.
        #[from]
        source: ShockError,
    },

    /// A data collector operation failed.
    #[error("data error: {source}")]
    Data {
        /// The underlying collector error.
        #[from]
        source: DataError,
    },

    /// A milestone could not be registered.
    #[error("milestone error: {source}")]
    Milestone {
        /// The underlying milestone error.
        #[from]
        source: MilestoneError,
    },

    /// A spatial grid operation was rejected.
    #[error("spatial error: {source}")]
    Spatial {
        /// The underlying grid error.
        #[from]
        source: SpatialError,
    },

    /// Loading the configuration failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying configuration error.
        #[from]
        source: ConfigError,
    },

    /// The requested action is not allowed in the current run state.
    #[error("cannot {action} while {from}")]
    InvalidTransition {
        /// Current run state.
        from: RunState,
        /// The attempted action.
        action: &'static str,
    },

    /// The model has been terminated; the run cannot continue.
    #[error("model has been terminated")]
    Terminated,

    /// `start` or `step` was called from inside the running loop.
    #[error("the period loop is already running")]
    Reentrant,

    /// A handler of a fatal event failed and aborted the run.
    #[error("fatal hook {key} on {event} failed: {message}")]
    HookFailed {
        /// The event being dispatched.
        event: EventKind,
        /// Key of the failing handler.
        key: HookKey,
        /// Rendered error chain.
        message: String,
    },

    /// Stage count must be at least 1.
    #[error("stage count must be at least 1")]
    InvalidStageCount,

    /// Continuing would corrupt period indexing; the run was terminated.
    #[error("scheduler invariant violated: {reason}")]
    InvariantViolation {
        /// What went wrong.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Recorded Failures
// ---------------------------------------------------------------------------

/// Where a recoverable callback failure came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureSource {
    /// A hook handler.
    Hook {
        /// The event being dispatched.
        event: EventKind,
        /// Key of the failing handler.
        key: HookKey,
    },
    /// A shock action.
    Shock {
        /// Shock name.
        name: String,
    },
    /// A data reporter.
    Reporter {
        /// Series name.
        name: String,
    },
    /// A parameter change callback.
    ParamCallback {
        /// Parameter name.
        name: String,
    },
    /// Writing the series export at termination.
    Export {
        /// Target path.
        path: String,
    },
}

impl core::fmt::Display for FailureSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Hook { event, key } => write!(f, "hook {key} on {event}"),
            Self::Shock { name } => write!(f, "shock {name}"),
            Self::Reporter { name } => write!(f, "reporter {name}"),
            Self::ParamCallback { name } => write!(f, "callback of parameter {name}"),
            Self::Export { path } => write!(f, "export to {path}"),
        }
    }
}

/// A user callback failed; the run continued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// The failing callback.
    pub source: FailureSource,
    /// Period during which it failed.
    pub period: u64,
    /// Rendered error chain.
    pub message: String,
}

impl core::fmt::Display for Failure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "period {}: {} failed: {}", self.period, self.source, self.message)
    }
}
