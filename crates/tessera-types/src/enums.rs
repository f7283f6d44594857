//! Enumeration types shared by the engine and its front-ends.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Run State
// ---------------------------------------------------------------------------

/// Lifecycle state of a model run.
///
/// ```text
/// Ready -> Running -> { Paused <-> Running } -> Stopped / Terminated
/// ```
///
/// `Paused` and `Stopped` are both resumable. `Terminated` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Constructed and configurable; no period has run yet.
    Ready,
    /// The period loop is executing.
    Running,
    /// Halted by an explicit stop request. May be mid-period.
    Paused,
    /// Halted because a stop condition was met at a period boundary.
    Stopped,
    /// Run ended for good. Entities have been released.
    Terminated,
}

impl RunState {
    /// Whether a run in this state may be (re)started.
    pub const fn is_resumable(self) -> bool {
        matches!(self, Self::Ready | Self::Paused | Self::Stopped)
    }
}

impl core::fmt::Display for RunState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Execution Order
// ---------------------------------------------------------------------------

/// Order in which the entities of a primitive are stepped each period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOrder {
    /// Strict creation order.
    #[default]
    Sequential,
    /// A fresh random permutation drawn once per period.
    Random,
}

// ---------------------------------------------------------------------------
// Grid Neighborhood
// ---------------------------------------------------------------------------

/// Neighbor relation on the spatial grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Neighborhood {
    /// Von Neumann neighborhood: north, south, east, west.
    #[default]
    Four,
    /// Moore neighborhood: the four orthogonal cells plus the diagonals.
    Eight,
}

impl Neighborhood {
    /// Coordinate offsets making up this neighborhood.
    pub const fn offsets(self) -> &'static [(i64, i64)] {
        match self {
            Self::Four => &[(0, -1), (1, 0), (0, 1), (-1, 0)],
            Self::Eight => &[
                (0, -1),
                (1, -1),
                (1, 0),
                (1, 1),
                (0, 1),
                (-1, 1),
                (-1, 0),
                (-1, -1),
            ],
        }
    }
}
