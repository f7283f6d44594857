//! Shared type definitions for the Tessera simulation engine.
//!
//! This crate holds the plain value types that cross the boundary between
//! the engine, model code, and front-ends. Everything here is serializable
//! so control panels and plotting front-ends can consume it directly.
//!
//! # Modules
//!
//! - [`ids`] -- Strongly-typed entity identifiers
//! - [`enums`] -- Run states, execution order, grid neighborhoods
//! - [`value`] -- Entity attribute values and parameter values

pub mod enums;
pub mod ids;
pub mod value;

// Re-export all public types at crate root for convenience.
pub use enums::{ExecutionOrder, Neighborhood, RunState};
pub use ids::{EntityId, Position, Stage};
pub use value::{CheckEntry, ParamValue, Value};
