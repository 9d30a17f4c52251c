//! Core types and error definitions for the Muster coordination engine.
//!
//! This crate holds the pure data model shared by every Muster crate: what an
//! agent can do, how much capacity it has, and how urgent a task is. Nothing
//! here performs I/O or holds engine state.
//!
//! # Main types
//!
//! - [`MusterError`]: Unified error enum for all Muster subsystems.
//! - [`MusterResult`]: Convenience alias for `Result<T, MusterError>`.
//! - [`Capability`]: A `(kind, level)` skill an agent has or a task needs.
//! - [`ResourceAllocation`]: An abstract `cpu / memory / storage` triple.
//! - [`Priority`]: Relative task urgency used for ready-set ordering.

/// Capability declarations and matching.
pub mod capability;
/// Error taxonomy.
pub mod error;
/// Task priority levels.
pub mod priority;
/// Abstract resource triples.
pub mod resources;

pub use capability::{satisfies_all, Capability};
pub use error::{MusterError, MusterResult};
pub use priority::Priority;
pub use resources::ResourceAllocation;

/// Identifier of a registered agent.
pub type AgentId = String;

/// Identifier of a task record.
pub type TaskId = String;
