//! Task coordination engine: agent registry, dependency-aware task store,
//! workload splitting, swarm assembly, and the scheduler loop.
//!
//! # Main types
//!
//! - [`Coordinator`]: The scheduling authority. Owns engine state behind one lock and runs executions.
//! - [`EngineState`]: Registry and task store, mutated together under one lock.
//! - [`AgentRegistry`]: Known agents with their capabilities and resource budgets.
//! - [`TaskStore`]: Task records with the status state machine and dependency resolution.
//! - [`TaskExecutor`]: Seam to whatever actually runs a task.
//! - [`EventBus`]: Broadcast of task and agent state changes.

/// Engine configuration.
pub mod config;
/// Scheduler loop and public engine facade.
pub mod coordinator;
/// Engine events and subscriptions.
pub mod events;
/// Execution seam and built-in executors.
pub mod executor;
/// Per-agent execution metrics.
pub mod monitor;
/// Agent registry.
pub mod registry;
/// Serialized engine state.
pub mod snapshot;
/// Workload splitting for divisible tasks.
pub mod splitter;
/// Coupled engine state and cycle planning.
pub mod state;
/// Swarm assembly.
pub mod swarm;
/// Task store and dependency resolution.
pub mod task_store;
/// Agent and task model.
pub mod types;

pub use config::{CoordinationStrategy, EngineConfig, ExecutionConfig};
pub use coordinator::{Coordinator, RunSummary};
pub use events::{EngineEvent, EventBus, KeyedReceiver};
pub use executor::{ExecutionOutcome, NoopExecutor, ShellExecutor, TaskExecutor};
pub use monitor::{AgentMonitor, AgentMetrics};
pub use registry::AgentRegistry;
pub use snapshot::{EngineSnapshot, SNAPSHOT_VERSION};
pub use splitter::split;
pub use state::{Assignment, CycleReport, EngineState, Launch, Settlement};
pub use swarm::{assemble, AssemblyContext, Swarm, SwarmTemplate};
pub use task_store::{StatusChange, TaskCounts, TaskFilter, TaskStore};
pub use types::{
    Agent, AgentDescriptor, AgentResources, AgentState, AgentStatus, Chunk, Task, TaskDescriptor,
    TaskOutcome, TaskStatus,
};
