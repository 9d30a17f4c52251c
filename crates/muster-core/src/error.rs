use thiserror::Error;

/// A convenience `Result` alias using [`MusterError`].
pub type MusterResult<T> = Result<T, MusterError>;

/// Top-level error type for the Muster engine.
///
/// Validation and identity variants are returned before any state is
/// mutated. `Execution` and `Timeout` are produced at the scheduler boundary
/// and end up recorded on the failed task rather than propagated.
#[derive(Error, Debug)]
pub enum MusterError {
    /// Malformed agent or task descriptor.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An agent or task with this id already exists.
    #[error("Duplicate id: {0}")]
    Duplicate(String),

    /// No agent or task with this id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The task state machine does not allow this transition.
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        /// Task whose status change was rejected.
        task_id: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Swarm assembly could not find enough qualifying agents.
    #[error("Insufficient agents: required {required}, available {available}")]
    InsufficientAgents {
        /// Agents the template asked for.
        required: usize,
        /// Qualifying agents found in the registry.
        available: usize,
    },

    /// Raised by the execution collaborator.
    #[error("Execution error: {0}")]
    Execution(String),

    /// An execution exceeded its configured time budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Durable storage read or write failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Invalid or missing configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MusterError {
    /// Shorthand for building an [`MusterError::InvalidTransition`].
    pub fn invalid_transition(
        task_id: impl Into<String>,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            task_id: task_id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
