//! Error types for pools and the tasks they run.

/// Why a single task counted as failed.
///
/// Task failures are recorded into the pool's failure policy and logged.
/// They only reach the submitter through [`PoolError::CircuitOpen`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskFailure {
    /// Process exited with a non-zero status.
    #[error("exited with status {code}")]
    Exit { code: i32 },

    /// Process was terminated by a signal (including escalation kills).
    #[error("terminated by signal {signal}")]
    Signaled { signal: i32 },

    /// In-process task returned an error.
    #[error("{0}")]
    Error(String),

    /// In-process task panicked.
    #[error("panicked: {0}")]
    Panicked(String),

    /// The outcome could not be observed.
    #[error("failed to wait for task: {0}")]
    Wait(String),
}

impl TaskFailure {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self::Panicked(message.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool was configured with fewer than one slot.
    #[error("need at least 1 slot, given {slots}")]
    Config { slots: usize },

    /// The failure policy tripped; no new work is accepted until it is re-armed.
    #[error("{}", circuit_open_message(.last_failure))]
    CircuitOpen { last_failure: Option<TaskFailure> },

    /// The backend could not start the task.
    #[error("failed to start task: {0}")]
    Spawn(#[from] std::io::Error),
}

impl PoolError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, PoolError::CircuitOpen { .. })
    }

    /// The task failure that was last recorded before the breaker refused work.
    pub fn last_failure(&self) -> Option<&TaskFailure> {
        match self {
            PoolError::CircuitOpen { last_failure } => last_failure.as_ref(),
            _ => None,
        }
    }
}

fn circuit_open_message(last_failure: &Option<TaskFailure>) -> String {
    match last_failure {
        Some(failure) => format!("reached failure limit of tasks (last failure: {failure})"),
        None => "reached failure limit of tasks".to_string(),
    }
}
