//! chantier: bounded pools of processes and in-process tasks.
//!
//! A [`Pool`] runs at most N tasks at once. [`Pool::submit`] waits for a free
//! slot, starts the task and returns immediately; a background watcher frees
//! the slot when the task ends and feeds the outcome to a
//! [`FailurePolicy`](policy::FailurePolicy). Once the policy trips, further
//! submissions are refused with [`PoolError::CircuitOpen`] until the pool is
//! re-armed. Process tasks can be given a deadline after which an
//! [`Escalator`] signals them until they exit.
//!
//! ```no_run
//! use std::time::Duration;
//! use chantier::{PoolConfig, ProcessPool, ProcessTask};
//! use chantier::policy::{Count, WithinInterval};
//!
//! # async fn run() -> Result<(), chantier::PoolError> {
//! let pool = ProcessPool::processes(
//!     PoolConfig::new(4)
//!         .with_policy(WithinInterval::new(Count::new(5), Duration::from_secs(60)))
//!         .with_kill_after(Duration::from_secs(120)),
//! )?;
//!
//! pool.submit_all(["a.png", "b.png"], |file| {
//!     ProcessTask::new("optipng").arg(file)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod error;
pub mod escalator;
pub mod policy;
pub mod pool;
pub mod slot;

/// Crate version from Cargo.toml.
pub const CHANTIER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use backend::{
    Backend, ProcessBackend, ProcessHandle, ProcessTask, TaskBackend, TaskFn, TaskHandle,
};
pub use error::{PoolError, TaskFailure};
pub use escalator::{EscalationConfig, Escalator, TerminationSignal};
pub use pool::{Pool, PoolConfig, PoolStatus, ProcessPool, TaskPool};
