//! Task execution backends.
//!
//! A backend knows how to start one unit of work and how to observe its
//! outcome. The pool does everything else: slot accounting, failure policy,
//! watchers and escalation.
//!
//! - [`ProcessBackend`]: each task is an OS process; exit status 0 is success
//! - [`TaskBackend`]: each task runs in-process on the tokio runtime

mod process;
mod task;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::TaskFailure;

pub use process::{ProcessBackend, ProcessHandle, ProcessTask};
pub use task::{TaskBackend, TaskFn, TaskHandle};

/// Resolves once the task finishes, with its classified outcome.
pub type Completion = BoxFuture<'static, Result<(), TaskFailure>>;

/// A started task, handed back to the pool.
pub struct Launched<H> {
    /// Returned to the submitter and stored in the slot.
    pub handle: H,
    /// Owned by the watcher; awaited exactly once.
    pub completion: Completion,
    /// Process id the escalator may signal. `None` for tasks that cannot be
    /// terminated from outside.
    pub pid: Option<u32>,
    /// Cancelled once the task can no longer be signalled. Process backends
    /// cancel it as soon as the pid is reaped; the watcher cancels it after
    /// the completion resolves in every case.
    pub exited: CancellationToken,
}

impl<H> Launched<H> {
    pub fn new(handle: H, completion: Completion) -> Self {
        Self {
            handle,
            completion,
            pid: None,
            exited: CancellationToken::new(),
        }
    }

    /// `exited` must be cancelled by the completion right after reaping `pid`.
    pub fn with_pid(mut self, pid: u32, exited: CancellationToken) -> Self {
        self.pid = Some(pid);
        self.exited = exited;
        self
    }
}

/// Extension point for different ways of running work.
pub trait Backend: Send + Sync + 'static {
    /// What the caller submits.
    type Work: Send + 'static;
    /// What the caller gets back from `submit`.
    type Handle: Clone + Send + Sync + std::fmt::Debug + 'static;

    /// Start `work`. Called from within the tokio runtime.
    fn start(&self, work: Self::Work) -> std::io::Result<Launched<Self::Handle>>;

    /// Whether launched tasks can be forcibly terminated by signal.
    fn supports_termination(&self) -> bool {
        false
    }
}
