//! In-process backend: tasks run on the tokio runtime.
//!
//! Errors and panics raised by a task are captured and classified as
//! failures; they never unwind into the pool. There is no way to interrupt
//! a running task, so a task that hangs keeps its slot.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;

use super::{Backend, Launched};
use crate::error::TaskFailure;

type AsyncFn = dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;
type BlockingFn = dyn Fn() -> anyhow::Result<()> + Send + Sync;

/// A unit of in-process work. Cloning shares the underlying closure.
#[derive(Clone)]
pub enum TaskFn {
    /// Runs as a tokio task.
    Async(Arc<AsyncFn>),
    /// Runs on the blocking thread pool.
    Blocking(Arc<BlockingFn>),
}

impl TaskFn {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::Async(Arc::new(move || f().boxed()))
    }

    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::Blocking(Arc::new(f))
    }
}

impl std::fmt::Debug for TaskFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskFn::Async(_) => f.write_str("TaskFn::Async"),
            TaskFn::Blocking(_) => f.write_str("TaskFn::Blocking"),
        }
    }
}

/// Handle to an in-process task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    id: u64,
}

impl TaskHandle {
    /// Sequential id, unique within the backend that started the task.
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Default)]
pub struct TaskBackend {
    next_id: AtomicU64,
}

impl TaskBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for TaskBackend {
    type Work = TaskFn;
    type Handle = TaskHandle;

    fn start(&self, work: TaskFn) -> std::io::Result<Launched<TaskHandle>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let join = match work {
            TaskFn::Async(f) => tokio::spawn(async move { f().await }),
            TaskFn::Blocking(f) => tokio::task::spawn_blocking(move || f()),
        };

        let completion = async move {
            match join.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(TaskFailure::Error(format!("{e:#}"))),
                Err(e) if e.is_panic() => Err(TaskFailure::Panicked(panic_message(e.into_panic()))),
                Err(e) => Err(TaskFailure::Wait(e.to_string())),
            }
        }
        .boxed();

        Ok(Launched::new(TaskHandle { id }, completion))
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
