//! OS process backend.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{Backend, Launched};
use crate::error::TaskFailure;

/// Description of a process to run. Cheap to clone, so the same task can be
/// submitted many times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessTask {
    pub program: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_dir: Option<PathBuf>,
}

impl ProcessTask {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    /// Run `script` through `sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(false);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Handle to a spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ProcessHandle {
    pid: u32,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Runs each task as a child process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessBackend;

impl ProcessBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for ProcessBackend {
    type Work = ProcessTask;
    type Handle = ProcessHandle;

    fn start(&self, task: ProcessTask) -> std::io::Result<Launched<ProcessHandle>> {
        let mut child = task.command().spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| std::io::Error::other("process exited before its pid was read"))?;

        tracing::debug!(pid, program = %task.program, "Spawned task process");

        let exited = CancellationToken::new();
        let reaped = exited.clone();
        let completion = async move {
            let status = child.wait().await;
            reaped.cancel();
            match status {
                Ok(status) => classify(status),
                Err(e) => Err(TaskFailure::Wait(e.to_string())),
            }
        }
        .boxed();

        Ok(Launched::new(ProcessHandle { pid }, completion).with_pid(pid, exited))
    }

    fn supports_termination(&self) -> bool {
        cfg!(unix)
    }
}

/// Exit status 0 is success; any other status or a signal is a failure.
fn classify(status: ExitStatus) -> Result<(), TaskFailure> {
    if status.success() {
        return Ok(());
    }
    if let Some(code) = status.code() {
        return Err(TaskFailure::Exit { code });
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Err(TaskFailure::Signaled { signal });
        }
    }
    Err(TaskFailure::Wait(format!("unrecognized exit status: {status}")))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_exit_is_success() {
        let launched = ProcessBackend.start(ProcessTask::new("true")).unwrap();
        assert!(launched.pid.is_some());
        assert_eq!(launched.pid, Some(launched.handle.pid()));
        assert_eq!(launched.completion.await, Ok(()));
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let launched = ProcessBackend.start(ProcessTask::shell("exit 3")).unwrap();
        assert_eq!(launched.completion.await, Err(TaskFailure::Exit { code: 3 }));
    }

    #[tokio::test]
    async fn signal_is_failure() {
        let launched = ProcessBackend.start(ProcessTask::shell("kill -9 $$")).unwrap();
        assert_eq!(
            launched.completion.await,
            Err(TaskFailure::Signaled { signal: 9 })
        );
    }

    #[tokio::test]
    async fn reaping_cancels_exited_token() {
        let launched = ProcessBackend.start(ProcessTask::new("true")).unwrap();
        let exited = launched.exited.clone();
        assert!(!exited.is_cancelled());

        assert_eq!(launched.completion.await, Ok(()));
        assert!(exited.is_cancelled());
    }

    #[tokio::test]
    async fn missing_program_fails_to_start() {
        let result = ProcessBackend.start(ProcessTask::new("/nonexistent/chantier-test-binary"));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn env_and_current_dir_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let task = ProcessTask::shell(r#"printf '%s' "$GREETING" > out.txt"#)
            .env("GREETING", "bonjour")
            .current_dir(dir.path());

        let launched = ProcessBackend.start(task).unwrap();
        assert_eq!(launched.completion.await, Ok(()));
        let written = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(written, "bonjour");
    }

    #[test]
    fn shell_task_builds_sh_invocation() {
        let task = ProcessTask::shell("echo hi").arg("sh").arg("extra");
        assert_eq!(task.program, "sh");
        assert_eq!(task.args, vec!["-c", "echo hi", "sh", "extra"]);
    }

    #[test]
    fn process_task_serializes_compactly() {
        let task = ProcessTask::new("convert").args(["in.png", "out.jpg"]);
        insta::assert_json_snapshot!(task, @r#"
        {
          "program": "convert",
          "args": [
            "in.png",
            "out.jpg"
          ]
        }
        "#);
    }
}
