//! Forced termination of processes that outlive their time limit.
//!
//! Once `kill_after` has elapsed, the escalator walks an ordered list of
//! signals from polite to fatal, pausing between each so the process gets a
//! chance to exit cleanly. It never touches the slot table: a killed process
//! is reaped by the ordinary watcher like any other exit.
//!
//! The process backend cancels the escalator's token immediately after the
//! process is reaped, and the token is checked right before every signal.
//! This narrows, but cannot fully close, the window in which a pid recycled
//! by the OS could be signalled.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Termination signals the escalator can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TerminationSignal {
    Term,
    Hup,
    Int,
    Quit,
    Pipe,
    Kill,
}

impl TerminationSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Term => "TERM",
            Self::Hup => "HUP",
            Self::Int => "INT",
            Self::Quit => "QUIT",
            Self::Pipe => "PIPE",
            Self::Kill => "KILL",
        }
    }

    #[cfg(unix)]
    fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            Self::Term => Signal::SIGTERM,
            Self::Hup => Signal::SIGHUP,
            Self::Int => Signal::SIGINT,
            Self::Quit => Signal::SIGQUIT,
            Self::Pipe => Signal::SIGPIPE,
            Self::Kill => Signal::SIGKILL,
        }
    }
}

impl std::fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Escalation sequence and the pause between signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationConfig {
    pub signals: Vec<TerminationSignal>,
    pub interval: Duration,
}

impl EscalationConfig {
    pub fn new(signals: Vec<TerminationSignal>) -> Self {
        Self {
            signals,
            ..Self::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        use TerminationSignal::*;
        Self {
            signals: vec![Term, Hup, Int, Quit, Pipe, Kill],
            interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    /// The process has already exited and been reaped.
    #[error("no such process")]
    NoSuchProcess,
    #[error("failed to deliver signal: {0}")]
    Other(String),
}

/// Delivers a signal to a process by pid.
pub trait SignalSender: Send + Sync + 'static {
    fn send(&self, pid: u32, signal: TerminationSignal) -> Result<(), SignalError>;
}

/// Signal delivery through `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSignals;

#[cfg(unix)]
impl SignalSender for OsSignals {
    fn send(&self, pid: u32, signal: TerminationSignal) -> Result<(), SignalError> {
        use nix::errno::Errno;
        use nix::unistd::Pid;

        let pid = i32::try_from(pid)
            .map_err(|_| SignalError::Other(format!("pid {pid} out of range")))?;
        match nix::sys::signal::kill(Pid::from_raw(pid), signal.as_nix()) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(SignalError::NoSuchProcess),
            Err(e) => Err(SignalError::Other(e.to_string())),
        }
    }
}

#[cfg(not(unix))]
impl SignalSender for OsSignals {
    fn send(&self, _pid: u32, signal: TerminationSignal) -> Result<(), SignalError> {
        Err(SignalError::Other(format!(
            "{signal} is not supported on this platform"
        )))
    }
}

/// Schedules escalation for process-backed tasks.
#[derive(Clone)]
pub struct Escalator {
    config: EscalationConfig,
    sender: Arc<dyn SignalSender>,
}

impl Escalator {
    pub fn new(config: EscalationConfig) -> Self {
        Self::with_sender(config, Arc::new(OsSignals))
    }

    pub fn with_sender(config: EscalationConfig, sender: Arc<dyn SignalSender>) -> Self {
        Self { config, sender }
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    /// Start the timer for `pid`. Cancelling `exited` stops the escalation at
    /// any point, including before the first signal.
    pub fn spawn(
        &self,
        pid: u32,
        kill_after: Duration,
        exited: CancellationToken,
    ) -> JoinHandle<()> {
        let config = self.config.clone();
        let sender = Arc::clone(&self.sender);
        tokio::spawn(escalate(pid, kill_after, config, sender, exited).in_current_span())
    }
}

impl std::fmt::Debug for Escalator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Escalator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn escalate(
    pid: u32,
    kill_after: Duration,
    config: EscalationConfig,
    sender: Arc<dyn SignalSender>,
    exited: CancellationToken,
) {
    tokio::select! {
        _ = exited.cancelled() => return,
        _ = tokio::time::sleep(kill_after) => {}
    }

    tracing::warn!(pid, ?kill_after, "Task exceeded its time limit, terminating");

    for signal in config.signals {
        if exited.is_cancelled() {
            return;
        }

        match sender.send(pid, signal) {
            Ok(()) => tracing::debug!(pid, %signal, "Sent termination signal"),
            Err(SignalError::NoSuchProcess) => {
                tracing::debug!(pid, %signal, "Process already gone");
                return;
            }
            Err(e) => tracing::warn!(pid, %signal, error = %e, "Failed to send termination signal"),
        }

        tokio::select! {
            _ = exited.cancelled() => return,
            _ = tokio::time::sleep(config.interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records delivered signals; reports the process gone after `alive_for` signals.
    struct RecordingSender {
        sent: Mutex<Vec<TerminationSignal>>,
        alive_for: usize,
    }

    impl RecordingSender {
        fn new(alive_for: usize) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                alive_for,
            })
        }

        fn sent(&self) -> Vec<TerminationSignal> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl SignalSender for RecordingSender {
        fn send(&self, _pid: u32, signal: TerminationSignal) -> Result<(), SignalError> {
            let mut sent = self.sent.lock().unwrap();
            if sent.len() >= self.alive_for {
                return Err(SignalError::NoSuchProcess);
            }
            sent.push(signal);
            Ok(())
        }
    }

    fn escalator(sender: Arc<RecordingSender>) -> Escalator {
        Escalator::with_sender(
            EscalationConfig::default().with_interval(Duration::from_millis(100)),
            sender,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn sends_full_sequence_in_order() {
        let sender = RecordingSender::new(usize::MAX);
        let handle = escalator(Arc::clone(&sender)).spawn(
            1234,
            Duration::from_millis(400),
            CancellationToken::new(),
        );

        handle.await.unwrap();
        use TerminationSignal::*;
        assert_eq!(sender.sent(), vec![Term, Hup, Int, Quit, Pipe, Kill]);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_kill_after() {
        let sender = RecordingSender::new(usize::MAX);
        let _handle = escalator(Arc::clone(&sender)).spawn(
            1234,
            Duration::from_secs(5),
            CancellationToken::new(),
        );

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(sender.sent().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sender.sent(), vec![TerminationSignal::Term]);
    }

    #[tokio::test(start_paused = true)]
    async fn no_such_process_stops_quietly() {
        let sender = RecordingSender::new(1);
        let handle = escalator(Arc::clone(&sender)).spawn(
            1234,
            Duration::from_millis(10),
            CancellationToken::new(),
        );

        handle.await.unwrap();
        assert_eq!(sender.sent(), vec![TerminationSignal::Term]);
    }

    #[tokio::test(start_paused = true)]
    async fn exit_before_deadline_sends_nothing() {
        let sender = RecordingSender::new(usize::MAX);
        let exited = CancellationToken::new();
        let handle = escalator(Arc::clone(&sender)).spawn(
            1234,
            Duration::from_secs(1),
            exited.clone(),
        );

        exited.cancel();
        handle.await.unwrap();
        assert!(sender.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exit_mid_sequence_stops_escalation() {
        let sender = RecordingSender::new(usize::MAX);
        let exited = CancellationToken::new();
        let handle = escalator(Arc::clone(&sender)).spawn(
            1234,
            Duration::from_millis(100),
            exited.clone(),
        );

        // First signal at 100ms, second at 200ms.
        tokio::time::sleep(Duration::from_millis(250)).await;
        exited.cancel();
        handle.await.unwrap();

        assert_eq!(
            sender.sent(),
            vec![TerminationSignal::Term, TerminationSignal::Hup]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reaped_process_is_no_such_process() {
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        assert!(child.wait().await.unwrap().success());

        assert_eq!(
            OsSignals.send(pid, TerminationSignal::Term),
            Err(SignalError::NoSuchProcess)
        );
    }

    #[test]
    fn escalator_keeps_its_config() {
        let config = EscalationConfig::new(vec![TerminationSignal::Kill]);
        let escalator = Escalator::new(config.clone());
        assert_eq!(escalator.config(), &config);
    }

    #[test]
    fn default_sequence_escalates_to_kill() {
        let config = EscalationConfig::default();
        assert_eq!(config.signals.first(), Some(&TerminationSignal::Term));
        assert_eq!(config.signals.last(), Some(&TerminationSignal::Kill));
        assert_eq!(config.interval, Duration::from_secs(1));
    }

    #[test]
    fn escalation_config_serializes() {
        let config = EscalationConfig::new(vec![TerminationSignal::Term, TerminationSignal::Kill])
            .with_interval(Duration::from_millis(250));
        insta::assert_json_snapshot!(config, @r#"
        {
          "signals": [
            "TERM",
            "KILL"
          ],
          "interval": {
            "secs": 0,
            "nanos": 250000000
          }
        }
        "#);
    }
}
