use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, Notify};

use crate::download::command::ToolInvocation;
use crate::download::parse::{extract_error_message, ProgressEvent};
use crate::error::EngineError;
use crate::utils::os;

/// Stderr lines kept around for failure messages.
const ERROR_TAIL_LINES: usize = 1000;

/// How long buffered output is awaited once the tool itself has exited.
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// How stdout and stderr reach the parser.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Both streams are forwarded as one stream.
    #[default]
    Merged,
    /// Only stdout is forwarded; stderr is kept for the failure message.
    Separate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: StreamKind,
    pub text: String,
}

/// Cooperative cancellation shared by the control thread and the worker.
///
/// The flag is the only state; the `Notify` just wakes whoever is waiting on it.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.wake.notified().await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// The tool could not be started at all.
    Launch,
    /// The tool ran and exited unsuccessfully.
    Exit(Option<i32>),
}

impl FailureCause {
    pub fn into_error(self, message: String) -> EngineError {
        match self {
            FailureCause::Launch => EngineError::ProcessLaunch { message },
            FailureCause::Exit(code) => EngineError::DownloadFailed { message, code },
        }
    }
}

/// Result of one supervised run. Exactly one per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed { message: String, cause: FailureCause },
    Cancelled,
}

impl RunStatus {
    pub fn to_event(&self) -> ProgressEvent {
        match self {
            RunStatus::Completed => ProgressEvent::Completed,
            RunStatus::Failed { message, .. } => ProgressEvent::Failed {
                message: message.clone(),
            },
            RunStatus::Cancelled => ProgressEvent::Cancelled,
        }
    }
}

/// Signals the process group if the run is abandoned while the tool is alive.
struct GroupGuard(Option<u32>);

impl GroupGuard {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.0.take() {
            let _ = os::signal_group(pid);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    mode: OutputMode,
    cancel: CancelFlag,
}

impl ProcessSupervisor {
    pub fn new(mode: OutputMode, cancel: CancelFlag) -> Self {
        ProcessSupervisor { mode, cancel }
    }

    /// Run one external command to completion, handing every forwarded output
    /// line to `sink` in order.
    pub async fn run<F>(&self, invocation: &ToolInvocation, mut sink: F) -> RunStatus
    where
        F: FnMut(OutputLine),
    {
        tracing::info!("spawning: {invocation}");

        let mut cmd = os::command(&invocation.program);
        cmd.args(&invocation.args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("failed to launch {}: {e}", invocation.program);
                return RunStatus::Failed {
                    message: format!("failed to launch {}: {e}", invocation.program),
                    cause: FailureCause::Launch,
                };
            }
        };
        let group = child.id();
        let mut guard = GroupGuard(group);

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<OutputLine>();
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(pump_lines(out, StreamKind::Stdout, line_tx.clone())));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(pump_lines(err, StreamKind::Stderr, line_tx.clone())));
        }
        drop(line_tx);

        let mut error_tail: VecDeque<String> = VecDeque::new();
        let mut terminated = false;
        let mut exited = None;

        loop {
            if self.cancel.is_cancelled() {
                self.terminate(&mut child, &mut terminated);
                break;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => continue,
                next = line_rx.recv() => match next {
                    Some(line) => self.forward(line, &mut error_tail, &mut sink),
                    None => break,
                },
                status = child.wait() => {
                    exited = Some(status);
                    break;
                }
            }
        }

        if exited.is_some() {
            // the tool is gone; take what it already wrote, even if a straggler
            // in its group still holds the pipes
            let mut closed = false;
            while !self.cancel.is_cancelled() {
                match tokio::time::timeout(PIPE_DRAIN_GRACE, line_rx.recv()).await {
                    Ok(Some(line)) => self.forward(line, &mut error_tail, &mut sink),
                    Ok(None) => {
                        closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }
            if !closed {
                if let Some(pid) = group {
                    tracing::debug!("{} exited with its pipes still open", invocation.program);
                    let _ = os::signal_group(pid);
                }
            }
        }

        let waited = match exited {
            Some(status) => status,
            None if terminated => child.wait().await,
            None if self.cancel.is_cancelled() => {
                self.terminate(&mut child, &mut terminated);
                child.wait().await
            }
            None => tokio::select! {
                status = child.wait() => status,
                _ = self.cancel.cancelled() => {
                    self.terminate(&mut child, &mut terminated);
                    child.wait().await
                }
            },
        };
        guard.disarm();
        for r in readers {
            r.abort();
        }

        if terminated || self.cancel.is_cancelled() {
            tracing::info!("{} cancelled", invocation.program);
            return RunStatus::Cancelled;
        }

        match waited {
            Ok(status) if status.success() => RunStatus::Completed,
            Ok(status) => {
                let message = extract_error_message(error_tail.iter().map(String::as_str))
                    .unwrap_or_else(|| match status.code() {
                        Some(code) => format!("Download failed (exit code {code})"),
                        None => "Download failed (terminated by signal)".to_string(),
                    });
                tracing::warn!("{} exited with {status}: {message}", invocation.program);
                RunStatus::Failed {
                    message,
                    cause: FailureCause::Exit(status.code()),
                }
            }
            Err(e) => RunStatus::Failed {
                message: format!("lost track of {}: {e}", invocation.program),
                cause: FailureCause::Exit(None),
            },
        }
    }

    fn forward<F>(&self, line: OutputLine, error_tail: &mut VecDeque<String>, sink: &mut F)
    where
        F: FnMut(OutputLine),
    {
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::debug!(target: "yt-dlp", "{}", line.text);
        if self.mode == OutputMode::Merged || line.stream == StreamKind::Stderr {
            if error_tail.len() == ERROR_TAIL_LINES {
                error_tail.pop_front();
            }
            error_tail.push_back(line.text.clone());
        }
        if self.mode == OutputMode::Merged || line.stream == StreamKind::Stdout {
            sink(line);
        }
    }

    fn terminate(&self, child: &mut tokio::process::Child, terminated: &mut bool) {
        if *terminated {
            return;
        }
        *terminated = true;
        if let Err(e) = os::terminate_tree(child) {
            tracing::warn!("could not terminate downloader: {e}");
        }
    }
}

/// Read a stream and forward it line by line. Both `\n` and `\r` end a line,
/// since progress is redrawn with carriage returns.
async fn pump_lines<R>(reader: R, stream: StreamKind, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut pending: Vec<u8> = Vec::new();

    let send = |pending: &mut Vec<u8>| -> bool {
        if pending.is_empty() {
            return true;
        }
        let text = String::from_utf8_lossy(pending).into_owned();
        pending.clear();
        tx.send(OutputLine { stream, text }).is_ok()
    };

    loop {
        let chunk = match reader.fill_buf().await {
            Ok(buf) => buf,
            Err(e) => {
                tracing::debug!("reader for {stream:?} stopped: {e}");
                break;
            }
        };
        if chunk.is_empty() {
            break;
        }
        let len = chunk.len();
        for &b in chunk {
            if b == b'\n' || b == b'\r' {
                if !send(&mut pending) {
                    return;
                }
            } else {
                pending.push(b);
            }
        }
        reader.consume(len);
    }
    send(&mut pending);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ToolInvocation {
        ToolInvocation::new("sh").args(["-c", script])
    }

    async fn collect(sup: &ProcessSupervisor, inv: &ToolInvocation) -> (RunStatus, Vec<OutputLine>) {
        let mut lines = Vec::new();
        let status = sup.run(inv, |l| lines.push(l)).await;
        (status, lines)
    }

    #[tokio::test]
    async fn forwards_lines_in_order_and_completes() {
        let sup = ProcessSupervisor::new(OutputMode::Merged, CancelFlag::new());
        let (status, lines) = collect(&sup, &sh("echo one; echo two; printf 'a\\rb\\n'")).await;
        assert_eq!(status, RunStatus::Completed);
        let texts: Vec<_> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, ["one", "two", "a", "b"]);
    }

    #[tokio::test]
    async fn failure_message_comes_from_error_marker() {
        let sup = ProcessSupervisor::new(OutputMode::Separate, CancelFlag::new());
        let (status, lines) = collect(
            &sup,
            &sh("echo working; echo 'WARNING: meh' >&2; echo 'ERROR: network timeout' >&2; exit 1"),
        )
        .await;
        assert_eq!(
            status,
            RunStatus::Failed {
                message: "network timeout".into(),
                cause: FailureCause::Exit(Some(1)),
            }
        );
        // stderr is not forwarded in separate mode
        assert!(lines.iter().all(|l| l.stream == StreamKind::Stdout));
        assert_eq!(lines.len(), 1);
    }

    #[tokio::test]
    async fn merged_mode_forwards_stderr_too() {
        let sup = ProcessSupervisor::new(OutputMode::Merged, CancelFlag::new());
        let (status, lines) = collect(&sup, &sh("echo 'ERROR: boom' >&2; exit 2")).await;
        assert_eq!(
            status,
            RunStatus::Failed {
                message: "boom".into(),
                cause: FailureCause::Exit(Some(2)),
            }
        );
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].stream, StreamKind::Stderr);
    }

    #[tokio::test]
    async fn generic_message_without_marker() {
        let sup = ProcessSupervisor::new(OutputMode::Merged, CancelFlag::new());
        let (status, _) = collect(&sup, &sh("exit 3")).await;
        assert_eq!(
            status,
            RunStatus::Failed {
                message: "Download failed (exit code 3)".into(),
                cause: FailureCause::Exit(Some(3)),
            }
        );

        let RunStatus::Failed { message, cause } = status else {
            unreachable!()
        };
        let err = cause.into_error(message);
        assert!(matches!(err, EngineError::DownloadFailed { code: Some(3), .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn missing_tool_is_a_launch_failure() {
        let sup = ProcessSupervisor::new(OutputMode::Merged, CancelFlag::new());
        let inv = ToolInvocation::new("/nonexistent/aria-test-tool");
        let (status, _) = collect(&sup, &inv).await;
        let RunStatus::Failed {
            message,
            cause: FailureCause::Launch,
        } = status
        else {
            panic!("expected a launch failure, got {status:?}");
        };

        let err = FailureCause::Launch.into_error(message);
        assert!(matches!(err, EngineError::ProcessLaunch { .. }));
        assert!(err.to_string().starts_with("failed to launch /nonexistent/aria-test-tool"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn returns_when_tool_exits_even_if_a_helper_keeps_the_pipe() {
        let sup = ProcessSupervisor::new(OutputMode::Merged, CancelFlag::new());
        let started = std::time::Instant::now();
        let (status, lines) = collect(&sup, &sh("(sleep 5 &); echo hi; exit 0")).await;
        assert_eq!(status, RunStatus::Completed);
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "hi");
    }

    /// Dead or reaped-zombie both count as gone.
    fn process_gone(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .map_or(true, |state| state == "Z"),
        }
    }

    #[tokio::test]
    async fn dropping_a_run_terminates_the_group() {
        if !std::path::Path::new("/proc/self/stat").exists() {
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let pidfile = dir.path().join("pid");
        let script = format!("sleep 30 & echo $! > '{}'; echo ready; wait", pidfile.display());
        let inv = sh(&script);
        let sup = ProcessSupervisor::new(OutputMode::Merged, CancelFlag::new());

        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let mut ready_tx = Some(ready_tx);
        let run = sup.run(&inv, |l| {
            if l.text == "ready" {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(());
                }
            }
        });
        tokio::select! {
            _ = run => panic!("run finished on its own"),
            _ = ready_rx => {}
        }
        // `run` is dropped here, with the shell and its sleep still alive

        let pid = std::fs::read_to_string(&pidfile).unwrap().trim().to_string();
        let mut gone = false;
        for _ in 0..50 {
            if process_gone(&pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(gone, "grandchild {pid} survived the dropped run");
    }

    #[tokio::test]
    async fn cancel_from_output_stops_group_and_reports_cancelled_once() {
        let cancel = CancelFlag::new();
        let sup = ProcessSupervisor::new(OutputMode::Merged, cancel.clone());
        let inv = sh("echo started; sleep 30 & sleep 30; echo never");

        let mut seen = Vec::new();
        let status = tokio::time::timeout(
            Duration::from_secs(10),
            sup.run(&inv, |l| {
                if l.text == "started" {
                    cancel.cancel();
                }
                seen.push(l.text);
            }),
        )
        .await
        .expect("cancelled run must return promptly");

        assert_eq!(status, RunStatus::Cancelled);
        assert_eq!(seen, ["started"]);
    }

    #[tokio::test]
    async fn cancel_while_silent() {
        let cancel = CancelFlag::new();
        let sup = ProcessSupervisor::new(OutputMode::Merged, cancel.clone());
        let inv = sh("sleep 30");

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let status = tokio::time::timeout(Duration::from_secs(10), sup.run(&inv, |_| {}))
            .await
            .expect("cancelled run must return promptly");
        assert_eq!(status, RunStatus::Cancelled);
        assert_eq!(status.to_event(), ProgressEvent::Cancelled);
    }

    #[tokio::test]
    async fn cancelled_flag_future_resolves_after_cancel() {
        let flag = CancelFlag::new();
        flag.cancel();
        tokio::time::timeout(Duration::from_secs(1), flag.cancelled())
            .await
            .unwrap();
        flag.reset();
        assert!(!flag.is_cancelled());
    }
}
