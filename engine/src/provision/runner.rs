//! Automation subprocess supervision
//!
//! Spawns the automation tool, merges its stdout and stderr into a single
//! ordered line stream, classifies each line into a stream event type, and
//! terminates the process gracefully on cancellation: SIGTERM first, then an
//! unconditional kill once the grace period elapses.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::models::message::EventType;
use crate::provision::context::ExecutionContext;

/// Long enough to never fire on its own; the timer is re-armed on terminate.
const TIMER_PARKED: Duration = Duration::from_secs(86400);

/// Events produced by a supervised subprocess
#[derive(Debug)]
pub enum RunnerEvent {
    /// One output line, stdout and stderr merged in arrival order
    Line(String),

    /// Process exited with the given code (-1 when killed by signal)
    Exited(i32),
}

/// Line pattern matched against the automation tool's output grammar
#[derive(Debug, Clone, Copy)]
enum Pattern {
    Prefix(&'static str),
    Contains(&'static str),
}

impl Pattern {
    fn matches(&self, line: &str) -> bool {
        match self {
            Pattern::Prefix(p) => line.starts_with(p),
            Pattern::Contains(s) => line.contains(s),
        }
    }
}

/// Ordered classification rules; the first match wins. New tool output
/// formats are supported by adding rules here.
const CLASSIFY_RULES: &[(Pattern, EventType)] = &[
    (Pattern::Prefix("TASK ["), EventType::Task),
    (Pattern::Prefix("PLAY"), EventType::Play),
    (Pattern::Prefix("ok:"), EventType::Ok),
    (Pattern::Prefix("changed:"), EventType::Changed),
    (Pattern::Prefix("failed:"), EventType::Failed),
    (Pattern::Prefix("fatal:"), EventType::Failed),
    (Pattern::Prefix("skipping:"), EventType::Skipped),
    (Pattern::Contains("ERROR"), EventType::Error),
];

/// Classify an output line of the automation tool. Unmatched lines are
/// plain output.
pub fn classify(line: &str) -> EventType {
    let trimmed = line.trim_start();
    CLASSIFY_RULES
        .iter()
        .find(|(pattern, _)| pattern.matches(trimmed))
        .map(|(_, event)| *event)
        .unwrap_or(EventType::Output)
}

/// Extract the task name from a `TASK [name] ***` header line
pub fn task_name(line: &str) -> Option<String> {
    let start = line.find("TASK [")? + "TASK [".len();
    let end = line[start..].find(']')? + start;
    Some(line[start..end].to_string())
}

/// Shared view of the currently running subprocess.
///
/// Lets the orchestrator signal the process synchronously on cancellation,
/// without owning the child handle.
#[derive(Default)]
pub struct ProcessHandle {
    pid: StdMutex<Option<i32>>,
}

impl ProcessHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, pid: Option<u32>) {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner()) = pid.map(|p| p as i32);
    }

    fn clear(&self) {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Send SIGTERM to the registered process, if any. Returns whether a
    /// signal was sent.
    #[cfg(unix)]
    pub fn signal_term(&self) -> bool {
        let pid = *self.pid.lock().unwrap_or_else(|e| e.into_inner());
        match pid {
            Some(pid) => {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                    warn!("Failed to signal process {}: {}", pid, e);
                    return false;
                }
                debug!("Sent SIGTERM to process {}", pid);
                true
            }
            None => false,
        }
    }

    #[cfg(not(unix))]
    pub fn signal_term(&self) -> bool {
        false
    }
}

#[cfg(unix)]
fn terminate_child(child: &mut Child) {
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
            return;
        }
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn terminate_child(child: &mut Child) {
    let _ = child.start_kill();
}

/// A supervised automation subprocess
pub struct ProcessRunner {
    events: mpsc::Receiver<RunnerEvent>,
}

impl ProcessRunner {
    /// Spawn the process described by `ctx` and supervise it.
    ///
    /// Output lines arrive through [`next_event`](Self::next_event) until the
    /// terminal `Exited` event. When `cancel` fires the process is sent
    /// SIGTERM; if it has not exited after `grace` it is killed. The child is
    /// also killed on drop, so an aborted supervisor never leaks a process.
    pub fn spawn(
        ctx: &ExecutionContext,
        handle: Arc<ProcessHandle>,
        cancel: CancellationToken,
        grace: Duration,
    ) -> Result<Self, EngineError> {
        debug!("Spawning {} {}", ctx.program, ctx.args.join(" "));

        let mut child = Command::new(&ctx.program)
            .args(&ctx.args)
            .envs(ctx.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&ctx.workdir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::ProcessError(format!("failed to spawn {}: {}", ctx.program, e))
            })?;

        handle.register(child.id());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::ProcessError("child stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::ProcessError("child stderr unavailable".into()))?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(supervise(child, stdout, stderr, tx, handle, cancel, grace));

        Ok(Self { events: rx })
    }

    /// Next event from the process; `None` after `Exited` was delivered
    pub async fn next_event(&mut self) -> Option<RunnerEvent> {
        self.events.recv().await
    }
}

async fn supervise(
    mut child: Child,
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    tx: mpsc::Sender<RunnerEvent>,
    handle: Arc<ProcessHandle>,
    cancel: CancellationToken,
    grace: Duration,
) {
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut out_done = false;
    let mut err_done = false;
    let mut term_requested = false;

    let kill_timer = tokio::time::sleep(TIMER_PARKED);
    tokio::pin!(kill_timer);

    while !(out_done && err_done) {
        tokio::select! {
            line = out_lines.next_line(), if !out_done => match line {
                Ok(Some(line)) => {
                    if tx.send(RunnerEvent::Line(line)).await.is_err() {
                        // Consumer gone: stop the process instead of
                        // draining output nobody reads.
                        term_requested = true;
                        terminate_child(&mut child);
                        break;
                    }
                }
                _ => out_done = true,
            },
            line = err_lines.next_line(), if !err_done => match line {
                Ok(Some(line)) => {
                    if tx.send(RunnerEvent::Line(line)).await.is_err() {
                        term_requested = true;
                        terminate_child(&mut child);
                        break;
                    }
                }
                _ => err_done = true,
            },
            _ = cancel.cancelled(), if !term_requested => {
                term_requested = true;
                terminate_child(&mut child);
                kill_timer.as_mut().reset(tokio::time::Instant::now() + grace);
            },
            _ = &mut kill_timer, if term_requested => {
                let _ = child.start_kill();
                kill_timer.as_mut().reset(tokio::time::Instant::now() + TIMER_PARKED);
            },
        }
    }

    // Streams are closed; collect the exit status. A terminated process that
    // ignores SIGTERM is killed after the grace period.
    let status = if term_requested {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                let _ = child.start_kill();
                child.wait().await
            }
        }
    } else {
        child.wait().await
    };

    handle.clear();

    let code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            warn!("Failed to collect process status: {}", e);
            -1
        }
    };
    let _ = tx.send(RunnerEvent::Exited(code)).await;
}
