/// Single supervised run: spawn the child on two ptys, multiplex its output
/// line by line, kill it when it goes idle, and judge the result.
use crate::config::Config;
use crate::line::{LineEvent, StreamTag};
use crate::stream::{PtyChannel, StreamHandle};
use crate::verdict::Verdict;
use crate::watchdog::Watchdog;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::future::{poll_fn, Future};
use std::io::Write;
use std::process::Stdio;
use std::task::Poll;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};

/// Everything a run needs, resolved from config and CLI overrides.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub program: String,
    pub args: Vec<String>,
    pub process_group: bool,
    pub idle_timeout: Duration,
    pub sentinel: String,
    pub read_chunk: usize,
}

impl From<&Config> for RunOptions {
    fn from(config: &Config) -> Self {
        Self {
            program: config.command.program.clone(),
            args: config.command.args.clone(),
            process_group: config.command.process_group,
            idle_timeout: config.idle_timeout(),
            sentinel: config.verdict.sentinel.clone(),
            read_chunk: config.stream.read_chunk,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Spawning,
    Running,
    Draining,
    Terminated,
}

/// How the child came to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own.
    Natural,
    /// Killed by the idle watchdog.
    IdleTimeout,
    /// Killed because the supervisor received SIGINT/SIGTERM.
    Interrupted,
}

/// Result of a completed run.
#[derive(Debug)]
pub struct RunReport {
    pub verdict: Verdict,
    /// Child exit code (None if killed by signal).
    pub exit_status: Option<i32>,
    pub termination: Termination,
    /// Every line emitted, in emission order.
    pub lines: Vec<LineEvent>,
    pub duration: Duration,
    pub pid: u32,
}

/// Errors that abort a run. No verdict is produced.
#[derive(Debug)]
pub enum SupervisorError {
    /// Failed to allocate or configure a pty.
    Pty { stream: StreamTag, source: Errno },
    /// Failed to spawn the child.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// Failed to register a pty with the reactor or wait on its readiness.
    Register {
        stream: StreamTag,
        source: std::io::Error,
    },
    /// A read failed with something other than end-of-stream.
    Read {
        stream: StreamTag,
        source: std::io::Error,
    },
    /// Failed to reap the child.
    Wait { source: std::io::Error },
    /// Failed to write a line to the console.
    Output { source: std::io::Error },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Pty { stream, source } => {
                write!(f, "failed to open pty for {}: {}", stream, source)
            }
            SupervisorError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program, source)
            }
            SupervisorError::Register { stream, source } => {
                write!(f, "failed to poll {} pty: {}", stream, source)
            }
            SupervisorError::Read { stream, source } => {
                write!(f, "failed to read {} pty: {}", stream, source)
            }
            SupervisorError::Wait { source } => {
                write!(f, "failed to wait for child: {}", source)
            }
            SupervisorError::Output { source } => {
                write!(f, "failed to write output: {}", source)
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Pty { source, .. } => Some(source),
            SupervisorError::Spawn { source, .. } => Some(source),
            SupervisorError::Register { source, .. } => Some(source),
            SupervisorError::Read { source, .. } => Some(source),
            SupervisorError::Wait { source } => Some(source),
            SupervisorError::Output { source } => Some(source),
        }
    }
}

/// Sends SIGKILL to the child (or its whole process group).
///
/// Safe to call from any thread and any number of times. A target that has
/// already exited is not an error.
#[derive(Debug, Clone, Copy)]
pub struct ChildKiller {
    pid: Pid,
    group: bool,
}

impl ChildKiller {
    pub fn new(pid: u32, group: bool) -> Self {
        Self {
            pid: Pid::from_raw(pid as i32),
            group,
        }
    }

    pub fn kill(&self) -> Result<(), Errno> {
        let result = if self.group {
            killpg(self.pid, Signal::SIGKILL)
        } else {
            kill(self.pid, Signal::SIGKILL)
        };
        match result {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                tracing::debug!(pid = self.pid.as_raw(), "kill target already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn kill_logged(&self) {
        if let Err(e) = self.kill() {
            tracing::warn!(pid = self.pid.as_raw(), error = %e, "failed to kill child");
        }
    }
}

/// Owns one child process for the duration of a run.
pub struct ProcessSupervisor<W> {
    options: RunOptions,
    sink: W,
    state: SupervisorState,
}

impl<W: Write> ProcessSupervisor<W> {
    /// Lines are written to `sink` as they are emitted.
    pub fn new(options: RunOptions, sink: W) -> Self {
        Self {
            options,
            sink,
            state: SupervisorState::Spawning,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Run the child to completion.
    ///
    /// If `shutdown` resolves first, the child is killed and the run ends
    /// as [`Termination::Interrupted`]. A killed child always yields a
    /// failure verdict, whatever its last line was.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<RunReport, SupervisorError>
    where
        F: Future<Output = ()>,
    {
        self.transition(SupervisorState::Spawning);
        let start = Instant::now();
        let (mut child, mut live) = self.spawn()?;

        // A zero pid would make killpg target our own group.
        let pid = child.id().ok_or_else(|| SupervisorError::Spawn {
            program: self.options.program.clone(),
            source: std::io::Error::other("child exited before its pid was read"),
        })?;
        let killer = ChildKiller::new(pid, self.options.process_group);
        let timeout = self.options.idle_timeout;
        let timeout_secs = timeout.as_secs_f64();
        let watchdog = Watchdog::spawn(move || {
            tracing::warn!(pid, timeout_secs, "cancelling command (timed out)");
            killer.kill_logged();
        });
        watchdog.arm(timeout);

        self.transition(SupervisorState::Running);
        tokio::pin!(shutdown);
        let mut interrupted = false;
        let mut lines: Vec<LineEvent> = Vec::new();

        while !live.is_empty() {
            let ready = tokio::select! {
                ready = wait_ready(&live) => ready.map_err(|(stream, source)| {
                    SupervisorError::Register { stream, source }
                })?,
                () = &mut shutdown, if !interrupted => {
                    interrupted = true;
                    tracing::warn!(pid, "shutdown requested, killing child");
                    killer.kill_logged();
                    continue;
                }
            };

            let mut closed = Vec::new();
            for idx in ready {
                let handle = &mut live[idx];
                let stream = handle.tag();
                let polled = handle
                    .poll_once()
                    .await
                    .map_err(|source| SupervisorError::Read { stream, source })?;

                for mut line in polled.lines {
                    line.seq = lines.len() as u64;
                    self.emit(&line)?;
                    watchdog.arm(timeout);
                    lines.push(line);
                }
                if !polled.still_open {
                    closed.push(idx);
                }
            }
            for idx in closed.into_iter().rev() {
                let handle = live.remove(idx);
                tracing::debug!(stream = %handle.tag(), remaining = live.len(), "stream closed");
            }
        }

        self.transition(SupervisorState::Draining);
        watchdog.cancel();
        let status = child
            .wait()
            .await
            .map_err(|source| SupervisorError::Wait { source })?;

        let termination = if watchdog.has_fired() {
            Termination::IdleTimeout
        } else if interrupted {
            Termination::Interrupted
        } else {
            Termination::Natural
        };
        let verdict = match termination {
            Termination::Natural => Verdict::from_last_line(lines.last(), &self.options.sentinel),
            Termination::IdleTimeout | Termination::Interrupted => Verdict::Failure,
        };

        self.transition(SupervisorState::Terminated);
        Ok(RunReport {
            verdict,
            exit_status: status.code(),
            termination,
            lines,
            duration: start.elapsed(),
            pid,
        })
    }

    /// Open both ptys and start the child with its stdout and stderr on the
    /// slave sides.
    fn spawn(&self) -> Result<(Child, Vec<StreamHandle>), SupervisorError> {
        let stdout = PtyChannel::open().map_err(|source| SupervisorError::Pty {
            stream: StreamTag::Stdout,
            source,
        })?;
        let stderr = PtyChannel::open().map_err(|source| SupervisorError::Pty {
            stream: StreamTag::Stderr,
            source,
        })?;

        tracing::info!(
            command = %self.options.program,
            args = ?self.options.args,
            idle_timeout_secs = self.options.idle_timeout.as_secs_f64(),
            "spawning child"
        );

        let mut command = Command::new(&self.options.program);
        command
            .args(&self.options.args)
            .stdout(Stdio::from(stdout.writer))
            .stderr(Stdio::from(stderr.writer))
            .kill_on_drop(true);
        if self.options.process_group {
            command.process_group(0);
        }
        let child = command.spawn().map_err(|source| SupervisorError::Spawn {
            program: self.options.program.clone(),
            source,
        })?;
        // The command still holds the slave fds; the child must be the only writer.
        drop(command);
        tracing::info!(pid = child.id().unwrap_or(0), "child started");

        let chunk = self.options.read_chunk;
        let handles = vec![
            StreamHandle::new(StreamTag::Stdout, stdout.reader, chunk).map_err(|source| {
                SupervisorError::Register {
                    stream: StreamTag::Stdout,
                    source,
                }
            })?,
            StreamHandle::new(StreamTag::Stderr, stderr.reader, chunk).map_err(|source| {
                SupervisorError::Register {
                    stream: StreamTag::Stderr,
                    source,
                }
            })?,
        ];
        Ok((child, handles))
    }

    fn emit(&mut self, line: &LineEvent) -> Result<(), SupervisorError> {
        tracing::trace!(seq = line.seq, stream = %line.stream, "line");
        writeln!(self.sink, "{}", line.text)
            .and_then(|()| self.sink.flush())
            .map_err(|source| SupervisorError::Output { source })
    }

    fn transition(&mut self, next: SupervisorState) {
        tracing::debug!(from = ?self.state, to = ?next, "supervisor state");
        self.state = next;
    }
}

/// Wait until at least one live handle is readable or closed, and return the
/// indices of every ready handle in order.
///
/// Lines are ordered across streams by this poll order (stdout before
/// stderr when both are ready), not by when the child wrote them. A child
/// that writes heavily to both streams should print its sentinel last, once
/// the other stream has gone quiet.
async fn wait_ready(
    handles: &[StreamHandle],
) -> Result<Vec<usize>, (StreamTag, std::io::Error)> {
    poll_fn(|cx| {
        let mut ready = Vec::new();
        for (idx, handle) in handles.iter().enumerate() {
            match handle.poll_read_ready(cx) {
                Poll::Ready(Ok(())) => ready.push(idx),
                Poll::Ready(Err(e)) => return Poll::Ready(Err((handle.tag(), e))),
                Poll::Pending => {}
            }
        }
        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(Ok(ready))
        }
    })
    .await
}
