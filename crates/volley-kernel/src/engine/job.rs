//! One test job: a spawned child, its captured output, its lifecycle.

use std::process::ExitStatus;

use tokio::io::AsyncRead;
use tokio::process::Child;
use tracing::trace;

use crate::buffer::ReadBuffer;
use crate::source::TestDescriptor;
use crate::spawn::{spawn_captured, ChildHandle, Limits, SpawnError};

/// Job lifecycle.
///
/// ```text
/// Queued ──▶ Spawned ──▶ Running ──▶ Retired
///    │
///    └──▶ SpawnFailed (terminal, classified ERROR)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Descriptor dequeued, slot reserved, process not yet created.
    Queued,
    /// Process created; output channels not yet in the readiness wait.
    Spawned,
    /// In the readiness wait: output accumulating, exit pending.
    Running,
    /// Classified and accounted; the job is history.
    Retired,
    /// The process could not be created at all.
    SpawnFailed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Queued => "queued",
            JobState::Spawned => "spawned",
            JobState::Running => "running",
            JobState::Retired => "retired",
            JobState::SpawnFailed => "spawn-failed",
        };
        f.write_str(name)
    }
}

/// A single test invocation, owned by the engine for its whole life.
pub struct Job {
    descriptor: TestDescriptor,
    argv: Vec<String>,
    state: JobState,
    proc: Option<ChildHandle>,
    out: ReadBuffer,
    err: ReadBuffer,
    exit: Option<ExitStatus>,
    reaped: bool,
    spawn_error: Option<SpawnError>,
}

impl Job {
    /// A job holding a reserved slot, before process creation.
    pub(crate) fn queued(descriptor: TestDescriptor, argv: Vec<String>) -> Self {
        Self {
            descriptor,
            argv,
            state: JobState::Queued,
            proc: None,
            out: ReadBuffer::new(),
            err: ReadBuffer::new(),
            exit: None,
            reaped: false,
            spawn_error: None,
        }
    }

    /// Create the process. `Queued -> Spawned`, or `Queued -> SpawnFailed`
    /// with the error kept for the retirement report.
    pub(crate) fn launch(&mut self, limits: &Limits) {
        debug_assert_eq!(self.state, JobState::Queued);
        match spawn_captured(&self.argv, limits) {
            Ok(proc) => {
                self.state = JobState::Spawned;
                self.proc = Some(proc);
            }
            Err(err) => {
                self.spawn_error = Some(err);
                self.state = JobState::SpawnFailed;
            }
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn descriptor(&self) -> &TestDescriptor {
        &self.descriptor
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub(crate) fn stdout_bytes(&self) -> &[u8] {
        self.out.as_slice()
    }

    pub(crate) fn stderr_bytes(&self) -> &[u8] {
        self.err.as_slice()
    }

    pub(crate) fn spawn_error(&self) -> Option<&SpawnError> {
        self.spawn_error.as_ref()
    }

    pub(crate) fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Still has something to wait for?
    pub(crate) fn needs_pump(&self) -> bool {
        matches!(self.state, JobState::Spawned | JobState::Running) && !self.is_complete()
    }

    /// Exited and drained: ready for retirement. A failed spawn is complete
    /// from the start.
    pub(crate) fn is_complete(&self) -> bool {
        match self.state {
            JobState::SpawnFailed => true,
            JobState::Spawned | JobState::Running => {
                self.reaped
                    && self
                        .proc
                        .as_ref()
                        .is_none_or(|p| p.stdout.is_none() && p.stderr.is_none())
            }
            _ => false,
        }
    }

    pub(crate) fn mark_retired(&mut self) {
        self.state = JobState::Retired;
    }

    /// Wait for one event on this job and absorb it: bytes appended to a
    /// buffer, a pipe reaching end-of-data, or the child exiting. Pends
    /// forever once the job is complete.
    pub(crate) async fn pump(&mut self) {
        if self.state == JobState::Spawned {
            // First time in the readiness wait.
            self.state = JobState::Running;
        }
        let Some(proc) = self.proc.as_mut() else {
            return std::future::pending().await;
        };
        tokio::select! {
            _ = drain_pipe(&mut proc.stdout, &mut self.out) => {}
            _ = drain_pipe(&mut proc.stderr, &mut self.err) => {}
            status = reap(&mut proc.child, self.reaped) => {
                self.reaped = true;
                self.exit = status;
                trace!(descriptor = %self.descriptor, exit = ?status, "child exited");
            }
        }
    }

    /// Ask a live child to stop. The job still drains and classifies
    /// normally afterwards; partial output is better than none.
    pub(crate) fn terminate(&mut self) {
        if self.reaped {
            return;
        }
        if let Some(proc) = &self.proc {
            if let Some(pid) = proc.child.id() {
                trace!(descriptor = %self.descriptor, pid, "sending SIGTERM");
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }
    }
}

/// One read step on an output pipe; `None` marks end-of-data and the pipe
/// is dropped in place. Pends forever once the pipe is gone.
async fn drain_pipe<R>(pipe: &mut Option<R>, buf: &mut ReadBuffer)
where
    R: AsyncRead + Unpin,
{
    match pipe {
        Some(reader) => match buf.fill_from(reader).await {
            Ok(0) => *pipe = None,
            Ok(_) => {}
            Err(error) => {
                trace!(%error, "output pipe read failed");
                *pipe = None;
            }
        },
        None => std::future::pending().await,
    }
}

/// Observe child exit once; pends forever after it has been reaped.
async fn reap(child: &mut Child, already_reaped: bool) -> Option<ExitStatus> {
    if already_reaped {
        std::future::pending().await
    } else {
        child.wait().await.ok()
    }
}
