//! Process creation for test jobs.
//!
//! One opaque operation: turn an argv into a running child with both output
//! streams piped back to the engine. Resource limits, when requested, are
//! applied in the child between fork and exec so a runaway test is stopped
//! by the kernel, not by the scheduler.

use std::io;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::trace;

/// Why a job could not be started. Local to the one job; the run goes on.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("empty command")]
    EmptyCommand,
    #[error("cannot exec '{program}': {source}")]
    Exec {
        program: String,
        source: io::Error,
    },
}

/// Per-child resource limits, enforced by the kernel at exec time.
///
/// Unset fields are unlimited. Memory and file size are in GiB, CPU in
/// seconds, matching the conventions of the testers this engine drives.
#[derive(Debug, Clone, Copy, Default)]
pub struct Limits {
    pub cpu_secs: Option<u64>,
    pub mem_gib: Option<u64>,
    pub file_gib: Option<u64>,
}

impl Limits {
    fn rlimits(&self) -> Vec<(libc::c_int, u64)> {
        const GIB: u64 = 1024 * 1024 * 1024;
        let mut set = Vec::new();
        if let Some(secs) = self.cpu_secs {
            set.push((libc::RLIMIT_CPU as libc::c_int, secs));
        }
        if let Some(gib) = self.mem_gib {
            set.push((libc::RLIMIT_DATA as libc::c_int, gib * GIB));
        }
        if let Some(gib) = self.file_gib {
            set.push((libc::RLIMIT_FSIZE as libc::c_int, gib * GIB));
        }
        set
    }
}

/// A spawned child with its captured output channels.
///
/// The pipes are `Option` so the engine can drop each one as it reaches
/// end-of-data while still holding the child for reaping.
#[derive(Debug)]
pub struct ChildHandle {
    pub child: Child,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

/// Spawn `argv` with stdout and stderr piped and stdin closed.
///
/// Tests must not compete for the driver's stdin; descriptor input may be
/// arriving there.
pub fn spawn_captured(argv: &[String], limits: &Limits) -> Result<ChildHandle, SpawnError> {
    let (program, args) = argv.split_first().ok_or(SpawnError::EmptyCommand)?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let rlimits = limits.rlimits();
    if !rlimits.is_empty() {
        unsafe {
            cmd.pre_exec(move || {
                for &(resource, value) in &rlimits {
                    let limit = libc::rlimit {
                        rlim_cur: value,
                        rlim_max: value,
                    };
                    if libc::setrlimit(resource as _, &limit) < 0 {
                        // If a limit cannot be applied, do not exec.
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn().map_err(|source| SpawnError::Exec {
        program: program.clone(),
        source,
    })?;
    trace!(pid = ?child.id(), %program, "spawned");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    Ok(ChildHandle {
        child,
        stdout,
        stderr,
    })
}
