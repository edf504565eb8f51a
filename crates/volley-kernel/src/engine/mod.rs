//! The scheduling engine — spawn, process, retire.
//!
//! The engine drives the whole run from one logical thread. Each pass of
//! the caller's loop goes through the same four phases:
//!
//! ```text
//! while engine.is_live() {
//!     engine.spawn()?;              // fill free slots from the source
//!     engine.process(None).await;   // the one suspension point
//!     engine.retire()?;             // classify exited jobs, free slots
//! }
//! engine.fini(None)?;
//! ```
//!
//! `spawn` and `retire` never block; `process` is a readiness-multiplexed
//! wait over every live job's output pipes and exit notification, the
//! descriptor source, and the external token channel when the engine is
//! starved for slots. Keeping the phases separate keeps spawn rate, I/O
//! draining, and reaping independently testable, and lets a caller
//! interleave its own cancellation checks between them.
//!
//! There is no locking: jobs are mutated only from these methods, and
//! parallelism comes from the spawned children themselves.

mod job;

pub use job::{Job, JobState};

use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::broker::{BrokerError, TokenBroker};
use crate::source::{DescriptorSource, SourceError, TestDescriptor};
use crate::spawn::Limits;
use crate::verdict::{classify, Tally, Verdict};

/// Run-fatal engine failures. Per-job trouble (spawn failures, unreadable
/// output) never surfaces here; it becomes an ERROR verdict instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("writing report: {0}")]
    Report(#[from] std::io::Error),
}

/// The parallel test scheduler.
pub struct Engine {
    /// Fixed argv prefix every descriptor is appended to.
    command: Vec<String>,
    limits: Limits,
    source: Box<dyn DescriptorSource>,
    broker: TokenBroker,
    jobs: Vec<Job>,
    tally: Tally,
    /// Verdict lines and the final summary.
    sum: Box<dyn Write + Send>,
    /// Interleaved captured output.
    log: Box<dyn Write + Send>,
    /// Descriptor fetched ahead of a free slot.
    pending: Option<TestDescriptor>,
    /// Source failure observed inside the readiness wait, surfaced by the
    /// next `spawn`.
    pending_err: Option<SourceError>,
    source_done: bool,
    /// Last spawn pass stopped for want of a slot, not input.
    slot_starved: bool,
    interrupted: bool,
}

impl Engine {
    pub fn new(
        command: Vec<String>,
        source: Box<dyn DescriptorSource>,
        broker: TokenBroker,
        sum: Box<dyn Write + Send>,
        log: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            command,
            limits: Limits::default(),
            source,
            broker,
            jobs: Vec::new(),
            tally: Tally::new(),
            sum,
            log,
            pending: None,
            pending_err: None,
            source_done: false,
            slot_starved: false,
            interrupted: false,
        }
    }

    /// Apply per-child resource limits to every spawned job.
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Loop invariant: there is still input to start or work in flight.
    pub fn is_live(&self) -> bool {
        !(self.source_done || self.interrupted) || !self.jobs.is_empty()
    }

    /// Jobs currently in the live set.
    pub fn live(&self) -> usize {
        self.jobs.len()
    }

    /// Jobs whose process is running right now.
    pub fn running(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| matches!(j.state(), JobState::Spawned | JobState::Running))
            .count()
    }

    pub fn tally(&self) -> &Tally {
        &self.tally
    }

    pub fn broker(&self) -> &TokenBroker {
        &self.broker
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted
    }

    /// Start jobs while slots and descriptors are both available.
    ///
    /// Never blocks: a slot refusal or not-yet-ready input ends the pass,
    /// and `process` then waits for whichever is missing. A descriptor
    /// whose process cannot be created still enters the live set (as
    /// `SpawnFailed`) so retirement handles every job the same way.
    pub fn spawn(&mut self) -> Result<(), EngineError> {
        use futures::FutureExt;

        self.slot_starved = false;
        while !self.interrupted {
            if let Some(err) = self.pending_err.take() {
                self.source_done = true;
                return Err(err.into());
            }
            // A descriptor in hand first, then a slot for it.
            if self.pending.is_none() {
                if self.source_done {
                    break;
                }
                match self.source.next().now_or_never() {
                    Some(Ok(Some(descriptor))) => self.pending = Some(descriptor),
                    Some(Ok(None)) => {
                        self.source_done = true;
                        break;
                    }
                    Some(Err(err)) => {
                        self.source_done = true;
                        return Err(err.into());
                    }
                    // Input not ready; process() waits on the source.
                    None => break,
                }
            }
            if !self.broker.try_acquire()? {
                self.slot_starved = true;
                break;
            }
            let descriptor = self.pending.take().expect("descriptor fetched above");
            let argv = self.build_argv(&descriptor);
            let mut job = Job::queued(descriptor, argv);
            job.launch(&self.limits);
            debug!(
                descriptor = %job.descriptor(),
                state = %job.state(),
                live = self.jobs.len() + 1,
                "spawned"
            );
            self.jobs.push(job);
        }
        Ok(())
    }

    /// Block until something happens: output became readable, a child
    /// exited, the next descriptor arrived, or (when slot-starved) the
    /// external token channel has a token; or until `timeout` elapses, when one
    /// is given.
    ///
    /// Drains everything that is ready without blocking further. Does not
    /// retire jobs.
    pub async fn process(&mut self, timeout: Option<Duration>) {
        // Retirement work is already pending; let the caller take it
        // before blocking on anything new.
        if self.jobs.iter().any(|j| j.is_complete()) {
            return;
        }
        let want_token =
            self.slot_starved && !self.interrupted && self.broker.has_external();
        let want_input = !self.source_done
            && !self.interrupted
            && self.pending.is_none()
            && self.pending_err.is_none();

        {
            let mut waits: Vec<Pin<Box<dyn Future<Output = ()> + '_>>> = Vec::new();
            for job in self.jobs.iter_mut() {
                if job.needs_pump() {
                    waits.push(Box::pin(job.pump()));
                }
            }
            if want_token {
                waits.push(Box::pin(self.broker.wait_external()));
            }
            if want_input {
                let source = &mut self.source;
                let pending = &mut self.pending;
                let pending_err = &mut self.pending_err;
                let done = &mut self.source_done;
                waits.push(Box::pin(async move {
                    match source.next().await {
                        Ok(Some(descriptor)) => *pending = Some(descriptor),
                        Ok(None) => *done = true,
                        Err(err) => *pending_err = Some(err),
                    }
                }));
            }
            if waits.is_empty() {
                return;
            }
            let first = futures::future::select_all(waits);
            match timeout {
                Some(limit) => {
                    let _ = tokio::time::timeout(limit, first).await;
                }
                None => {
                    first.await;
                }
            }
        }

        // Opportunistic pass: absorb whatever else is already ready.
        loop {
            let mut ready: Vec<Pin<Box<dyn Future<Output = ()> + '_>>> = Vec::new();
            for job in self.jobs.iter_mut() {
                if job.needs_pump() {
                    ready.push(Box::pin(job.pump()));
                }
            }
            if ready.is_empty() {
                break;
            }
            let poll = tokio::time::timeout(
                Duration::ZERO,
                futures::future::select_all(ready),
            );
            if poll.await.is_err() {
                break;
            }
        }
    }

    /// Retire every job whose process has exited and whose output has
    /// reached end-of-data: classify, account, report, release the slot.
    pub fn retire(&mut self) -> Result<(), EngineError> {
        let mut ix = 0;
        while ix < self.jobs.len() {
            if self.jobs[ix].is_complete() {
                let job = self.jobs.swap_remove(ix);
                self.retire_one(job)?;
            } else {
                ix += 1;
            }
        }
        Ok(())
    }

    fn retire_one(&mut self, mut job: Job) -> Result<(), EngineError> {
        let verdict = match job.spawn_error() {
            Some(_) => Verdict::Error,
            None => classify(&[job.stdout_bytes(), job.stderr_bytes()]),
        };
        job.mark_retired();
        self.tally.add(verdict);

        // The log gets the job's full captured output, then the verdict
        // line; the sum gets the verdict line only.
        self.log.write_all(job.stdout_bytes())?;
        self.log.write_all(job.stderr_bytes())?;
        if let Some(err) = job.spawn_error() {
            writeln!(self.log, "{err}")?;
        }
        let line = format!("{verdict}: {}\n", job.descriptor());
        self.sum.write_all(line.as_bytes())?;
        self.log.write_all(line.as_bytes())?;

        debug!(
            %verdict,
            descriptor = %job.descriptor(),
            exit = ?job.exit_status(),
            live = self.jobs.len(),
            "retired"
        );
        self.broker.release()?;
        Ok(())
    }

    /// One line of progress: the tally so far plus what is in flight.
    /// Field order is fixed so successive renders line up.
    pub fn progress(&self) -> String {
        let mut text = String::new();
        for verdict in Verdict::ALL {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(verdict.name());
            text.push(' ');
            text.push_str(&self.tally.count(verdict).to_string());
        }
        text.push_str(&format!(" ({} running)", self.running()));
        text
    }

    /// Stop the run: no more spawns, ask every live child to terminate.
    /// Jobs already live still drain, classify, and release their slots.
    pub fn interrupt(&mut self) {
        if self.interrupted {
            return;
        }
        self.interrupted = true;
        debug!(live = self.jobs.len(), "interrupted; draining live jobs");
        for job in &mut self.jobs {
            job.terminate();
        }
    }

    /// Emit the final summary to the sum sink, and to `echo` as well when
    /// the sum is going to a file the operator is not watching.
    pub fn fini(&mut self, echo: Option<&mut dyn Write>) -> Result<(), EngineError> {
        let summary = self.tally.to_string();
        self.sum.write_all(summary.as_bytes())?;
        self.sum.flush()?;
        self.log.flush()?;
        if let Some(out) = echo {
            out.write_all(summary.as_bytes())?;
        }
        Ok(())
    }

    /// Abandon the run: interrupt, then drain until every slot has been
    /// released. For the abnormal-shutdown path where the caller is about
    /// to exit with an error but borrowed tokens must still go home.
    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        self.interrupt();
        while !self.jobs.is_empty() {
            self.process(Some(Duration::from_millis(100))).await;
            self.retire()?;
        }
        Ok(())
    }

    fn build_argv(&self, descriptor: &TestDescriptor) -> Vec<String> {
        self.command
            .iter()
            .cloned()
            .chain(descriptor.words().map(String::from))
            .collect()
    }
}
