//! volley-kernel: the core of the volley test-execution engine.
//!
//! This crate provides:
//!
//! - **Broker**: slot/token accounting, cooperating with a make-style
//!   jobserver via `MAKEFLAGS`
//! - **Source**: test-descriptor production from list files, stdin, or a
//!   generator program
//! - **Spawn**: process creation with captured output and resource limits
//! - **Verdict**: status-line classification and the aggregate tally
//! - **Progress**: overwrite-in-place progress rendering for terminals
//! - **Engine**: the spawn/process/retire event loop that drives it all
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │  spawn()    ── TokenBroker ──▶ slot? ── Source ──▶ Job       │
//! │  process()  ── readiness wait: job pipes + token channel     │
//! │  retire()   ── exit+EOF? ──▶ classify ──▶ Tally / sum / log  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine is single-threaded: run it on a current-thread tokio runtime.
//! Parallelism comes from the spawned child processes, not from threads
//! inside the scheduler.

pub mod broker;
pub mod buffer;
pub mod engine;
pub mod progress;
pub mod source;
pub mod spawn;
pub mod verdict;

pub use broker::{BrokerError, ChannelSpec, ExternalChannel, TokenBroker};
pub use engine::{Engine, EngineError, Job, JobState};
pub use progress::Overwriter;
pub use source::{DescriptorSource, GeneratorSource, LineSource, SourceError, TestDescriptor};
pub use spawn::{Limits, SpawnError};
pub use verdict::{Tally, Verdict};
