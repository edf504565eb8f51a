//! Slot and token accounting for bounded parallelism.
//!
//! The engine always owns one implicit slot: a test driver that was started
//! at all may run one child. `--jobs N` adds local extra capacity on top.
//! Beyond that, slots can be borrowed from a cooperating build system
//! through a make-style jobserver: a shared byte channel where every byte
//! in flight is permission to run one more job. Borrowed bytes must be
//! written back; a leaked token starves the whole enclosing build, and a
//! double release lets it oversubscribe, so the accounting here is strict
//! and mismatches are fatal.
//!
//! The channel is described by `MAKEFLAGS`, e.g.:
//!
//! ```text
//! MAKEFLAGS="-j8 --jobserver-auth=3,4"
//! MAKEFLAGS="--jobserver-auth=fifo:/tmp/make-fifo"
//! ```
//!
//! Absence of the variable (or of the jobserver word within it) simply
//! means no external broker. A description that is present but unusable is
//! a fatal configuration error, never a silent fallback.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use thiserror::Error;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tracing::{debug, trace};

/// Hard ceiling on local extra capacity.
const MAX_LOCAL_EXTRA: u32 = 256;

/// Environment variable carrying the jobserver description.
const MAKEFLAGS: &str = "MAKEFLAGS";

/// Token-channel and accounting failures. All of these are fatal to the
/// run: once the channel state is in doubt the slot invariant cannot be
/// trusted.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("malformed jobserver description '{0}'")]
    Malformed(String),
    #[error("jobserver fd {0} is not open")]
    DeadFd(RawFd),
    #[error("cannot open jobserver fifo '{path}': {source}")]
    Fifo {
        path: PathBuf,
        source: io::Error,
    },
    #[error("jobserver channel closed by broker")]
    Closed,
    #[error("short write returning jobserver token")]
    ShortWrite,
    #[error("slot released with none held")]
    ReleaseUnderflow,
    #[error("jobserver channel: {0}")]
    Io(#[from] io::Error),
}

/// Parsed form of a jobserver description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSpec {
    /// Inherited read/write fd pair (`--jobserver-auth=R,W`).
    Fds(RawFd, RawFd),
    /// Named fifo (`--jobserver-auth=fifo:PATH`).
    Fifo(PathBuf),
}

/// Extract the jobserver description from a `MAKEFLAGS`-style string.
///
/// The variable carries arbitrary other flags; only the jobserver word is
/// parsed, and the last occurrence wins (make appends overrides).
pub fn parse_jobserver(flags: &str) -> Result<Option<ChannelSpec>, BrokerError> {
    let mut spec = None;
    for word in flags.split_whitespace() {
        let desc = word
            .strip_prefix("--jobserver-auth=")
            .or_else(|| word.strip_prefix("--jobserver-fds="));
        let Some(desc) = desc else { continue };

        if let Some(path) = desc.strip_prefix("fifo:") {
            if path.is_empty() {
                return Err(BrokerError::Malformed(word.to_string()));
            }
            spec = Some(ChannelSpec::Fifo(PathBuf::from(path)));
            continue;
        }

        let Some((r, w)) = desc.split_once(',') else {
            return Err(BrokerError::Malformed(word.to_string()));
        };
        match (r.parse::<RawFd>(), w.parse::<RawFd>()) {
            (Ok(r), Ok(w)) if r >= 0 && w >= 0 => spec = Some(ChannelSpec::Fds(r, w)),
            _ => return Err(BrokerError::Malformed(word.to_string())),
        }
    }
    Ok(spec)
}

/// The byte channel shared with the external broker.
///
/// The read end is registered with the tokio reactor so the engine's wait
/// can include "a token became available" as a wake condition; actual token
/// reads go through a non-blocking `poll(2)` probe so an empty channel is
/// an answer, not a stall.
pub struct ExternalChannel {
    read: AsyncFd<OwnedFd>,
    write: OwnedFd,
}

impl ExternalChannel {
    /// Open the channel a `ChannelSpec` describes. Dead fds and unopenable
    /// fifos are reported here, before the scheduling loop starts.
    pub fn open(spec: ChannelSpec) -> Result<Self, BrokerError> {
        match spec {
            ChannelSpec::Fds(r, w) => {
                for fd in [r, w] {
                    if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
                        return Err(BrokerError::DeadFd(fd));
                    }
                }
                // The fds were inherited for us to own; closing them at
                // shutdown is part of the contract.
                let read = unsafe { OwnedFd::from_raw_fd(r) };
                let write = unsafe { OwnedFd::from_raw_fd(w) };
                Self::from_owned(read, write)
            }
            ChannelSpec::Fifo(path) => {
                let open_rw = || {
                    std::fs::OpenOptions::new()
                        .read(true)
                        .write(true)
                        .open(&path)
                };
                let read = open_rw().map_err(|source| BrokerError::Fifo {
                    path: path.clone(),
                    source,
                })?;
                let write = open_rw().map_err(|source| BrokerError::Fifo {
                    path: path.clone(),
                    source,
                })?;
                Self::from_owned(read.into(), write.into())
            }
        }
    }

    /// Wrap an already-open fd pair. Must be called from within a tokio
    /// runtime (the read end registers with the reactor).
    pub fn from_owned(read: OwnedFd, write: OwnedFd) -> Result<Self, BrokerError> {
        let read = AsyncFd::with_interest(read, Interest::READABLE)?;
        Ok(Self { read, write })
    }

    /// Try to borrow one token. `Ok(None)` means the channel is empty.
    fn try_take(&self) -> Result<Option<u8>, BrokerError> {
        let fd = self.read.get_ref().as_raw_fd();
        if !poll_in(fd)? {
            return Ok(None);
        }
        match read_byte(fd)? {
            Some(byte) => Ok(Some(byte)),
            // Zero-length read: the broker closed its end mid-run.
            None => Err(BrokerError::Closed),
        }
    }

    /// Return a borrowed token byte. Make requires the same byte that was
    /// read to be written back.
    fn put_back(&self, byte: u8) -> Result<(), BrokerError> {
        let fd = self.write.as_raw_fd();
        loop {
            let n = unsafe { libc::write(fd, (&byte as *const u8).cast(), 1) };
            if n == 1 {
                return Ok(());
            }
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(BrokerError::Io(err));
            }
            return Err(BrokerError::ShortWrite);
        }
    }

    /// Wait until the read end looks readable.
    ///
    /// Returns without consuming anything; the caller's next `try_take`
    /// does the read. Stale reactor readiness is cleared only when the
    /// probe disagrees, so a token left unconsumed keeps the wait hot.
    pub async fn wait_readable(&self) {
        loop {
            let Ok(mut guard) = self.read.readable().await else {
                return;
            };
            match poll_in(self.read.get_ref().as_raw_fd()) {
                Ok(true) | Err(_) => return,
                Ok(false) => guard.clear_ready(),
            }
        }
    }
}

impl std::fmt::Debug for ExternalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalChannel")
            .field("read", &self.read.get_ref().as_raw_fd())
            .field("write", &self.write.as_raw_fd())
            .finish()
    }
}

/// Answers "may I start one more job right now?" and takes slots back.
#[derive(Debug)]
pub struct TokenBroker {
    /// Local capacity: the implicit self-slot plus `--jobs` extras.
    capacity: usize,
    /// Local slots currently in use.
    local_held: usize,
    /// Token bytes borrowed from the external channel, to be written back.
    borrowed: Vec<u8>,
    external: Option<ExternalChannel>,
}

impl TokenBroker {
    /// Local-only broker: one implicit slot plus `extra`.
    pub fn new(extra: u32) -> Self {
        let extra = extra.min(MAX_LOCAL_EXTRA);
        Self {
            capacity: 1 + extra as usize,
            local_held: 0,
            borrowed: Vec::new(),
            external: None,
        }
    }

    /// Broker backed by an external channel on top of local capacity.
    pub fn with_channel(extra: u32, channel: ExternalChannel) -> Self {
        let mut broker = Self::new(extra);
        broker.external = Some(channel);
        broker
    }

    /// Build from the environment: local `extra` plus whatever jobserver
    /// `MAKEFLAGS` describes. Must be called within a tokio runtime.
    pub fn from_env(extra: u32) -> Result<Self, BrokerError> {
        let flags = std::env::var(MAKEFLAGS).unwrap_or_default();
        match parse_jobserver(&flags)? {
            None => Ok(Self::new(extra)),
            Some(spec) => {
                debug!(?spec, "joining external jobserver");
                Ok(Self::with_channel(extra, ExternalChannel::open(spec)?))
            }
        }
    }

    /// Local capacity (implicit slot included).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held, local and borrowed together.
    pub fn held(&self) -> usize {
        self.local_held + self.borrowed.len()
    }

    pub fn has_external(&self) -> bool {
        self.external.is_some()
    }

    /// Non-blocking: grant one slot if any is available.
    ///
    /// Local capacity is preferred; otherwise one byte is borrowed from the
    /// external channel. An empty channel means "no" (`Ok(false)`), not an
    /// error; a closed or misbehaving channel is fatal.
    pub fn try_acquire(&mut self) -> Result<bool, BrokerError> {
        if self.local_held < self.capacity {
            self.local_held += 1;
            trace!(held = self.held(), "acquired local slot");
            return Ok(true);
        }
        if let Some(channel) = &self.external {
            if let Some(byte) = channel.try_take()? {
                self.borrowed.push(byte);
                trace!(held = self.held(), "borrowed external token");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Give one slot back. Must be called exactly once per successful
    /// `try_acquire`; borrowed tokens are returned to the channel first.
    pub fn release(&mut self) -> Result<(), BrokerError> {
        if let Some(byte) = self.borrowed.pop() {
            let channel = self.external.as_ref().expect("borrowed token without channel");
            channel.put_back(byte)?;
            trace!(held = self.held(), "returned external token");
            return Ok(());
        }
        if self.local_held == 0 {
            return Err(BrokerError::ReleaseUnderflow);
        }
        self.local_held -= 1;
        trace!(held = self.held(), "released local slot");
        Ok(())
    }

    /// Wait until the external channel looks readable. Pends forever when
    /// no channel is configured; callers gate on `has_external`.
    pub async fn wait_external(&self) {
        match &self.external {
            Some(channel) => channel.wait_readable().await,
            None => std::future::pending().await,
        }
    }
}

/// `poll(2)` with a zero timeout: is there data to read right now?
fn poll_in(fd: RawFd) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rc > 0 && pfd.revents & (libc::POLLIN | libc::POLLHUP) != 0);
    }
}

/// Read one byte; `Ok(None)` is end-of-channel.
fn read_byte(fd: RawFd) -> io::Result<Option<u8>> {
    let mut byte = 0u8;
    loop {
        let n = unsafe { libc::read(fd, (&mut byte as *mut u8).cast(), 1) };
        if n == 1 {
            return Ok(Some(byte));
        }
        if n == 0 {
            return Ok(None);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}
