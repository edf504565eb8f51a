//! Test-descriptor production.
//!
//! A descriptor is one line of text naming a single test invocation; the
//! engine appends its whitespace-split words to the command prefix to form
//! a job's argv. Descriptors come from a list file, from stdin, or from a
//! generator program whose stdout is read line by line. All variants share
//! one consumption contract: `next()` until `None`, and `None` is
//! permanent: once end of input is observed the source stays empty.
//!
//! `next()` is cancel-safe: the engine races it against job I/O inside its
//! readiness wait and drops the in-flight future freely. Partial lines
//! accumulate in the source, never in the dropped future.

use std::io;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::debug;

/// One unit of input: a single test invocation to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestDescriptor(String);

impl TestDescriptor {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The argv words this descriptor contributes.
    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.0.split_whitespace()
    }
}

impl std::fmt::Display for TestDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot read test list '{path}': {source}")]
    Open {
        path: String,
        source: io::Error,
    },
    #[error("cannot run generator '{command}': {source}")]
    Generator {
        command: String,
        source: io::Error,
    },
    #[error("generator exited with {status}")]
    GeneratorFailed { status: std::process::ExitStatus },
    #[error("reading test list: {0}")]
    Io(#[from] io::Error),
}

/// A lazy, forward-only, finite sequence of test descriptors.
#[async_trait]
pub trait DescriptorSource: Send {
    /// The next descriptor, or `None` (permanently) at end of input.
    ///
    /// Cancel-safe: dropping the future loses nothing.
    async fn next(&mut self) -> Result<Option<TestDescriptor>, SourceError>;
}

/// Shared line loop: accumulate up to a newline, skip blanks, latch at EOF.
///
/// Bytes are copied into `partial` before they are consumed from the
/// reader, which is what makes cancellation at the `fill_buf` await safe.
async fn next_line<R>(
    reader: &mut R,
    partial: &mut String,
    done: &mut bool,
) -> Result<Option<TestDescriptor>, SourceError>
where
    R: AsyncBufRead + Unpin,
{
    if *done {
        return Ok(None);
    }
    loop {
        let (chunk, consumed, complete) = {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                *done = true;
                // A trailing line without a newline still counts.
                let text = std::mem::take(partial);
                let text = text.trim();
                if text.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(TestDescriptor::new(text)));
            }
            match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => (
                    String::from_utf8_lossy(&buf[..pos]).into_owned(),
                    pos + 1,
                    true,
                ),
                None => (
                    String::from_utf8_lossy(buf).into_owned(),
                    buf.len(),
                    false,
                ),
            }
        };
        partial.push_str(&chunk);
        reader.consume(consumed);
        if complete {
            let text = std::mem::take(partial);
            let text = text.trim();
            if !text.is_empty() {
                return Ok(Some(TestDescriptor::new(text)));
            }
            // Blank line: keep scanning.
        }
    }
}

/// Line-oriented source: one descriptor per non-blank input line.
pub struct LineSource {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    partial: String,
    done: bool,
}

impl LineSource {
    pub fn from_reader(reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            reader: BufReader::new(reader),
            partial: String::new(),
            done: false,
        }
    }

    /// Read descriptors from the driver's stdin.
    pub fn stdin() -> Self {
        Self::from_reader(Box::new(tokio::io::stdin()))
    }

    /// Read descriptors from a list file.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|source| SourceError::Open {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self::from_reader(Box::new(file)))
    }
}

#[async_trait]
impl DescriptorSource for LineSource {
    async fn next(&mut self) -> Result<Option<TestDescriptor>, SourceError> {
        next_line(&mut self.reader, &mut self.partial, &mut self.done).await
    }
}

/// Generator-driven source: a program is spawned once and each line of its
/// stdout is one descriptor. The generator is reaped at end of input; a
/// non-zero exit is surfaced as an error rather than silently truncating
/// the run.
pub struct GeneratorSource {
    command: String,
    child: Option<Child>,
    reader: BufReader<ChildStdout>,
    partial: String,
    done: bool,
}

impl GeneratorSource {
    /// Spawn `command` (whitespace-split into argv). The generator's stderr
    /// passes through to the driver's stderr.
    pub fn spawn(command: &str) -> Result<Self, SourceError> {
        let argv: Vec<&str> = command.split_whitespace().collect();
        let Some((program, args)) = argv.split_first() else {
            return Err(SourceError::Generator {
                command: command.to_string(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty command"),
            });
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| SourceError::Generator {
                command: command.to_string(),
                source,
            })?;
        let stdout = child.stdout.take().expect("stdout was piped");
        debug!(%command, pid = ?child.id(), "generator started");
        Ok(Self {
            command: command.to_string(),
            child: Some(child),
            reader: BufReader::new(stdout),
            partial: String::new(),
            done: false,
        })
    }
}

#[async_trait]
impl DescriptorSource for GeneratorSource {
    async fn next(&mut self) -> Result<Option<TestDescriptor>, SourceError> {
        let was_done = self.done;
        let item = next_line(&mut self.reader, &mut self.partial, &mut self.done).await?;
        if self.done && !was_done {
            if let Some(mut child) = self.child.take() {
                let status = child.wait().await?;
                debug!(command = %self.command, %status, "generator finished");
                if !status.success() {
                    return Err(SourceError::GeneratorFailed { status });
                }
            }
        }
        Ok(item)
    }
}
