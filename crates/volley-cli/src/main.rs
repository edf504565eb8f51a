//! volley CLI entry point.
//!
//! Usage:
//!   volley command... < tests.list     # Descriptors from stdin
//!   volley -l FILE command...          # Descriptors from a list file
//!   volley -g 'PROG ARGS' command...   # Descriptors from a generator
//!   volley -j 4 -o results command...  # 5-way parallel, results.sum/.log
//!
//! Each input line is appended to `command...` and run as one test; under
//! make, `MAKEFLAGS` jobserver tokens extend the parallel budget.

use std::env;
use std::fs::File;
use std::io::{BufWriter, IsTerminal, Write};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volley_kernel::{
    DescriptorSource, Engine, GeneratorSource, LineSource, Overwriter, TokenBroker,
};

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("volley: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let flags = Flags::parse(env::args().skip(1))?;

    // Tracing goes to stderr; stdout may be carrying the summary.
    let filter = if flags.verbose {
        EnvFilter::new("volley=debug,volley_kernel=debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    if flags.help {
        print_help();
        return Ok(ExitCode::SUCCESS);
    }
    if flags.version {
        println!(
            "volley {} ({} {})",
            env!("CARGO_PKG_VERSION"),
            env!("VOLLEY_GIT_HASH"),
            env!("VOLLEY_BUILD_DATE")
        );
        return Ok(ExitCode::SUCCESS);
    }
    if flags.command.is_empty() {
        bail!("no command to invoke (run 'volley --help' for usage)");
    }

    if let Some(dir) = &flags.dir {
        env::set_current_dir(dir).with_context(|| format!("cannot chdir '{dir}'"))?;
    }

    // Report sinks: FILE.sum/FILE.log, or stdout/stderr.
    let (sum, log): (Box<dyn Write + Send>, Box<dyn Write + Send>) = match &flags.out {
        Some(base) => {
            let sum_path = format!("{base}.sum");
            let sum = File::create(&sum_path)
                .with_context(|| format!("cannot write '{sum_path}'"))?;
            let log_path = format!("{base}.log");
            let log = File::create(&log_path)
                .with_context(|| format!("cannot write '{log_path}'"))?;
            (
                Box::new(BufWriter::new(sum)),
                Box::new(BufWriter::new(log)),
            )
        }
        None => (Box::new(std::io::stdout()), Box::new(std::io::stderr())),
    };

    // Live progress only when the report is going to files and a human is
    // watching stdout.
    let show_progress = flags.out.is_some() && std::io::stdout().is_terminal();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot start runtime")?;
    rt.block_on(drive(flags, sum, log, show_progress))
}

async fn drive(
    flags: Flags,
    sum: Box<dyn Write + Send>,
    log: Box<dyn Write + Send>,
    show_progress: bool,
) -> Result<ExitCode> {
    let broker = TokenBroker::from_env(flags.jobs).context("jobserver configuration")?;
    tracing::debug!(
        jobs = flags.jobs,
        external = broker.has_external(),
        "slot budget configured"
    );

    let source: Box<dyn DescriptorSource> = match (&flags.list, &flags.generator) {
        (Some(path), None) => Box::new(LineSource::from_path(path).await?),
        (None, Some(command)) => Box::new(GeneratorSource::spawn(command)?),
        (None, None) => Box::new(LineSource::stdin()),
        (Some(_), Some(_)) => unreachable!("rejected during flag parsing"),
    };

    let echo_summary = flags.out.is_some();
    let mut engine = Engine::new(flags.command, source, broker, sum, log);
    let mut overwriter = Overwriter::new();

    let result = main_loop(&mut engine, show_progress, &mut overwriter).await;

    if show_progress {
        let frame = overwriter.finish();
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(frame.as_bytes());
        let _ = stdout.flush();
    }

    if let Err(err) = result {
        // Borrowed jobserver tokens must go home even on a fatal error.
        let _ = engine.shutdown().await;
        return Err(err);
    }

    let mut stdout = std::io::stdout();
    let echo: Option<&mut dyn Write> = if echo_summary { Some(&mut stdout) } else { None };
    engine.fini(echo)?;

    Ok(if engine.was_interrupted() {
        ExitCode::from(130)
    } else {
        ExitCode::SUCCESS
    })
}

async fn main_loop(
    engine: &mut Engine,
    show_progress: bool,
    overwriter: &mut Overwriter,
) -> Result<()> {
    while engine.is_live() {
        engine.spawn()?;
        let listening = !engine.was_interrupted();
        let mut interrupt_now = false;
        tokio::select! {
            _ = engine.process(None) => {}
            _ = tokio::signal::ctrl_c(), if listening => {
                interrupt_now = true;
            }
        }
        if interrupt_now {
            engine.interrupt();
        }
        engine.retire()?;
        if show_progress {
            let frame = overwriter.frame(&engine.progress());
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(frame.as_bytes());
            let _ = stdout.flush();
        }
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"volley v{} — parallel test runner

Usage:
  volley [OPTIONS] command...

Each line of input (stdin, -l FILE, or -g generator output) is appended to
command... and spawned as one test process. Tests report their outcome by
printing a line such as 'PASS: name'; the last such line wins. Parallelism
is the implicit slot plus -j extras plus any MAKEFLAGS jobserver tokens.

Options:
  -j, --jobs N       Extra local job slots (default 0)
  -l, --list FILE    Read test descriptors from FILE
  -g, --gen CMD      Run CMD and read descriptors from its stdout
  -o, --out FILE     Write FILE.sum and FILE.log instead of stdout/stderr
  -C, --dir DIR      Change to DIR before running
  -v, --verbose      Debug diagnostics on stderr
  -h, --help         Show this help
      --version      Show version

Examples:
  ls tests/*.t | volley -j 8 checker       # 9-way parallel run
  volley -l nightly.list -o nightly check  # report in nightly.sum/.log
  volley -g 'lister --all' check           # generated test list
"#,
        env!("CARGO_PKG_VERSION")
    );
}

/// Parsed command line.
///
/// Parsing stops at the first word that is not an option; that word and
/// everything after it form the test command.
#[derive(Debug, Default, PartialEq)]
struct Flags {
    jobs: u32,
    list: Option<String>,
    generator: Option<String>,
    out: Option<String>,
    dir: Option<String>,
    verbose: bool,
    help: bool,
    version: bool,
    command: Vec<String>,
}

impl Flags {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut args = args.into_iter();
        let mut flags = Flags::default();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-h" | "--help" => flags.help = true,
                "--version" => flags.version = true,
                "-v" | "--verbose" => flags.verbose = true,
                "-j" | "--jobs" => flags.jobs = parse_jobs(&value_of(&mut args, &arg)?)?,
                "-l" | "--list" => flags.list = Some(value_of(&mut args, &arg)?),
                "-g" | "--gen" => flags.generator = Some(value_of(&mut args, &arg)?),
                "-o" | "--out" => flags.out = Some(value_of(&mut args, &arg)?),
                "-C" | "--dir" => flags.dir = Some(value_of(&mut args, &arg)?),
                _ => {
                    if let Some(value) = arg.strip_prefix("--jobs=") {
                        flags.jobs = parse_jobs(value)?;
                    } else if let Some(value) = arg.strip_prefix("--list=") {
                        flags.list = Some(value.to_string());
                    } else if let Some(value) = arg.strip_prefix("--gen=") {
                        flags.generator = Some(value.to_string());
                    } else if let Some(value) = arg.strip_prefix("--out=") {
                        flags.out = Some(value.to_string());
                    } else if let Some(value) = arg.strip_prefix("--dir=") {
                        flags.dir = Some(value.to_string());
                    } else if arg == "--" {
                        flags.command.extend(args.by_ref());
                        break;
                    } else if arg.starts_with('-') && arg.len() > 1 {
                        bail!("unknown option: {arg} (run 'volley --help' for usage)");
                    } else {
                        // First non-option word: the command starts here.
                        flags.command.push(arg);
                        flags.command.extend(args.by_ref());
                        break;
                    }
                }
            }
        }

        if flags.list.is_some() && flags.generator.is_some() {
            bail!("--list and --gen are mutually exclusive");
        }
        Ok(flags)
    }
}

fn value_of(args: &mut impl Iterator<Item = String>, name: &str) -> Result<String> {
    args.next()
        .with_context(|| format!("option '{name}' requires a value"))
}

fn parse_jobs(value: &str) -> Result<u32> {
    value
        .parse()
        .with_context(|| format!("job count '{value}' is not a number"))
}
