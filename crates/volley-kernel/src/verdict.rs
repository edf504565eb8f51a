//! Verdict classification and the aggregate tally.
//!
//! A finished job is classified by scanning its captured output for lines of
//! the form `<STATUS>: ...` where `<STATUS>` is one of the six fixed verdict
//! names. The last recognized line wins: a test may print progress statuses
//! before its final one. Output with no recognized line is classified
//! `Error`: a test program that says nothing intelligible has misbehaved.
//!
//! The match is a fixed prefix-plus-colon test, not a pattern language.
//! The richer check syntax belongs to the verification tool that runs
//! *inside* test command lines, not to the scheduler.

/// Outcome of one retired job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Test passed.
    Pass,
    /// Test failed.
    Fail,
    /// Test passed but was expected to fail.
    XPass,
    /// Test failed and was expected to.
    XFail,
    /// Test misbehaved: spawn failure, no recognizable status output.
    Error,
    /// Test declined to run on this configuration.
    Unsupported,
}

impl Verdict {
    /// All verdicts, in report order.
    pub const ALL: [Verdict; 6] = [
        Verdict::Pass,
        Verdict::Fail,
        Verdict::XPass,
        Verdict::XFail,
        Verdict::Error,
        Verdict::Unsupported,
    ];

    /// The status-line name, as tests print it.
    pub fn name(self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::XPass => "XPASS",
            Verdict::XFail => "XFAIL",
            Verdict::Error => "ERROR",
            Verdict::Unsupported => "UNSUPPORTED",
        }
    }

    /// Decode one output line: `NAME:` followed by anything.
    ///
    /// The line must be longer than the name and the byte after the name
    /// must be a colon. Anything else is not a status line.
    pub fn decode(line: &[u8]) -> Option<Verdict> {
        for verdict in Verdict::ALL {
            let name = verdict.name().as_bytes();
            if line.len() > name.len()
                && line.starts_with(name)
                && line[name.len()] == b':'
            {
                return Some(verdict);
            }
        }
        None
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Classify captured output: the last recognized status line wins.
///
/// Streams are scanned in the order given (stdout first, then stderr), so a
/// status printed to stderr after the final stdout status takes precedence.
pub fn classify(streams: &[&[u8]]) -> Verdict {
    let mut verdict = None;
    for stream in streams {
        for line in stream.split(|&b| b == b'\n') {
            if let Some(v) = Verdict::decode(line) {
                verdict = Some(v);
            }
        }
    }
    verdict.unwrap_or(Verdict::Error)
}

/// Running totals per verdict. Never decremented.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tally {
    counts: [u32; 6],
}

impl Tally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one retired job.
    pub fn add(&mut self, verdict: Verdict) {
        self.counts[verdict as usize] += 1;
    }

    /// Count for one verdict.
    pub fn count(&self, verdict: Verdict) -> u32 {
        self.counts[verdict as usize]
    }

    /// Total jobs retired so far.
    pub fn total(&self) -> u32 {
        self.counts.iter().sum()
    }
}

/// The final summary: one `NAME count` line per verdict. PASS is always
/// present so the report has a stable shape; the others appear only when
/// non-zero.
impl std::fmt::Display for Tally {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for verdict in Verdict::ALL {
            let count = self.count(verdict);
            if verdict == Verdict::Pass || count != 0 {
                writeln!(f, "{} {}", verdict.name(), count)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_recognizes_each_name() {
        for verdict in Verdict::ALL {
            let line = format!("{}: something", verdict.name());
            assert_eq!(Verdict::decode(line.as_bytes()), Some(verdict));
        }
    }

    #[test]
    fn decode_requires_colon() {
        assert_eq!(Verdict::decode(b"PASS something"), None);
        assert_eq!(Verdict::decode(b"PASSED: ok"), None);
        assert_eq!(Verdict::decode(b"PASS"), None);
    }

    #[test]
    fn decode_bare_colon_counts() {
        // `NAME:` with no tail still decodes; the line only has to be
        // longer than the name itself.
        assert_eq!(Verdict::decode(b"PASS:"), Some(Verdict::Pass));
    }

    #[test]
    fn decode_is_anchored_at_line_start() {
        assert_eq!(Verdict::decode(b"note: PASS: nested"), None);
    }

    #[test]
    fn classify_single_status() {
        assert_eq!(classify(&[&b"PASS: foo\n"[..]]), Verdict::Pass);
    }

    #[test]
    fn classify_last_match_wins() {
        let out: &[u8] = b"FAIL: x\nsome diagnostic chatter\nPASS: y\n";
        assert_eq!(classify(&[out]), Verdict::Pass);
    }

    #[test]
    fn classify_no_status_is_error() {
        assert_eq!(classify(&[&b"hello world\n"[..]]), Verdict::Error);
        assert_eq!(classify(&[&b""[..]]), Verdict::Error);
    }

    #[test]
    fn classify_stderr_scanned_after_stdout() {
        let out: &[u8] = b"PASS: t\n";
        let err: &[u8] = b"UNSUPPORTED: t needs feature\n";
        assert_eq!(classify(&[out, err]), Verdict::Unsupported);
    }

    #[test]
    fn tally_summary_always_includes_pass() {
        let tally = Tally::new();
        assert_eq!(tally.to_string(), "PASS 0\n");
    }

    #[test]
    fn tally_summary_shows_nonzero_counts() {
        let mut tally = Tally::new();
        tally.add(Verdict::Pass);
        tally.add(Verdict::Fail);
        tally.add(Verdict::Fail);
        tally.add(Verdict::Error);
        assert_eq!(tally.to_string(), "PASS 1\nFAIL 2\nERROR 1\n");
        assert_eq!(tally.total(), 4);
    }
}
