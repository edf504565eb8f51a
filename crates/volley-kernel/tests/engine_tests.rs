//! End-to-end engine tests with real spawned children.
//!
//! Every test drives the same loop the CLI does (spawn, process, retire)
//! against small `sh` scripts written to a scratch directory.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use volley_kernel::{
    Engine, EngineError, LineSource, TestDescriptor, TokenBroker, Verdict,
};

// ============================================================================
// Test Helpers
// ============================================================================

/// Shared in-memory sink for the sum/log streams.
#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

impl Sink {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Fresh scratch directory for one test's scripts.
fn scratch(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("volley-engine-{tag}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path.display().to_string()
}

fn engine_for(
    command: &[&str],
    descriptors: &[String],
    extra_jobs: u32,
) -> (Engine, Sink, Sink) {
    let input: String = descriptors
        .iter()
        .map(|d| format!("{d}\n"))
        .collect();
    let source = LineSource::from_reader(Box::new(std::io::Cursor::new(input.into_bytes())));
    let sum = Sink::default();
    let log = Sink::default();
    let engine = Engine::new(
        command.iter().map(|s| s.to_string()).collect(),
        Box::new(source),
        TokenBroker::new(extra_jobs),
        Box::new(sum.clone()),
        Box::new(log.clone()),
    );
    (engine, sum, log)
}

/// Drive the engine to completion, returning the peak number of jobs that
/// were ever simultaneously running.
async fn drive(engine: &mut Engine) -> Result<usize, EngineError> {
    let mut peak = 0;
    tokio::time::timeout(Duration::from_secs(30), async {
        while engine.is_live() {
            engine.spawn()?;
            peak = peak.max(engine.running());
            engine.process(Some(Duration::from_millis(500))).await;
            engine.retire()?;
        }
        Ok::<(), EngineError>(())
    })
    .await
    .expect("engine did not finish")?;
    Ok(peak)
}

// ============================================================================
// The Three-Descriptor Scenario
// ============================================================================

#[tokio::test]
async fn three_descriptors_budget_two() {
    let dir = scratch("three");
    let t1 = script(&dir, "t1.sh", "sleep 0.2\necho 'PASS: t1'\n");
    let t2 = script(&dir, "t2.sh", "sleep 0.2\necho 'FAIL: t2'\nexit 1\n");
    let t3 = script(&dir, "t3.sh", "echo 'ERROR: t3'\n");

    // One implicit slot plus one local extra: budget 2.
    let (mut engine, sum, _log) = engine_for(&["sh"], &[t1, t2, t3], 1);
    let peak = drive(&mut engine).await.unwrap();

    assert!(peak <= 2, "budget 2 exceeded: {peak} jobs ran at once");
    assert_eq!(engine.tally().count(Verdict::Pass), 1);
    assert_eq!(engine.tally().count(Verdict::Fail), 1);
    assert_eq!(engine.tally().count(Verdict::Error), 1);
    assert_eq!(engine.tally().count(Verdict::XPass), 0);
    assert_eq!(engine.tally().count(Verdict::XFail), 0);
    assert_eq!(engine.tally().count(Verdict::Unsupported), 0);

    engine.fini(None).unwrap();
    let sum = sum.text();
    assert!(sum.contains("PASS 1\n"), "summary missing PASS count: {sum}");
    assert!(sum.contains("FAIL 1\n"));
    assert!(sum.contains("ERROR 1\n"));
}

// ============================================================================
// Ordering and Classification
// ============================================================================

#[tokio::test]
async fn budget_one_spawns_in_descriptor_order() {
    let dir = scratch("order");
    let order = dir.join("order.txt");
    let mut descriptors = Vec::new();
    for name in ["A", "B", "C"] {
        descriptors.push(script(
            &dir,
            &format!("{name}.sh"),
            &format!("echo {name} >> {}\necho 'PASS: {name}'\n", order.display()),
        ));
    }

    let (mut engine, _sum, _log) = engine_for(&["sh"], &descriptors, 0);
    let peak = drive(&mut engine).await.unwrap();

    assert_eq!(peak, 1, "budget 1 must serialize jobs");
    let recorded = fs::read_to_string(&order).unwrap();
    assert_eq!(recorded, "A\nB\nC\n", "spawn order must follow input order");
}

#[tokio::test]
async fn last_status_line_wins() {
    let dir = scratch("lastwins");
    let t = script(
        &dir,
        "flip.sh",
        "echo 'FAIL: early attempt'\necho 'diagnostic chatter'\necho 'PASS: final'\n",
    );
    let (mut engine, sum, _log) = engine_for(&["sh"], &[t], 0);
    drive(&mut engine).await.unwrap();

    assert_eq!(engine.tally().count(Verdict::Pass), 1);
    assert_eq!(engine.tally().count(Verdict::Fail), 0);
    assert!(sum.text().starts_with("PASS: "));
}

#[tokio::test]
async fn silent_test_classifies_as_error() {
    let dir = scratch("silent");
    let t = script(&dir, "mum.sh", "echo 'no status here'\n");
    let (mut engine, _sum, log) = engine_for(&["sh"], &[t], 0);
    drive(&mut engine).await.unwrap();

    assert_eq!(engine.tally().count(Verdict::Error), 1);
    // The captured output still reaches the log.
    assert!(log.text().contains("no status here"));
}

#[tokio::test]
async fn spawn_failure_is_error_and_run_continues() {
    let dir = scratch("spawnfail");
    let good = script(&dir, "good.sh", "echo 'PASS: good'\n");
    // Empty command prefix: the descriptor is the whole argv, so the first
    // one names a program that does not exist.
    let descriptors = vec!["volley-no-such-program-xyz".to_string(), format!("sh {good}")];
    let (mut engine, sum, _log) = engine_for(&[], &descriptors, 0);
    drive(&mut engine).await.unwrap();

    assert_eq!(engine.tally().count(Verdict::Error), 1);
    assert_eq!(engine.tally().count(Verdict::Pass), 1);
    assert!(sum.text().contains("ERROR: volley-no-such-program-xyz"));
}

// ============================================================================
// Log Routing
// ============================================================================

#[tokio::test]
async fn verdict_lines_reach_both_sinks_output_only_log() {
    let dir = scratch("sinks");
    let t = script(&dir, "chat.sh", "echo 'stdout chatter'\necho 'PASS: chat'\n");
    let (mut engine, sum, log) = engine_for(&["sh"], &[t], 0);
    drive(&mut engine).await.unwrap();
    engine.fini(None).unwrap();

    let sum = sum.text();
    let log = log.text();
    assert!(sum.contains("PASS: chat"), "verdict line missing from sum");
    assert!(log.contains("PASS: chat"), "verdict line missing from log");
    assert!(log.contains("stdout chatter"), "captured output missing from log");
    assert!(
        !sum.contains("stdout chatter"),
        "raw output must not leak into the sum"
    );
}

// ============================================================================
// Interruption
// ============================================================================

#[tokio::test]
async fn interrupt_drains_and_classifies_partial_output() {
    let dir = scratch("interrupt");
    let mut descriptors = Vec::new();
    for n in 0..2 {
        descriptors.push(script(
            &dir,
            &format!("slow{n}.sh"),
            "echo 'starting up'\nexec sleep 30\n",
        ));
    }
    let (mut engine, _sum, log) = engine_for(&["sh"], &descriptors, 1);

    tokio::time::timeout(Duration::from_secs(15), async {
        engine.spawn().unwrap();
        assert_eq!(engine.running(), 2);
        // Let the children get their first line out.
        engine.process(Some(Duration::from_millis(300))).await;
        engine.interrupt();
        while engine.is_live() {
            engine.spawn().unwrap();
            engine.process(Some(Duration::from_millis(500))).await;
            engine.retire().unwrap();
        }
    })
    .await
    .expect("interrupted engine did not drain");

    assert!(engine.was_interrupted());
    // Both jobs were classified (no status line emitted -> ERROR) and
    // every slot went back.
    assert_eq!(engine.tally().total(), 2);
    assert_eq!(engine.tally().count(Verdict::Error), 2);
    assert_eq!(engine.broker().held(), 0);
    assert!(log.text().contains("starting up"), "partial output was dropped");
}

// ============================================================================
// Progress
// ============================================================================

#[tokio::test]
async fn progress_has_stable_field_order() {
    let dir = scratch("progress");
    let t = script(&dir, "one.sh", "echo 'PASS: one'\n");
    let (mut engine, _sum, _log) = engine_for(&["sh"], &[t], 0);

    let before = engine.progress();
    assert!(before.starts_with("PASS 0 FAIL 0 "));
    assert!(before.ends_with("(0 running)"));

    drive(&mut engine).await.unwrap();
    let after = engine.progress();
    assert!(after.starts_with("PASS 1 FAIL 0 "));
    assert!(after.ends_with("(0 running)"));
}

// ============================================================================
// Descriptor plumbing
// ============================================================================

#[tokio::test]
async fn descriptor_words_extend_the_command() {
    let dir = scratch("words");
    let t = script(
        &dir,
        "args.sh",
        "if [ \"$1\" = '-x' ]; then echo 'PASS: got flag'; else echo 'FAIL: no flag'; fi\n",
    );
    // The descriptor carries a per-test flag after the script name.
    let (mut engine, _sum, _log) = engine_for(&["sh"], &[format!("{t} -x")], 0);
    drive(&mut engine).await.unwrap();
    assert_eq!(engine.tally().count(Verdict::Pass), 1);
}

#[tokio::test]
async fn descriptor_display_round_trips() {
    let desc = TestDescriptor::new("case.t -v");
    assert_eq!(desc.to_string(), "case.t -v");
    assert_eq!(desc.as_str(), "case.t -v");
}
