//! Campaign scenarios driven through scripted worker and corpus doubles.
//! The tokio clock is paused, so the deadline/timeout/OOM scenarios use
//! realistic configured values and still run instantly.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use anglerfuzz::config::Config;
use anglerfuzz::corpus::Corpus;
use anglerfuzz::manager::{self, ExitKind, StopReason, WorkerControl, WorkerLink};
use anglerfuzz::protocol::WorkerMessage;
use anglerfuzz::runner::process::WorkerError;

/// Worker double that answers each dispatch according to a script.
/// `None` entries (and an exhausted script) simulate a worker that never
/// replies.
struct ScriptedWorker {
    script: VecDeque<Option<WorkerMessage>>,
    events_tx: Option<mpsc::Sender<WorkerMessage>>,
    state: Arc<WorkerState>,
    rss: u64,
    exit: ExitKind,
    /// Dispatches past this count fail with a broken pipe.
    fail_after: Option<usize>,
}

#[derive(Default)]
struct WorkerState {
    dispatched: Mutex<Vec<Vec<u8>>>,
    killed: AtomicBool,
    stop_requested: AtomicBool,
}

impl WorkerState {
    fn dispatched(&self) -> Vec<Vec<u8>> {
        self.dispatched.lock().unwrap().clone()
    }
}

impl WorkerControl for ScriptedWorker {
    fn dispatch(&mut self, buf: &[u8]) -> Result<(), WorkerError> {
        let mut dispatched = self.state.dispatched.lock().unwrap();
        if self.fail_after.is_some_and(|n| dispatched.len() >= n) {
            return Err(WorkerError::Dispatch(io::ErrorKind::BrokenPipe.into()));
        }
        dispatched.push(buf.to_vec());
        drop(dispatched);
        if let Some(Some(reply)) = self.script.pop_front() {
            if let Some(tx) = &self.events_tx {
                tx.try_send(reply).unwrap();
            }
        }
        Ok(())
    }

    fn request_stop(&mut self) {
        self.state.stop_requested.store(true, Ordering::SeqCst);
        // Cooperative stop: the worker drains and exits cleanly.
        self.events_tx.take();
    }

    fn kill(&mut self) {
        self.state.killed.store(true, Ordering::SeqCst);
        self.events_tx.take();
    }

    fn sample_rss(&mut self) -> Option<u64> {
        Some(self.rss)
    }

    fn wait_exit(&mut self) -> ExitKind {
        self.exit
    }
}

fn scripted_worker(
    script: Vec<Option<WorkerMessage>>,
    rss: u64,
    exit: ExitKind,
) -> (
    WorkerLink<ScriptedWorker>,
    Arc<WorkerState>,
    mpsc::Sender<WorkerMessage>,
) {
    let (events_tx, events) = mpsc::channel(64);
    let state = Arc::new(WorkerState::default());
    let worker = ScriptedWorker {
        script: script.into(),
        events_tx: Some(events_tx.clone()),
        state: Arc::clone(&state),
        rss,
        exit,
        fail_after: None,
    };
    (
        WorkerLink {
            events,
            control: worker,
        },
        state,
        events_tx,
    )
}

/// Corpus double: a FIFO queue for regression plus a scripted generator.
struct FakeCorpus {
    queue: VecDeque<Vec<u8>>,
    generator: Box<dyn FnMut() -> Vec<u8>>,
    admitted: Vec<Vec<u8>>,
}

impl FakeCorpus {
    fn seeded(seeds: &[&[u8]]) -> Self {
        Self {
            queue: seeds.iter().map(|s| s.to_vec()).collect(),
            generator: Box::new(|| b"generated".to_vec()),
            admitted: Vec::new(),
        }
    }

    fn generating(generator: impl FnMut() -> Vec<u8> + 'static) -> Self {
        Self {
            queue: VecDeque::new(),
            generator: Box::new(generator),
            admitted: Vec::new(),
        }
    }
}

impl Corpus for FakeCorpus {
    fn len(&self) -> usize {
        self.queue.len() + self.admitted.len()
    }
    fn shift(&mut self) -> Option<Vec<u8>> {
        self.queue.pop_front()
    }
    fn generate_input(&mut self) -> Vec<u8> {
        (self.generator)()
    }
    fn put_buffer(&mut self, buf: &[u8]) {
        self.admitted.push(buf.to_vec());
    }
}

fn result(coverage: u64) -> Option<WorkerMessage> {
    Some(WorkerMessage::Result { coverage })
}

fn test_config() -> (Config, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        artifact_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    (config, dir)
}

#[tokio::test(start_paused = true)]
async fn regression_replays_fifo_and_stops_clean() {
    let (link, state, _tx) =
        scripted_worker(vec![result(3), result(3)], 0, ExitKind::Clean);
    let mut corpus = FakeCorpus::seeded(&[b"A", b"B"]);
    let (mut config, _dir) = test_config();
    config.regression = true;

    let outcome = manager::run_campaign(link, &mut corpus, &config).await;

    assert_eq!(outcome.reason, StopReason::CorpusExhausted);
    assert_eq!(outcome.reason.exit_code(), 0);
    assert_eq!(outcome.total_executions, 2);
    assert_eq!(state.dispatched(), vec![b"A".to_vec(), b"B".to_vec()]);
    assert!(
        corpus.admitted.is_empty(),
        "regression must never admit entries"
    );
    assert!(!state.killed.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn admission_tracks_strict_coverage_growth() {
    let (link, state, _tx) = scripted_worker(
        vec![
            result(5),
            result(5),
            result(3),
            result(7),
            Some(WorkerMessage::Crash),
        ],
        0,
        ExitKind::Code(1),
    );
    let mut n = 0u32;
    let mut corpus = FakeCorpus::generating(move || {
        n += 1;
        format!("buf{n}").into_bytes()
    });
    let (config, dir) = test_config();

    let outcome = manager::run_campaign(link, &mut corpus, &config).await;

    assert_eq!(outcome.reason, StopReason::Crash);
    assert_eq!(outcome.reason.exit_code(), 1);
    assert_eq!(outcome.total_executions, 5);
    assert_eq!(outcome.total_coverage, 7);
    // Admitted exactly the buffers whose reply strictly exceeded the
    // running total: the first (5 > 0) and the fourth (7 > 5).
    assert_eq!(
        corpus.admitted,
        vec![b"buf1".to_vec(), b"buf4".to_vec()]
    );
    // The in-flight buffer at the moment of the crash is the artifact.
    let artifact = outcome.artifact.expect("crash must persist an artifact");
    assert_eq!(fs::read(&artifact).unwrap(), b"buf5");
    assert_eq!(state.dispatched().len(), 5);
    drop(dir);
}

#[tokio::test(start_paused = true)]
async fn deadline_is_measured_from_last_growth_not_campaign_start() {
    // No scripted reply: the single growth event is injected at t=4s.
    let (link, state, tx) = scripted_worker(vec![], 0, ExitKind::Clean);
    let mut corpus = FakeCorpus::generating(|| b"generated".to_vec());
    let (mut config, _dir) = test_config();
    config.fuzz_time_secs = 5;

    let start = tokio::time::Instant::now();
    let injector = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(4)).await;
        let _ = tx.send(WorkerMessage::Result { coverage: 9 }).await;
    });

    let outcome = manager::run_campaign(link, &mut corpus, &config).await;
    injector.await.unwrap();

    assert_eq!(outcome.reason, StopReason::Deadline);
    assert_eq!(outcome.reason.exit_code(), 0);
    assert_eq!(outcome.total_coverage, 9);
    assert!(state.stop_requested.load(Ordering::SeqCst));
    assert!(!state.killed.load(Ordering::SeqCst));
    // Growth happened at t=4s, so the budget may only elapse after t=9s.
    // Measured from campaign start it would have fired by t=6s.
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(9), "stopped at {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn hung_execution_is_killed_within_one_sampling_interval() {
    // Worker never replies at all.
    let (link, state, _tx) = scripted_worker(vec![], 0, ExitKind::Signal(9));
    let mut corpus = FakeCorpus::generating(|| b"stuck input".to_vec());
    let (config, dir) = test_config();

    let start = tokio::time::Instant::now();
    let outcome = manager::run_campaign(link, &mut corpus, &config).await;

    assert_eq!(outcome.reason, StopReason::Hang);
    assert_eq!(outcome.reason.exit_code(), 1);
    assert!(state.killed.load(Ordering::SeqCst));

    // Timeout is 30s and enforcement granularity is the 3s sampling
    // interval, so the kill lands in (30s, 33s].
    let elapsed = start.elapsed();
    assert!(elapsed > Duration::from_secs(30), "killed at {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(33), "killed at {elapsed:?}");

    let artifact = outcome.artifact.expect("hang must persist an artifact");
    assert_eq!(fs::read(&artifact).unwrap(), b"stuck input");
    drop(dir);
}

#[tokio::test(start_paused = true)]
async fn memory_ceiling_kills_without_an_artifact() {
    let (link, state, _tx) =
        scripted_worker(vec![], 64 * 1024 * 1024, ExitKind::Signal(9));
    let mut corpus = FakeCorpus::generating(|| b"hog".to_vec());
    let (mut config, dir) = test_config();
    config.rss_limit_mb = 1;

    let outcome = manager::run_campaign(link, &mut corpus, &config).await;

    assert_eq!(outcome.reason, StopReason::ResourceExceeded);
    assert_eq!(outcome.reason.exit_code(), 1);
    assert_eq!(outcome.total_coverage, 0);
    assert!(state.killed.load(Ordering::SeqCst));
    // The in-flight buffer is deliberately not persisted on OOM.
    assert!(outcome.artifact.is_none());
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test(start_paused = true)]
async fn grammar_draws_happen_on_cadence_after_first_admission() {
    // Eleven results, then a crash to end the campaign. Only the first
    // reply grows coverage, so the model is built solely from "seed1".
    let mut script: Vec<Option<WorkerMessage>> = vec![result(1)];
    script.extend(std::iter::repeat_with(|| result(1)).take(10));
    script.push(Some(WorkerMessage::Crash));
    let (link, state, _tx) = scripted_worker(script, 0, ExitKind::Code(1));

    let mut first = true;
    let mut corpus = FakeCorpus::generating(move || {
        if first {
            first = false;
            b"seed1".to_vec()
        } else {
            b"corp".to_vec()
        }
    });
    let (mut config, _dir) = test_config();
    config.versifier = true;

    let outcome = manager::run_campaign(link, &mut corpus, &config).await;
    assert_eq!(outcome.reason, StopReason::Crash);

    let dispatched = state.dispatched();
    assert_eq!(dispatched.len(), 12);
    assert_eq!(corpus.admitted, vec![b"seed1".to_vec()]);

    // Execution 10 drew from the grammar model: fragments of "seed1".
    assert!(
        dispatched[10].iter().all(|b| b"seed1".contains(b)),
        "expected a grammar draw, got {:?}",
        dispatched[10]
    );
    assert_ne!(dispatched[10], b"corp".to_vec());
    // Off-cadence executions stay on the corpus generator.
    assert_eq!(dispatched[5], b"corp".to_vec());
    assert_eq!(dispatched[11], b"corp".to_vec());
}

#[tokio::test(start_paused = true)]
async fn signal_death_racing_a_dispatch_still_classifies_as_crash() {
    // The worker replies once, then dies by signal; the next dispatch hits
    // a broken pipe. The exit status decides the classification.
    let (mut link, state, _tx) = scripted_worker(vec![result(4)], 0, ExitKind::Signal(11));
    link.control.fail_after = Some(1);
    let mut n = 0u32;
    let mut corpus = FakeCorpus::generating(move || {
        n += 1;
        format!("buf{n}").into_bytes()
    });
    let (config, dir) = test_config();

    let outcome = manager::run_campaign(link, &mut corpus, &config).await;

    assert_eq!(outcome.reason, StopReason::Crash);
    assert_eq!(outcome.reason.exit_code(), 1);
    assert_eq!(state.dispatched(), vec![b"buf1".to_vec()]);
    // The buffer whose execution preceded the death is the artifact.
    let artifact = outcome.artifact.expect("signal death persists an artifact");
    assert_eq!(fs::read(&artifact).unwrap(), b"buf1");
    drop(dir);
}

#[tokio::test(start_paused = true)]
async fn signal_death_persists_the_inflight_buffer() {
    // Worker dies silently: the event stream just ends.
    let (mut link, _state, tx) = scripted_worker(vec![], 0, ExitKind::Signal(11));
    drop(tx);
    // Close the worker's own sender too so recv() sees the stream end.
    link.control.events_tx.take();
    let mut corpus = FakeCorpus::generating(|| b"fatal input".to_vec());
    let (config, dir) = test_config();
    let outcome = manager::run_campaign(link, &mut corpus, &config).await;

    assert_eq!(outcome.reason, StopReason::Crash);
    let artifact = outcome.artifact.expect("signal death persists an artifact");
    assert_eq!(fs::read(&artifact).unwrap(), b"fatal input");
    drop(dir);
}

#[tokio::test(start_paused = true)]
async fn clean_worker_exit_is_a_cooperative_interrupt() {
    let (mut link, _state, tx) = scripted_worker(vec![], 0, ExitKind::Clean);
    drop(tx);
    link.control.events_tx.take();
    let mut corpus = FakeCorpus::generating(|| b"idle".to_vec());
    let (config, _dir) = test_config();

    let outcome = manager::run_campaign(link, &mut corpus, &config).await;
    assert_eq!(outcome.reason, StopReason::Interrupted);
    assert_eq!(outcome.reason.exit_code(), 0);
}
