//! Campaign orchestration: input selection, coverage bookkeeping, crash
//! persistence, and the two periodic monitors (stats pulse and resource
//! sampling) that race the outstanding work item.

use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::artifact;
use crate::config::Config;
use crate::corpus::Corpus;
use crate::grammar::Verse;
use crate::protocol::WorkerMessage;
use crate::runner::monitor;
use crate::runner::process::WorkerError;

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Clean,
    Code(i32),
    Signal(i32),
}

/// Control half of the worker seam. The production implementation wraps a
/// real child process; tests drive the loop with scripted fakes.
pub trait WorkerControl {
    fn dispatch(&mut self, buf: &[u8]) -> Result<(), WorkerError>;
    /// Cooperative termination: the worker polls a flag and exits cleanly.
    fn request_stop(&mut self);
    /// Forced termination: unconditional kill, no cleanup guarantee.
    fn kill(&mut self);
    fn sample_rss(&mut self) -> Option<u64>;
    /// Reaps the worker; call once the event stream has ended.
    fn wait_exit(&mut self) -> ExitKind;
}

/// One worker connection: a stream of replies plus its control half. The
/// stream ends when the worker process goes away.
pub struct WorkerLink<W: WorkerControl> {
    pub events: mpsc::Receiver<WorkerMessage>,
    pub control: W,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Regression replay ran out of corpus entries.
    CorpusExhausted,
    /// Fuzz-time budget elapsed since the last coverage growth.
    Deadline,
    /// Worker exited cleanly on a cooperative interrupt.
    Interrupted,
    /// Target crashed (crash reply or signal death).
    Crash,
    /// No reply within the execution deadline.
    Hang,
    /// Worker memory exceeded the configured ceiling.
    ResourceExceeded,
    /// Spawn/channel failure; no artifact is produced for these.
    WorkerError,
}

impl StopReason {
    pub fn exit_code(self) -> i32 {
        match self {
            StopReason::CorpusExhausted | StopReason::Deadline | StopReason::Interrupted => 0,
            _ => 1,
        }
    }
}

#[derive(Debug)]
pub struct CampaignOutcome {
    pub reason: StopReason,
    pub total_executions: u64,
    pub total_coverage: u64,
    pub artifact: Option<PathBuf>,
}

struct InFlight {
    buf: Vec<u8>,
    since: Instant,
}

/// Runs one campaign to a terminal stop condition. The loop is single-task
/// and event-driven; its only suspension points are the worker reply
/// stream and the two periodic timers, so coverage totals and resource
/// samples never need explicit locking.
pub async fn run_campaign<W: WorkerControl, C: Corpus>(
    mut link: WorkerLink<W>,
    corpus: &mut C,
    config: &Config,
) -> CampaignOutcome {
    println!("#0 READ units: {}", corpus.len());

    let mut pulse = time::interval(config.pulse_interval());
    pulse.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sample = time::interval(config.sample_interval());
    sample.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of an interval completes immediately; consume it so
    // the monitors fire one full period from now.
    pulse.tick().await;
    sample.tick().await;

    let mut verse: Option<Verse> = None;
    let mut total_executions: u64 = 0;
    let mut total_coverage: u64 = 0;
    let mut last_growth = Instant::now();
    let mut in_flight: Option<InFlight> = None;
    let mut worker_rss: u64 = 0;
    let mut window = StatsWindow::new();
    let mut stopping: Option<StopReason> = None;
    let mut artifact_path: Option<PathBuf> = None;

    match select_input(corpus, &verse, config, total_executions) {
        Some(buf) => match link.control.dispatch(&buf) {
            Ok(()) => {
                in_flight = Some(InFlight {
                    buf,
                    since: Instant::now(),
                });
            }
            Err(err) => {
                log::error!("worker channel error: {err}");
                let (reason, artifact) =
                    stop_on_worker_exit(link.control.wait_exit(), None, None, config);
                return CampaignOutcome {
                    reason,
                    total_executions,
                    total_coverage,
                    artifact,
                };
            }
        },
        None => {
            println!("corpus exhausted after 0 executions");
            return CampaignOutcome {
                reason: StopReason::CorpusExhausted,
                total_executions,
                total_coverage,
                artifact: None,
            };
        }
    }

    let reason = loop {
        tokio::select! {
            event = link.events.recv() => match event {
                Some(WorkerMessage::Crash) => {
                    total_executions += 1;
                    window.execs += 1;
                    let buf = in_flight.take().map(|w| w.buf).unwrap_or_default();
                    artifact_path = persist_artifact(&buf, config);
                    break StopReason::Crash;
                }
                Some(WorkerMessage::Result { coverage }) => {
                    total_executions += 1;
                    window.execs += 1;
                    let finished = in_flight.take();
                    if coverage > total_coverage {
                        if config.fuzz_time().is_some() {
                            last_growth = Instant::now();
                        }
                        total_coverage = coverage;
                        // Regression replays existing entries; growth there
                        // never admits anything new.
                        if !config.regression {
                            if let Some(work) = &finished {
                                corpus.put_buffer(&work.buf);
                                if config.versifier && !work.buf.is_empty() {
                                    verse = Some(Verse::build(verse.take(), &work.buf));
                                }
                            }
                        }
                        window.emit("NEW", total_executions, total_coverage, corpus.len(), worker_rss);
                    }
                    if stopping.is_none() {
                        match select_input(corpus, &verse, config, total_executions) {
                            Some(buf) => {
                                if let Err(err) = link.control.dispatch(&buf) {
                                    log::error!("worker channel error: {err}");
                                    // The pipe only breaks once the worker is
                                    // gone; its exit status says whether this
                                    // was a crash or a channel fault.
                                    let (reason, artifact) = stop_on_worker_exit(
                                        link.control.wait_exit(),
                                        None,
                                        finished.map(|w| w.buf),
                                        config,
                                    );
                                    artifact_path = artifact;
                                    break reason;
                                }
                                in_flight = Some(InFlight { buf, since: Instant::now() });
                            }
                            None => break StopReason::CorpusExhausted,
                        }
                    }
                }
                None => {
                    let (reason, artifact) = stop_on_worker_exit(
                        link.control.wait_exit(),
                        stopping.take(),
                        in_flight.take().map(|w| w.buf),
                        config,
                    );
                    artifact_path = artifact;
                    break reason;
                }
            },
            _ = pulse.tick() => {
                window.emit("PULSE", total_executions, total_coverage, corpus.len(), worker_rss);
                if let Some(budget) = config.fuzz_time() {
                    if stopping.is_none() && last_growth.elapsed() > budget {
                        println!("=================================================================");
                        println!("fuzz time budget reached. coverage has reached: {total_coverage}");
                        link.control.request_stop();
                        stopping = Some(StopReason::Deadline);
                    }
                }
            }
            _ = sample.tick() => {
                if let Some(rss) = link.control.sample_rss() {
                    worker_rss = rss;
                    if let Some(limit) = config.rss_limit_bytes() {
                        if rss > limit {
                            // No artifact for the in-flight buffer here:
                            // cumulative memory growth is not attributable
                            // to the last input.
                            println!(
                                "MEMORY OOM: exceeded {} MB. killing worker",
                                config.rss_limit_mb
                            );
                            link.control.kill();
                            break StopReason::ResourceExceeded;
                        }
                    }
                }
                if let Some(work) = &in_flight {
                    let elapsed = work.since.elapsed();
                    if elapsed > config.timeout() {
                        println!("=================================================================");
                        println!("timeout reached. testcase took: {} ms", elapsed.as_millis());
                        link.control.kill();
                        let buf = in_flight.take().map(|w| w.buf).unwrap_or_default();
                        artifact_path = persist_artifact(&buf, config);
                        break StopReason::Hang;
                    }
                }
            }
        }
    };

    if reason == StopReason::CorpusExhausted {
        println!("corpus exhausted after {total_executions} executions. coverage: {total_coverage}");
    }
    // Both interval timers and the worker link die with this scope, once,
    // no matter which stop path fired.
    log::debug!("campaign monitors stopped: {reason:?}");

    CampaignOutcome {
        reason,
        total_executions,
        total_coverage,
        artifact: artifact_path,
    }
}

/// Picks the next input. Regression replays the corpus FIFO; fuzz mode
/// draws from the corpus generator except on grammar-cadence executions
/// once a model has been built from at least one admitted buffer.
fn select_input<C: Corpus>(
    corpus: &mut C,
    verse: &Option<Verse>,
    config: &Config,
    total_executions: u64,
) -> Option<Vec<u8>> {
    if config.regression {
        return corpus.shift();
    }
    if total_executions > 0
        && config.versifier
        && config.grammar_cadence > 0
        && total_executions % config.grammar_cadence == 0
    {
        if let Some(verse) = verse {
            return Some(verse.generate());
        }
    }
    Some(corpus.generate_input())
}

/// Maps a worker exit to a stop reason once the channel is gone. Signal
/// deaths count as crashes and persist the buffer whose execution
/// preceded the death, when there is one.
fn stop_on_worker_exit(
    exit: ExitKind,
    stopping: Option<StopReason>,
    crash_buf: Option<Vec<u8>>,
    config: &Config,
) -> (StopReason, Option<PathBuf>) {
    match exit {
        ExitKind::Clean => (stopping.unwrap_or(StopReason::Interrupted), None),
        ExitKind::Signal(signal) => {
            println!("worker killed by signal {signal}");
            let artifact = crash_buf.and_then(|buf| persist_artifact(&buf, config));
            (StopReason::Crash, artifact)
        }
        ExitKind::Code(code) => {
            log::error!("worker exited unexpectedly with status {code}");
            (StopReason::WorkerError, None)
        }
    }
}

fn persist_artifact(buf: &[u8], config: &Config) -> Option<PathBuf> {
    match artifact::write_crash(
        buf,
        &config.artifact_dir,
        config.exact_artifact_path.as_deref(),
    ) {
        Ok(path) => Some(path),
        Err(err) => {
            log::error!("failed to persist crash artifact: {err}");
            None
        }
    }
}

struct StatsWindow {
    last_sample: Instant,
    execs: u64,
}

impl StatsWindow {
    fn new() -> Self {
        Self {
            last_sample: Instant::now(),
            execs: 0,
        }
    }

    fn emit(&mut self, tag: &str, total_executions: u64, coverage: u64, corpus_len: usize, worker_rss: u64) {
        let elapsed_ms = self.last_sample.elapsed().as_millis().max(1) as u64;
        let execs_per_second = self.execs * 1000 / elapsed_ms;
        self.last_sample = Instant::now();
        self.execs = 0;
        let rss_mb = (monitor::self_rss_bytes() + worker_rss) as f64 / 1024.0 / 1024.0;
        println!(
            "#{total_executions} {tag}     cov: {coverage} corp: {corpus_len} exec/s: {execs_per_second} rss: {rss_mb:.2} MB"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedCorpus {
        generated: u64,
    }

    impl Corpus for ScriptedCorpus {
        fn len(&self) -> usize {
            1
        }
        fn shift(&mut self) -> Option<Vec<u8>> {
            Some(b"fifo".to_vec())
        }
        fn generate_input(&mut self) -> Vec<u8> {
            self.generated += 1;
            b"corp".to_vec()
        }
        fn put_buffer(&mut self, _buf: &[u8]) {}
    }

    #[test]
    fn regression_always_shifts() {
        let mut corpus = ScriptedCorpus { generated: 0 };
        let mut config = Config::default();
        config.regression = true;
        config.versifier = true;
        let verse = Some(Verse::build(None, b"model"));
        assert_eq!(
            select_input(&mut corpus, &verse, &config, 10),
            Some(b"fifo".to_vec())
        );
        assert_eq!(corpus.generated, 0);
    }

    #[test]
    fn execution_zero_never_draws_from_the_grammar() {
        let mut corpus = ScriptedCorpus { generated: 0 };
        let mut config = Config::default();
        config.versifier = true;
        let verse = Some(Verse::build(None, b"model"));
        assert_eq!(
            select_input(&mut corpus, &verse, &config, 0),
            Some(b"corp".to_vec())
        );
    }

    #[test]
    fn cadence_executions_draw_from_the_grammar_once_built() {
        let mut corpus = ScriptedCorpus { generated: 0 };
        let mut config = Config::default();
        config.versifier = true;
        let verse = Some(Verse::build(None, b"zzz"));

        let buf = select_input(&mut corpus, &verse, &config, 10).unwrap();
        assert!(buf.iter().all(|b| *b == b'z'));
        assert_eq!(corpus.generated, 0);

        // Off-cadence executions stay on the corpus generator.
        let buf = select_input(&mut corpus, &verse, &config, 11).unwrap();
        assert_eq!(buf, b"corp".to_vec());
    }

    #[test]
    fn cadence_without_a_model_falls_back_to_the_corpus() {
        let mut corpus = ScriptedCorpus { generated: 0 };
        let mut config = Config::default();
        config.versifier = true;
        assert_eq!(
            select_input(&mut corpus, &None, &config, 10),
            Some(b"corp".to_vec())
        );
    }

    #[test]
    fn grammar_disabled_ignores_the_model() {
        let mut corpus = ScriptedCorpus { generated: 0 };
        let config = Config::default();
        let verse = Some(Verse::build(None, b"zzz"));
        assert_eq!(
            select_input(&mut corpus, &verse, &config, 10),
            Some(b"corp".to_vec())
        );
    }

    #[test]
    fn clean_reasons_exit_zero() {
        assert_eq!(StopReason::CorpusExhausted.exit_code(), 0);
        assert_eq!(StopReason::Deadline.exit_code(), 0);
        assert_eq!(StopReason::Interrupted.exit_code(), 0);
        assert_eq!(StopReason::Crash.exit_code(), 1);
        assert_eq!(StopReason::Hang.exit_code(), 1);
        assert_eq!(StopReason::ResourceExceeded.exit_code(), 1);
        assert_eq!(StopReason::WorkerError.exit_code(), 1);
    }
}
