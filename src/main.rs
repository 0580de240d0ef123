use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use anglerfuzz::config::Config;
use anglerfuzz::corpus::InMemoryCorpus;
use anglerfuzz::manager;
use anglerfuzz::runner::{process, worker};
use anglerfuzz::targets;

#[derive(Parser)]
#[command(
    name = "anglerfuzz",
    about = "coverage-guided fuzzing harness with a process-isolated worker"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a fuzzing campaign against a registered target.
    Fuzz {
        /// Name of the registered fuzz target.
        target: String,
        /// Seed corpus directories.
        #[arg(long = "corpus", value_name = "DIR")]
        corpus_dirs: Vec<PathBuf>,
        /// Hard memory ceiling for the worker, in MB. 0 disables it.
        #[arg(long, default_value_t = 2048)]
        rss_limit_mb: u64,
        /// Max wall time for a single execution, in seconds.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
        /// Stop this long after the last coverage growth, in seconds. 0 = unbounded.
        #[arg(long, default_value_t = 0)]
        fuzz_time: u64,
        /// Replay the corpus deterministically instead of generating inputs.
        #[arg(long)]
        regression: bool,
        /// Restrict synthesized inputs to printable ASCII.
        #[arg(long)]
        only_ascii: bool,
        /// Enable periodic grammar-model draws.
        #[arg(long)]
        versifier: bool,
        /// Every n-th execution draws from the grammar model.
        #[arg(long, default_value_t = 10)]
        grammar_cadence: u64,
        /// Write the crash artifact to this exact path instead of a hash name.
        #[arg(long)]
        exact_artifact_path: Option<PathBuf>,
        /// Directory hash-named crash artifacts are written to.
        #[arg(long, default_value = ".")]
        artifact_dir: PathBuf,
    },
    /// Worker-process entry point; spawned by the manager.
    #[command(hide = true)]
    Worker { target: String },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Worker { target } => exit_code(worker::run(&target)),
        Command::Fuzz {
            target,
            corpus_dirs,
            rss_limit_mb,
            timeout,
            fuzz_time,
            regression,
            only_ascii,
            versifier,
            grammar_cadence,
            exact_artifact_path,
            artifact_dir,
        } => {
            if targets::get_target(&target).is_none() {
                eprintln!("unknown fuzz target `{target}`");
                return ExitCode::from(2);
            }
            let config = Config {
                exact_artifact_path,
                artifact_dir,
                rss_limit_mb,
                timeout_secs: timeout,
                fuzz_time_secs: fuzz_time,
                regression,
                only_ascii,
                versifier,
                grammar_cadence,
                ..Config::default()
            };
            match run_fuzz(&target, &corpus_dirs, &config) {
                Ok(code) => code,
                Err(err) => {
                    eprintln!("{err:?}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn run_fuzz(target: &str, corpus_dirs: &[PathBuf], config: &Config) -> Result<ExitCode> {
    // A terminal SIGINT goes to the whole process group. The manager
    // ignores it and lets the worker's cooperative shutdown drive a clean
    // stop; the worker re-installs its own handler after exec.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
    }

    let seeds = load_seeds(corpus_dirs)?;
    log::info!(
        "loaded {} seed buffers from {} directories",
        seeds.len(),
        corpus_dirs.len()
    );
    let mut corpus = InMemoryCorpus::new(seeds, config.only_ascii);

    let link = process::spawn_worker(target, config)?;
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let outcome = rt.block_on(manager::run_campaign(link, &mut corpus, config));
    log::info!(
        "campaign stopped: {:?} after {} executions, coverage {}",
        outcome.reason,
        outcome.total_executions,
        outcome.total_coverage
    );
    Ok(exit_code(outcome.reason.exit_code()))
}

fn load_seeds(dirs: &[PathBuf]) -> Result<Vec<Vec<u8>>> {
    let mut paths = Vec::new();
    for dir in dirs {
        for entry in fs::read_dir(dir)
            .with_context(|| format!("failed to read corpus directory {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() {
                paths.push(path);
            }
        }
    }
    // Directory order is arbitrary; regression replay should be stable.
    paths.sort();
    paths
        .iter()
        .map(|path| {
            fs::read(path).with_context(|| format!("failed to read seed {}", path.display()))
        })
        .collect()
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(code.clamp(0, u8::MAX as i32) as u8)
}
