use std::path::PathBuf;
use std::time::Duration;

/// Campaign configuration. Defaults mirror the CLI defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Overrides the hash-derived crash artifact filename when set.
    pub exact_artifact_path: Option<PathBuf>,
    /// Directory crash artifacts are written to.
    pub artifact_dir: PathBuf,
    /// Hard memory ceiling for the worker, in MB. 0 disables the ceiling.
    pub rss_limit_mb: u64,
    /// Max wall time for a single execution, in seconds.
    pub timeout_secs: u64,
    /// Campaign stops this long after the last coverage growth. 0 = unbounded.
    pub fuzz_time_secs: u64,
    /// Replay the corpus FIFO instead of generating new inputs.
    pub regression: bool,
    /// Restrict synthesized inputs to printable ASCII.
    pub only_ascii: bool,
    /// Enable periodic grammar-model draws.
    pub versifier: bool,
    /// Every n-th execution draws from the grammar model (when enabled).
    pub grammar_cadence: u64,
    /// Interval between periodic stats lines.
    pub pulse_interval_ms: u64,
    /// Interval between resource samples. Timeout and OOM enforcement
    /// granularity is bounded by this, not by the configured thresholds.
    pub sample_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exact_artifact_path: None,
            artifact_dir: PathBuf::from("."),
            rss_limit_mb: 2048,
            timeout_secs: 30,
            fuzz_time_secs: 0,
            regression: false,
            only_ascii: false,
            versifier: false,
            grammar_cadence: 10,
            pulse_interval_ms: 3000,
            sample_interval_ms: 3000,
        }
    }
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn fuzz_time(&self) -> Option<Duration> {
        (self.fuzz_time_secs != 0).then(|| Duration::from_secs(self.fuzz_time_secs))
    }

    pub fn rss_limit_bytes(&self) -> Option<u64> {
        (self.rss_limit_mb != 0).then(|| self.rss_limit_mb * 1024 * 1024)
    }

    pub fn pulse_interval(&self) -> Duration {
        Duration::from_millis(self.pulse_interval_ms.max(1))
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }
}
