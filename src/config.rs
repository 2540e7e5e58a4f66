use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::clock::{Nanos, NSEC_PER_MSEC, NSEC_PER_USEC};
use crate::error::Error;

/// Longest supported run: one hour of 1 ms ticks fills the sample arena.
pub const MAX_DURATION_SECS: u64 = 3600;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/rtbench.toml";

/// Longest accepted period or busy-spin: ten seconds.
pub const MAX_INTERVAL_US: u64 = 10_000_000;

/// Largest accepted task stack, in KiB (1 GiB).
pub const MAX_STACK_KB: i64 = 1 << 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Board {
    /// BeagleBone Black
    Bbb,
    /// i.MX6Q
    Imx6,
    /// Raspberry Pi 3
    Rpi3,
    /// Zynq-7000
    Zynq,
    /// No board prefix
    #[default]
    Generic,
}

impl Board {
    /// Prefix of every result file name.
    pub fn prefix(self) -> &'static str {
        match self {
            Board::Bbb => "bbb_",
            Board::Imx6 => "imx6_",
            Board::Rpi3 => "rpi3_",
            Board::Zynq => "zynq_",
            Board::Generic => "",
        }
    }
}

/// Timing and scheduling parameters of one benchmark task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    pub priority: i32,
    pub period_us: u64,
    /// Busy-spin per tick.
    pub work_us: u64,
    /// Spin granularity; each slice is one acquire/release under exclusive
    /// mechanisms.
    pub slice_us: u64,
    pub stack_kb: i64,
}

impl TaskConfig {
    pub fn high() -> Self {
        Self {
            priority: 99,
            period_us: 1_000,
            work_us: 500,
            slice_us: 500,
            stack_kb: 256,
        }
    }

    pub fn low() -> Self {
        Self {
            priority: 50,
            period_us: 5_000,
            work_us: 1_500,
            slice_us: 100,
            stack_kb: 256,
        }
    }

    pub fn period(&self) -> Nanos {
        self.period_us.saturating_mul(NSEC_PER_USEC)
    }

    pub fn work(&self) -> Nanos {
        self.work_us.saturating_mul(NSEC_PER_USEC)
    }

    pub fn slice(&self) -> Nanos {
        self.slice_us.saturating_mul(NSEC_PER_USEC)
    }

    fn validate(&mut self) {
        self.priority = self.priority.clamp(1, 99);
        self.period_us = self.period_us.clamp(100, MAX_INTERVAL_US);
        self.work_us = self.work_us.min(MAX_INTERVAL_US);
        self.slice_us = self.slice_us.clamp(1, self.work_us.max(1));
        self.stack_kb = self.stack_kb.clamp(-MAX_STACK_KB, MAX_STACK_KB);
    }
}

/// `[high]` / `[low]` table; unset keys keep the role's defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskSection {
    pub priority: Option<i32>,
    pub period_us: Option<u64>,
    pub work_us: Option<u64>,
    pub slice_us: Option<u64>,
    pub stack_kb: Option<i64>,
}

impl TaskSection {
    pub fn over(&self, base: TaskConfig) -> TaskConfig {
        TaskConfig {
            priority: self.priority.unwrap_or(base.priority),
            period_us: self.period_us.unwrap_or(base.period_us),
            work_us: self.work_us.unwrap_or(base.work_us),
            slice_us: self.slice_us.unwrap_or(base.slice_us),
            stack_kb: self.stack_kb.unwrap_or(base.stack_kb),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub duration: u64,
    pub board: Board,
    pub results_dir: PathBuf,
    pub realtime: bool,
    pub oscilloscope: bool,
    pub lock_memory: bool,
    pub start_delay_ms: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            duration: 3,
            board: Board::Generic,
            results_dir: PathBuf::from("./results"),
            realtime: true,
            oscilloscope: false,
            lock_memory: true,
            start_delay_ms: 1_000,
        }
    }
}

impl BenchConfig {
    pub fn start_delay(&self) -> Nanos {
        self.start_delay_ms * NSEC_PER_MSEC
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub benchmark: BenchConfig,
    pub high: TaskSection,
    pub low: TaskSection,
}

/// Fully resolved settings: defaults, then file, then CLI, then clamped.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bench: BenchConfig,
    pub high: TaskConfig,
    pub low: TaskConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Config::default().resolve()
    }
}

impl Config {
    pub fn resolve(&self) -> Settings {
        Settings {
            bench: self.benchmark.clone(),
            high: self.high.over(TaskConfig::high()),
            low: self.low.over(TaskConfig::low()),
        }
    }
}

impl Settings {
    /// Clamp fields to valid ranges. A zero duration is left for the run
    /// configuration to reject.
    pub fn validate(&mut self) {
        if self.bench.duration > MAX_DURATION_SECS {
            log::warn!(
                "maximum test duration is {} seconds for a 1 ms periodic task, using {} seconds",
                MAX_DURATION_SECS,
                MAX_DURATION_SECS,
            );
            self.bench.duration = MAX_DURATION_SECS;
        }
        self.bench.start_delay_ms = self.bench.start_delay_ms.clamp(1, 10_000);
        self.high.validate();
        self.low.validate();
    }
}

/// Load configuration from a TOML file.
///
/// - If `explicit_path` is `Some` and the file is missing, returns an error.
/// - If `explicit_path` is `None`, tries `/etc/rtbench.toml`; if missing, returns defaults.
pub fn load_config(explicit_path: Option<&Path>) -> Result<Config, Error> {
    let path = match explicit_path {
        Some(p) => {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    p.display()
                )));
            }
            p.to_path_buf()
        }
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if !default.exists() {
                return Ok(Config::default());
            }
            default.to_path_buf()
        }
    };

    let contents = std::fs::read_to_string(&path).map_err(|e| {
        Error::Config(format!("failed to read config {}: {}", path.display(), e))
    })?;

    let config: Config = toml::from_str(&contents).map_err(|e| {
        Error::Config(format!("failed to parse config {}: {}", path.display(), e))
    })?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_values() {
        let s = Settings::default();
        assert_eq!(s.bench.duration, 3);
        assert_eq!(s.bench.board, Board::Generic);
        assert!(s.bench.realtime);
        assert!(!s.bench.oscilloscope);
        assert_eq!(s.bench.start_delay(), 1_000 * NSEC_PER_MSEC);
        assert_eq!(s.high, TaskConfig::high());
        assert_eq!(s.low, TaskConfig::low());
        assert_eq!(s.high.period(), NSEC_PER_MSEC);
        assert_eq!(s.low.slice(), 100 * NSEC_PER_USEC);
    }

    #[test]
    fn test_duration_above_one_hour_is_clamped() {
        let mut s = Settings::default();
        s.bench.duration = 7_200;
        s.validate();
        assert_eq!(s.bench.duration, MAX_DURATION_SECS);
    }

    #[test]
    fn test_validate_clamps_tasks() {
        let mut s = Settings::default();
        s.high.priority = 150;
        s.high.period_us = 10;
        s.low.priority = 0;
        s.low.slice_us = 10_000;
        s.bench.start_delay_ms = 0;
        s.validate();
        assert_eq!(s.high.priority, 99);
        assert_eq!(s.high.period_us, 100);
        assert_eq!(s.low.priority, 1);
        assert_eq!(s.low.slice_us, s.low.work_us);
        assert_eq!(s.bench.start_delay_ms, 1);
    }

    #[test]
    fn test_validate_bounds_huge_values() {
        let mut s = Settings::default();
        s.high.period_us = u64::MAX;
        s.high.work_us = u64::MAX;
        s.high.slice_us = u64::MAX;
        s.low.stack_kb = i64::MIN;
        s.validate();
        assert_eq!(s.high.period_us, MAX_INTERVAL_US);
        assert_eq!(s.high.work_us, MAX_INTERVAL_US);
        assert_eq!(s.high.slice_us, MAX_INTERVAL_US);
        assert_eq!(s.low.stack_kb, -MAX_STACK_KB);
        assert_eq!(s.high.period(), MAX_INTERVAL_US * NSEC_PER_USEC);

        // Unvalidated values saturate instead of overflowing.
        let raw = TaskConfig {
            period_us: u64::MAX,
            ..TaskConfig::high()
        };
        assert_eq!(raw.period(), u64::MAX);
    }

    #[test]
    fn test_board_prefix() {
        assert_eq!(Board::Rpi3.prefix(), "rpi3_");
        assert_eq!(Board::Generic.prefix(), "");
    }

    #[test]
    fn test_toml_parsing() {
        let dir = std::env::temp_dir();
        let path = dir.join("rtbench_test_config.toml");
        {
            let mut f = std::fs::File::create(&path).unwrap();
            write!(
                f,
                r#"
[benchmark]
duration = 10
board = "zynq"
realtime = false

[low]
priority = 40
"#
            )
            .unwrap();
        }
        let settings = load_config(Some(&path)).unwrap().resolve();
        assert_eq!(settings.bench.duration, 10);
        assert_eq!(settings.bench.board, Board::Zynq);
        assert!(!settings.bench.realtime);
        assert_eq!(settings.low.priority, 40);
        // Unset keys keep the low task's own defaults
        assert_eq!(settings.low.period_us, 5_000);
        assert_eq!(settings.high, TaskConfig::high());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_explicit_config_errors() {
        let path = std::path::Path::new("/tmp/rtbench_nonexistent_config.toml");
        let result = load_config(Some(path));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
