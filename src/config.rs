use std::{fmt, fs, path::Path, path::PathBuf, str::FromStr, time::Duration};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::GpioError;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    #[serde(rename = "in")]
    Input,
    #[serde(rename = "out")]
    Output,
}

impl Direction {
    /// Sysfs `direction` text. Output with a known initial level is written as
    /// `high`/`low` so the line never floats before its first value write.
    pub fn as_sysfs(&self, initial_level: Option<bool>) -> &'static str {
        match (self, initial_level) {
            (Direction::Input, _) => "in",
            (Direction::Output, None) => "out",
            (Direction::Output, Some(true)) => "high",
            (Direction::Output, Some(false)) => "low",
        }
    }
}

impl FromStr for Direction {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "in" => Ok(Direction::Input),
            "out" | "high" | "low" => Ok(Direction::Output),
            other => Err(GpioError::InvalidDirection(format!(
                "unrecognized direction {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sysfs(None))
    }
}

/// Decodes the single-character `0`/`1` encoding used by `value` and `active_low`.
pub fn parse_level(s: &str) -> Result<bool, GpioError> {
    match s.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(GpioError::InvalidValue(format!(
            "unexpected level {other:?}"
        ))),
    }
}

pub fn level_str(level: bool) -> &'static str {
    if level { "1" } else { "0" }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Sysfs,
    Dummy,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WatchMode {
    /// External notification tool when present, polling otherwise.
    #[default]
    Auto,
    Poll,
    Notify,
}

/// What happens when a polarity or value write to the backend fails.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WritePolicy {
    Strict,
    /// Log the failure and carry on; callers verify by read-back if they care.
    #[default]
    BestEffort,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SysfsConfig {
    #[serde(default = "default_gpio_root")]
    pub gpio_root: PathBuf,
    #[serde(default = "default_inotifywait_path")]
    pub inotifywait_path: PathBuf,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for SysfsConfig {
    fn default() -> Self {
        Self {
            gpio_root: default_gpio_root(),
            inotifywait_path: default_inotifywait_path(),
            settle_delay_ms: default_settle_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PinConfig {
    pub name: String,
    pub line: u32,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub export: bool,
    #[serde(default)]
    pub unexport: bool,
    pub direction: Option<Direction>,
    pub active_low: Option<bool>,
    pub initial_value: Option<bool>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_pulse_ms")]
    pub assertion_ms: u64,
    #[serde(default = "default_pulse_ms")]
    pub deassertion_ms: u64,
    #[serde(default)]
    pub watch: WatchMode,
    #[serde(default)]
    pub write_policy: WritePolicy,
    #[serde(default)]
    pub auto_open: bool,
    #[serde(default)]
    pub raise_events: bool,
}

/// Immutable per-pin settings handed to the pin and everything it owns.
#[derive(Debug, Clone)]
pub struct PinOptions {
    pub export: bool,
    pub unexport: bool,
    pub debounce: Duration,
    pub assertion: Duration,
    pub deassertion: Duration,
    pub watch: WatchMode,
    pub write_policy: WritePolicy,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub inotifywait_path: PathBuf,
}

impl Default for PinOptions {
    fn default() -> Self {
        PinOptions::new(
            &PinConfig {
                name: String::new(),
                line: 0,
                backend: BackendKind::default(),
                export: false,
                unexport: false,
                direction: None,
                active_low: None,
                initial_value: None,
                debounce_ms: default_debounce_ms(),
                assertion_ms: default_pulse_ms(),
                deassertion_ms: default_pulse_ms(),
                watch: WatchMode::default(),
                write_policy: WritePolicy::default(),
                auto_open: false,
                raise_events: false,
            },
            &SysfsConfig::default(),
        )
    }
}

impl PinOptions {
    pub fn new(pin: &PinConfig, sysfs: &SysfsConfig) -> Self {
        Self {
            export: pin.export,
            unexport: pin.unexport,
            debounce: Duration::from_millis(pin.debounce_ms),
            assertion: Duration::from_millis(pin.assertion_ms),
            deassertion: Duration::from_millis(pin.deassertion_ms),
            watch: pin.watch,
            write_policy: pin.write_policy,
            poll_interval: Duration::from_millis(sysfs.poll_interval_ms.max(1)),
            settle_delay: Duration::from_millis(sysfs.settle_delay_ms),
            inotifywait_path: sysfs.inotifywait_path.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    #[serde(default)]
    pub sysfs: SysfsConfig,
    pub gpios: FxHashMap<u32, PinConfig>,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        serde_json::from_str(&contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))
    }
}

fn default_gpio_root() -> PathBuf {
    PathBuf::from("/sys/class/gpio")
}

fn default_inotifywait_path() -> PathBuf {
    PathBuf::from("/usr/bin/inotifywait")
}

fn default_settle_delay_ms() -> u64 {
    500
}

fn default_poll_interval_ms() -> u64 {
    1
}

fn default_debounce_ms() -> u64 {
    5
}

fn default_pulse_ms() -> u64 {
    1
}

fn default_broadcast_capacity() -> usize {
    64
}

fn default_event_history_capacity() -> usize {
    32
}
