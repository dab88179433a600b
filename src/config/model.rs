use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct NexusConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub logs: LogsConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_controller_port() -> u16 {
    5010
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".nexus")
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ControllerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_controller_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_controller_port(),
            data_dir: default_data_dir(),
        }
    }
}

/// An inclusive port band, written as `[start, end]` in TOML.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct PortRange(pub u16, pub u16);

impl PortRange {
    pub fn start(&self) -> u16 {
        self.0
    }

    pub fn end(&self) -> u16 {
        self.1
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.0 && port <= self.1
    }

    pub fn iter(&self) -> std::ops::RangeInclusive<u16> {
        self.0..=self.1
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.0, self.1)
    }
}

fn default_range_start() -> u16 {
    3000
}

fn default_range_end() -> u16 {
    3999
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PortsConfig {
    /// Address used when probing whether a port is bound.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_range_start")]
    pub range_start: u16,
    #[serde(default = "default_range_end")]
    pub range_end: u16,
    /// Per-category bands, e.g. `web = [3000, 3199]`.
    #[serde(default)]
    pub ranges: BTreeMap<String, PortRange>,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            range_start: default_range_start(),
            range_end: default_range_end(),
            ranges: BTreeMap::new(),
        }
    }
}

impl PortsConfig {
    pub fn default_range(&self) -> PortRange {
        PortRange(self.range_start, self.range_end)
    }
}

fn default_log_max_bytes() -> u64 {
    5 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LogsConfig {
    /// Defaults to `<data_dir>/logs`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_log_max_bytes")]
    pub max_bytes: u64,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_bytes: default_log_max_bytes(),
        }
    }
}

fn default_grace_ms() -> u64 {
    5000
}

fn default_kill_timeout_ms() -> u64 {
    3000
}

fn default_startup_probe_ms() -> u64 {
    500
}

fn default_stop_command_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProcessConfig {
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
    #[serde(default = "default_startup_probe_ms")]
    pub startup_probe_ms: u64,
    #[serde(default = "default_stop_command_timeout_ms")]
    pub stop_command_timeout_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
            kill_timeout_ms: default_kill_timeout_ms(),
            startup_probe_ms: default_startup_probe_ms(),
            stop_command_timeout_ms: default_stop_command_timeout_ms(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_auto_start() -> bool {
    true
}

fn default_sweep_interval_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SupervisorConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
    /// 0 disables the background sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            auto_start: default_auto_start(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl NexusConfig {
    /// Make relative `data_dir` and `logs.dir` absolute against `base`.
    pub fn anchor_paths(&mut self, base: &Path) {
        if self.controller.data_dir.is_relative() {
            self.controller.data_dir = base.join(&self.controller.data_dir);
        }
        if let Some(dir) = &self.logs.dir {
            if dir.is_relative() {
                self.logs.dir = Some(base.join(dir));
            }
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.logs
            .dir
            .clone()
            .unwrap_or_else(|| self.controller.data_dir.join("logs"))
    }

    pub fn registry_path(&self) -> PathBuf {
        self.controller.data_dir.join("services.json")
    }
}
