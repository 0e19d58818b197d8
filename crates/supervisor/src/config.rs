//! Supervisor configuration management

use crate::acquisition::RetryPolicy;
use crate::usb::FallbackPolicy;
use anyhow::{Context, Result, anyhow};
use common::{TargetSignature, UsbDescriptor};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub supervisor: SupervisorSettings,
    pub device: DeviceSettings,
    /// Location daemon (gpsd) lifecycle
    #[serde(default)]
    pub daemon: DaemonSettings,
    /// Bounded-retry acquisition
    #[serde(default)]
    pub acquisition: AcquisitionSettings,
    /// Data-flow probe against the daemon's output
    #[serde(default)]
    pub probe: ProbeSettings,
    /// Continuous health watchdog
    #[serde(default)]
    pub watchdog: WatchdogSettings,
    /// Environment hand-off for the telemetry forwarder
    #[serde(default)]
    pub handoff: HandoffSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    pub log_level: String,
}

/// Target hardware and the candidate node namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// USB vendor id, hex (e.g. "091e")
    pub vendor_id: String,
    /// USB product id, hex (e.g. "0003")
    pub product_id: String,
    /// Candidate nodes are `<device_prefix><n>`
    #[serde(default = "DeviceSettings::default_prefix")]
    pub device_prefix: String,
    /// First numeric suffix scanned (inclusive)
    #[serde(default)]
    pub scan_first: u32,
    /// Last numeric suffix scanned (inclusive)
    #[serde(default = "DeviceSettings::default_scan_last")]
    pub scan_last: u32,
    /// Mount point of sysfs
    #[serde(default = "DeviceSettings::default_sysfs_root")]
    pub sysfs_root: PathBuf,
    /// How many parent directories the descriptor walk may climb
    #[serde(default = "DeviceSettings::default_max_depth")]
    pub max_depth: usize,
    /// What to do when no candidate matches the signature
    #[serde(default)]
    pub fallback: FallbackPolicy,
}

impl DeviceSettings {
    fn default_prefix() -> String {
        "/dev/ttyUSB".to_string()
    }

    fn default_scan_last() -> u32 {
        9
    }

    fn default_sysfs_root() -> PathBuf {
        PathBuf::from("/sys")
    }

    fn default_max_depth() -> usize {
        5
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Daemon executable
    #[serde(default = "DaemonSettings::default_program")]
    pub program: String,
    /// Argument template; `{device}` and `{socket}` are substituted at start
    #[serde(default = "DaemonSettings::default_args")]
    pub args: Vec<String>,
    /// Well-known control socket consumed by the telemetry forwarder
    #[serde(default = "DaemonSettings::default_control_socket")]
    pub control_socket: PathBuf,
    /// PID of the managed instance, shared with other supervisor processes
    #[serde(default = "DaemonSettings::default_pid_file")]
    pub pid_file: PathBuf,
    /// Leftover sockets and lock files removed before every start
    #[serde(default = "DaemonSettings::default_stale_paths")]
    pub stale_paths: Vec<PathBuf>,
    /// systemd units that would start a conflicting instance
    #[serde(default = "DaemonSettings::default_competing_units")]
    pub competing_units: Vec<String>,
    /// systemctl executable used to stop/disable competing units
    #[serde(default = "DaemonSettings::default_systemctl")]
    pub systemctl: String,
    /// Seconds between SIGTERM and SIGKILL
    #[serde(default = "DaemonSettings::default_grace")]
    pub grace_secs: u64,
    /// Milliseconds to let a fresh process settle before the liveness check
    #[serde(default = "DaemonSettings::default_settle")]
    pub settle_ms: u64,
    /// Timeout for connecting to the control socket
    #[serde(default = "DaemonSettings::default_socket_timeout")]
    pub socket_timeout_secs: u64,
    /// Timeout for each systemctl invocation
    #[serde(default = "DaemonSettings::default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            program: Self::default_program(),
            args: Self::default_args(),
            control_socket: Self::default_control_socket(),
            pid_file: Self::default_pid_file(),
            stale_paths: Self::default_stale_paths(),
            competing_units: Self::default_competing_units(),
            systemctl: Self::default_systemctl(),
            grace_secs: Self::default_grace(),
            settle_ms: Self::default_settle(),
            socket_timeout_secs: Self::default_socket_timeout(),
            command_timeout_secs: Self::default_command_timeout(),
        }
    }
}

impl DaemonSettings {
    fn default_program() -> String {
        "gpsd".to_string()
    }

    fn default_args() -> Vec<String> {
        // -N keeps gpsd in the foreground so the supervisor owns the process
        ["-N", "-n", "-b", "-F", "{socket}", "{device}"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn default_control_socket() -> PathBuf {
        PathBuf::from("/var/run/gpsd.sock")
    }

    fn default_pid_file() -> PathBuf {
        PathBuf::from("/run/gps-supervisor/gpsd.pid")
    }

    fn default_stale_paths() -> Vec<PathBuf> {
        [
            "/var/run/gpsd.pid",
            "/tmp/gpsd.sock",
            "/run/gpsd.sock",
        ]
        .iter()
        .map(PathBuf::from)
        .collect()
    }

    fn default_competing_units() -> Vec<String> {
        vec!["gpsd.service".to_string(), "gpsd.socket".to_string()]
    }

    fn default_systemctl() -> String {
        "systemctl".to_string()
    }

    fn default_grace() -> u64 {
        3
    }

    fn default_settle() -> u64 {
        3000
    }

    fn default_socket_timeout() -> u64 {
        5
    }

    fn default_command_timeout() -> u64 {
        10
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    #[serde(default = "AcquisitionSettings::default_max_attempts")]
    pub max_attempts: u32,
    /// Wait after the first failed attempt
    #[serde(default = "AcquisitionSettings::default_base_backoff")]
    pub base_backoff_ms: u64,
    /// Upper bound for the doubling backoff
    #[serde(default = "AcquisitionSettings::default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            base_backoff_ms: Self::default_base_backoff(),
            max_backoff_ms: Self::default_max_backoff(),
        }
    }
}

impl AcquisitionSettings {
    fn default_max_attempts() -> u32 {
        5
    }

    fn default_base_backoff() -> u64 {
        2_000
    }

    fn default_max_backoff() -> u64 {
        30_000 // 30 seconds
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// gpsd client port
    #[serde(default = "ProbeSettings::default_address")]
    pub address: String,
    /// Command sent after connecting to start the sentence stream
    #[serde(default = "ProbeSettings::default_watch_command")]
    pub watch_command: String,
    /// Observation window during acquisition
    #[serde(default = "ProbeSettings::default_window")]
    pub window_secs: u64,
    /// Sentences required before data counts as flowing
    #[serde(default = "ProbeSettings::default_min_sentences")]
    pub min_sentences: u32,
    #[serde(default = "ProbeSettings::default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            address: Self::default_address(),
            watch_command: Self::default_watch_command(),
            window_secs: Self::default_window(),
            min_sentences: Self::default_min_sentences(),
            connect_timeout_secs: Self::default_connect_timeout(),
        }
    }
}

impl ProbeSettings {
    fn default_address() -> String {
        "127.0.0.1:2947".to_string()
    }

    fn default_watch_command() -> String {
        r#"?WATCH={"enable":true,"nmea":true}"#.to_string()
    }

    fn default_window() -> u64 {
        5
    }

    fn default_min_sentences() -> u32 {
        1
    }

    fn default_connect_timeout() -> u64 {
        5
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogSettings {
    #[serde(default = "WatchdogSettings::default_check_interval")]
    pub check_interval_secs: u64,
    /// Resets are suppressed for this long after a reset
    #[serde(default = "WatchdogSettings::default_reset_cooldown")]
    pub reset_cooldown_secs: u64,
    /// Observation window for the periodic data-flow check
    #[serde(default = "WatchdogSettings::default_probe_window")]
    pub probe_window_secs: u64,
    /// Acquisition attempts per reset
    #[serde(default = "WatchdogSettings::default_reset_attempts")]
    pub reset_attempts: u32,
    /// Consecutive failed resets before the failure chain is logged as an error
    #[serde(default = "WatchdogSettings::default_failure_alert_threshold")]
    pub failure_alert_threshold: u32,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: Self::default_check_interval(),
            reset_cooldown_secs: Self::default_reset_cooldown(),
            probe_window_secs: Self::default_probe_window(),
            reset_attempts: Self::default_reset_attempts(),
            failure_alert_threshold: Self::default_failure_alert_threshold(),
        }
    }
}

impl WatchdogSettings {
    fn default_check_interval() -> u64 {
        15
    }

    fn default_reset_cooldown() -> u64 {
        30
    }

    fn default_probe_window() -> u64 {
        3
    }

    fn default_reset_attempts() -> u32 {
        3
    }

    fn default_failure_alert_threshold() -> u32 {
        3
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn reset_cooldown(&self) -> Duration {
        Duration::from_secs(self.reset_cooldown_secs)
    }

    pub fn probe_window(&self) -> Duration {
        Duration::from_secs(self.probe_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffSettings {
    /// Environment file rewritten on every successful acquisition
    #[serde(default = "HandoffSettings::default_path")]
    pub path: PathBuf,
}

impl Default for HandoffSettings {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
        }
    }
}

impl HandoffSettings {
    fn default_path() -> PathBuf {
        PathBuf::from("/run/gps-supervisor/device.env")
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorSettings {
                log_level: "info".to_string(),
            },
            device: DeviceSettings {
                vendor_id: "091e".to_string(),
                product_id: "0003".to_string(),
                device_prefix: DeviceSettings::default_prefix(),
                scan_first: 0,
                scan_last: DeviceSettings::default_scan_last(),
                sysfs_root: DeviceSettings::default_sysfs_root(),
                max_depth: DeviceSettings::default_max_depth(),
                fallback: FallbackPolicy::default(),
            },
            daemon: DaemonSettings::default(),
            acquisition: AcquisitionSettings::default(),
            probe: ProbeSettings::default(),
            watchdog: WatchdogSettings::default(),
            handoff: HandoffSettings::default(),
        }
    }
}

impl SupervisorConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_tilde(&p)
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/gps-supervisor/supervisor.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse, expand and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: SupervisorConfig =
            toml::from_str(content).context("Failed to parse configuration")?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("gps-supervisor").join("supervisor.toml")
        } else {
            PathBuf::from(".config/gps-supervisor/supervisor.toml")
        }
    }

    /// The configured target signature
    pub fn signature(&self) -> Result<TargetSignature> {
        let descriptor = UsbDescriptor::from_hex(&self.device.vendor_id, &self.device.product_id)
            .map_err(|e| anyhow!("Invalid device signature: {}", e))?;
        Ok(TargetSignature::single(descriptor))
    }

    fn expand_paths(&mut self) {
        self.device.sysfs_root = expand_tilde(&self.device.sysfs_root);
        self.daemon.control_socket = expand_tilde(&self.daemon.control_socket);
        self.daemon.pid_file = expand_tilde(&self.daemon.pid_file);
        self.handoff.path = expand_tilde(&self.handoff.path);
        for path in &mut self.daemon.stale_paths {
            *path = expand_tilde(path);
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.supervisor.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.supervisor.log_level,
                valid_levels.join(", ")
            ));
        }

        self.signature()?;

        if self.device.device_prefix.is_empty() {
            return Err(anyhow!("device_prefix must not be empty"));
        }
        if self.device.scan_first > self.device.scan_last {
            return Err(anyhow!(
                "Empty scan range: scan_first ({}) > scan_last ({})",
                self.device.scan_first,
                self.device.scan_last
            ));
        }
        if self.device.max_depth == 0 {
            return Err(anyhow!("max_depth must be at least 1"));
        }

        if self.daemon.program.trim().is_empty() {
            return Err(anyhow!("daemon.program must not be empty"));
        }
        if !self.daemon.args.iter().any(|a| a.contains("{device}")) {
            return Err(anyhow!(
                "daemon.args must contain a {{device}} placeholder"
            ));
        }

        if self.acquisition.max_attempts == 0 {
            return Err(anyhow!("acquisition.max_attempts must be at least 1"));
        }
        if self.acquisition.base_backoff_ms > self.acquisition.max_backoff_ms {
            return Err(anyhow!(
                "acquisition.base_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.acquisition.base_backoff_ms,
                self.acquisition.max_backoff_ms
            ));
        }

        if self.probe.min_sentences == 0 {
            return Err(anyhow!("probe.min_sentences must be at least 1"));
        }
        if self.probe.window_secs == 0 || self.watchdog.probe_window_secs == 0 {
            return Err(anyhow!("probe windows must be at least 1 second"));
        }

        if self.watchdog.check_interval_secs == 0 {
            return Err(anyhow!("watchdog.check_interval_secs must be at least 1"));
        }
        if self.watchdog.reset_attempts == 0 {
            return Err(anyhow!("watchdog.reset_attempts must be at least 1"));
        }

        Ok(())
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SupervisorConfig::default();
        assert_eq!(config.supervisor.log_level, "info");
        assert_eq!(config.device.device_prefix, "/dev/ttyUSB");
        assert_eq!(config.daemon.program, "gpsd");
        assert_eq!(config.device.fallback, FallbackPolicy::Strict);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_signature() {
        let config = SupervisorConfig::default();
        let signature = config.signature().unwrap();
        assert!(signature.matches(&UsbDescriptor::new(0x091e, 0x0003)));
    }

    #[test]
    fn test_config_serialization() {
        let config = SupervisorConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed = SupervisorConfig::from_toml(&toml_str).unwrap();

        assert_eq!(config.device.vendor_id, parsed.device.vendor_id);
        assert_eq!(config.daemon.args, parsed.daemon.args);
        assert_eq!(config.watchdog.reset_cooldown_secs, parsed.watchdog.reset_cooldown_secs);
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = SupervisorConfig::default();
        config.supervisor.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.supervisor.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SupervisorConfig::default();
        config.device.vendor_id = "xyz".to_string();
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.device.scan_first = 5;
        config.device.scan_last = 2;
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.acquisition.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.daemon.args = vec!["-N".to_string()];
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.acquisition.base_backoff_ms = 60_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tilde_expansion() {
        let expanded = expand_tilde(Path::new("/var/run/gpsd.sock"));
        assert_eq!(expanded, PathBuf::from("/var/run/gpsd.sock"));

        if let Some(home) = dirs::home_dir() {
            let expanded = expand_tilde(Path::new("~/gps/device.env"));
            assert_eq!(expanded, home.join("gps/device.env"));
        }
    }
}
