//! Monitor configuration.
//!
//! Strongly-typed configuration loaded from a TOML file merged with
//! `CAMERA_MONITOR_`-prefixed environment variables. All durations accept
//! humantime strings (`"500ms"`, `"2s"`, `"1m"`). `validate()` catches the
//! values that would make the monitor misbehave silently.
//!
//! Hot updates flow through `HybridCameraMonitor::handle_configuration_update`;
//! the next reconcile cycle picks the new values up, in-flight probes
//! finish under the values they started with.

use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::device::{CameraSource, SourceKind};

/// Numeric device index range, expanded to `/dev/video{lo..=hi}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRange {
    pub lo: u32,
    pub hi: u32,
}

impl Default for DeviceRange {
    fn default() -> Self {
        Self { lo: 0, hi: 9 }
    }
}

/// One configured non-USB camera input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    /// Device path or URL.
    pub source: String,
    #[serde(default)]
    pub description: String,
}

/// Top-level monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// USB probe space.
    #[serde(default)]
    pub device_range: DeviceRange,

    /// Initial poll interval; the adaptive loop moves it within
    /// `[min_poll_interval, max_poll_interval]` afterwards.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Gate on the initial discovery pass at startup.
    #[serde(default = "default_detection_timeout", with = "humantime_serde")]
    pub detection_timeout: Duration,

    /// When false, no external utility is invoked and every USB device
    /// gets a synthesized record.
    #[serde(default = "default_true")]
    pub enable_capability_detection: bool,

    /// Per-probe invocation timeout.
    #[serde(default = "default_capability_timeout", with = "humantime_serde")]
    pub capability_timeout: Duration,

    /// Delay between probe retries (linear backoff base).
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub capability_retry_interval: Duration,

    #[serde(default = "default_max_retries")]
    pub capability_max_retries: u32,

    #[serde(default = "default_min_poll_interval", with = "humantime_serde")]
    pub min_poll_interval: Duration,

    #[serde(default = "default_max_poll_interval", with = "humantime_serde")]
    pub max_poll_interval: Duration,

    /// How long a `Disconnected` record lingers before it is purged.
    /// `None` resolves to twice the current poll interval.
    #[serde(default, with = "humantime_serde")]
    pub disconnect_grace: Option<Duration>,

    /// Kernel event buffer bound; overflow drops the oldest event.
    #[serde(default = "default_event_buffer_capacity")]
    pub event_buffer_capacity: usize,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_task_queue_size")]
    pub task_queue_size: usize,

    /// Per-pool-task deadline (probes and handler dispatch).
    #[serde(default = "default_task_timeout", with = "humantime_serde")]
    pub task_timeout: Duration,

    /// Drain deadline used by the binary when stopping the monitor.
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,

    /// External capability-query utility.
    #[serde(default = "default_device_command")]
    pub device_command: String,

    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Logging format (pretty, compact, json).
    #[serde(default = "default_log_format")]
    pub log_format: String,

    #[serde(default)]
    pub ip_camera_sources: Vec<SourceEntry>,

    #[serde(default)]
    pub file_sources: Vec<SourceEntry>,

    #[serde(default)]
    pub generic_sources: Vec<SourceEntry>,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_detection_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_capability_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_retries() -> u32 {
    3
}

fn default_min_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_max_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_event_buffer_capacity() -> usize {
    256
}

fn default_max_workers() -> usize {
    4
}

fn default_task_queue_size() -> usize {
    64
}

fn default_task_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_device_command() -> String {
    "v4l2-ctl".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            device_range: DeviceRange::default(),
            poll_interval: default_poll_interval(),
            detection_timeout: default_detection_timeout(),
            enable_capability_detection: true,
            capability_timeout: default_capability_timeout(),
            capability_retry_interval: default_retry_interval(),
            capability_max_retries: default_max_retries(),
            min_poll_interval: default_min_poll_interval(),
            max_poll_interval: default_max_poll_interval(),
            disconnect_grace: None,
            event_buffer_capacity: default_event_buffer_capacity(),
            max_workers: default_max_workers(),
            task_queue_size: default_task_queue_size(),
            task_timeout: default_task_timeout(),
            stop_timeout: default_stop_timeout(),
            device_command: default_device_command(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            ip_camera_sources: Vec::new(),
            file_sources: Vec::new(),
            generic_sources: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Load from `config/monitor.toml` and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/monitor.toml")
    }

    /// Load from a specific file path merged with `CAMERA_MONITOR_` env
    /// overrides (e.g. `CAMERA_MONITOR_POLL_INTERVAL=250ms`).
    pub fn load_from<P: AsRef<std::path::Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CAMERA_MONITOR_"))
            .extract()
    }

    /// Reject configurations the monitor cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.device_range.lo > self.device_range.hi {
            return Err(format!(
                "device_range lo {} exceeds hi {}",
                self.device_range.lo, self.device_range.hi
            ));
        }
        if self.min_poll_interval > self.max_poll_interval {
            return Err(format!(
                "min_poll_interval {:?} exceeds max_poll_interval {:?}",
                self.min_poll_interval, self.max_poll_interval
            ));
        }
        if self.max_workers == 0 {
            return Err("max_workers must be at least 1".to_string());
        }
        if self.task_queue_size == 0 {
            return Err("task_queue_size must be at least 1".to_string());
        }
        if self.event_buffer_capacity == 0 {
            return Err("event_buffer_capacity must be at least 1".to_string());
        }
        if self.device_command.trim().is_empty() {
            return Err("device_command must not be empty".to_string());
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(format!(
                "invalid log_level '{}'; must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }
        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.log_format.as_str()) {
            return Err(format!(
                "invalid log_format '{}'; must be one of: {}",
                self.log_format,
                valid_formats.join(", ")
            ));
        }
        Ok(())
    }

    /// The USB portion of the expected path space.
    pub fn usb_paths(&self) -> Vec<String> {
        (self.device_range.lo..=self.device_range.hi)
            .map(|index| format!("/dev/video{index}"))
            .collect()
    }

    /// All configured non-USB sources with their kinds attached.
    pub fn sources(&self) -> Vec<CameraSource> {
        let mut sources = Vec::new();
        for entry in &self.ip_camera_sources {
            sources.push(CameraSource {
                kind: SourceKind::Network,
                source: entry.source.clone(),
                description: entry.description.clone(),
            });
        }
        for entry in &self.file_sources {
            sources.push(CameraSource {
                kind: SourceKind::File,
                source: entry.source.clone(),
                description: entry.description.clone(),
            });
        }
        for entry in &self.generic_sources {
            sources.push(CameraSource {
                kind: SourceKind::Generic,
                source: entry.source.clone(),
                description: entry.description.clone(),
            });
        }
        sources
    }

    /// Grace period before a `Disconnected` record is purged.
    pub fn effective_disconnect_grace(&self, current_poll: Duration) -> Duration {
        self.disconnect_grace.unwrap_or(current_poll * 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = MonitorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.device_range, DeviceRange { lo: 0, hi: 9 });
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert!(config.enable_capability_detection);
        assert_eq!(config.device_command, "v4l2-ctl");
    }

    #[test]
    fn parses_full_toml() {
        let toml_str = r#"
            poll_interval = "250ms"
            min_poll_interval = "100ms"
            max_poll_interval = "5s"
            capability_timeout = "2s"
            capability_max_retries = 2
            device_command = "v4l2-ctl"
            disconnect_grace = "3s"

            [device_range]
            lo = 0
            hi = 3

            [[ip_camera_sources]]
            source = "rtsp://cam.local/stream"
            description = "lobby camera"

            [[file_sources]]
            source = "/tmp/test.mp4"
        "#;
        let config: MonitorConfig = toml::from_str(toml_str).expect("parse");
        assert!(config.validate().is_ok());
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.disconnect_grace, Some(Duration::from_secs(3)));
        assert_eq!(config.usb_paths().len(), 4);

        let sources = config.sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].kind, SourceKind::Network);
        assert_eq!(sources[1].kind, SourceKind::File);
        assert!(sources[1].description.is_empty());
    }

    #[test]
    fn rejects_inverted_ranges() {
        let mut config = MonitorConfig::default();
        config.device_range = DeviceRange { lo: 5, hi: 2 };
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.min_poll_interval = Duration::from_secs(10);
        config.max_poll_interval = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_bounds() {
        let mut config = MonitorConfig::default();
        config.max_workers = 0;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.task_queue_size = 0;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.device_command = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn grace_defaults_to_twice_poll_interval() {
        let config = MonitorConfig::default();
        assert_eq!(
            config.effective_disconnect_grace(Duration::from_millis(500)),
            Duration::from_secs(1)
        );

        let mut config = MonitorConfig::default();
        config.disconnect_grace = Some(Duration::from_secs(7));
        assert_eq!(
            config.effective_disconnect_grace(Duration::from_millis(500)),
            Duration::from_secs(7)
        );
    }
}
