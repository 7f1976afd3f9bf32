//! Core data model for discovered camera devices.
//!
//! Everything downstream consumers see (RPC layer, WebSocket notifier,
//! snapshot capture) is expressed in terms of these records. They are all
//! serde-serializable so the notifier can publish them verbatim.
//!
//! Records handed out by the registry are deep copies; nothing in this
//! module shares interior state with the monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a tracked device.
///
/// Legal transitions form a small state machine enforced by the registry:
/// a device enters as `Probing`, settles into `Connected` or `Error`, and
/// leaves through `Disconnected` before being purged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceStatus {
    /// Probed successfully and usable.
    Connected,
    /// Previously connected, now absent; purged after the grace period.
    Disconnected,
    /// Probe exhausted its retries (see `CameraDevice::error`).
    Error,
    /// A capability probe is in flight.
    Probing,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Connected => write!(f, "CONNECTED"),
            DeviceStatus::Disconnected => write!(f, "DISCONNECTED"),
            DeviceStatus::Error => write!(f, "ERROR"),
            DeviceStatus::Probing => write!(f, "PROBING"),
        }
    }
}

/// Driver-level capability block parsed from the query utility output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub driver_name: String,
    pub card_name: String,
    pub bus_info: String,
    pub version: String,
    /// Raw capability tokens and hex flag literals, whitespace-split.
    pub capabilities: Vec<String>,
    pub device_caps: Vec<String>,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            driver_name: "unknown".to_string(),
            card_name: "Unknown Video Device".to_string(),
            bus_info: String::new(),
            version: String::new(),
            capabilities: Vec::new(),
            device_caps: Vec::new(),
        }
    }
}

/// One (pixel format, width, height) triple with its aggregated frame rates.
///
/// Frame rates are kept as the strings captured from the utility output
/// (e.g. `"30.000"`); aggregation never re-formats them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFormat {
    pub pixel_format: String,
    pub width: u32,
    pub height: u32,
    pub frame_rates: Vec<String>,
}

/// Authoritative record for one device path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraDevice {
    /// Canonical path, the stable identifier (`/dev/video0`, an RTSP URL, …).
    pub path: String,
    /// Human-readable name (card name for USB devices, description otherwise).
    pub name: String,
    pub capabilities: DeviceCapabilities,
    pub formats: Vec<DeviceFormat>,
    pub status: DeviceStatus,
    pub last_seen: DateTime<Utc>,
    /// Numeric index extracted from `/dev/videoN` paths.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_num: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
}

impl CameraDevice {
    /// Minimal record for a path whose probe has just been scheduled.
    pub fn probing(path: &str) -> Self {
        Self {
            path: path.to_string(),
            name: String::new(),
            capabilities: DeviceCapabilities::default(),
            formats: Vec::new(),
            status: DeviceStatus::Probing,
            last_seen: Utc::now(),
            device_num: device_index_from_path(path),
            error: None,
            vendor: None,
            product: None,
            serial: None,
        }
    }

    /// Structural equality used for change detection.
    ///
    /// Compares name, capabilities, formats, and status; `last_seen` and
    /// the udev identity strings are deliberately excluded so a refresh
    /// that observes nothing new classifies as timestamp-only.
    pub fn same_shape(&self, other: &CameraDevice) -> bool {
        self.name == other.name
            && self.capabilities == other.capabilities
            && self.formats == other.formats
            && self.status == other.status
    }
}

/// Extract the numeric index from a `/dev/videoN`-style path.
pub fn device_index_from_path(path: &str) -> Option<u32> {
    let digits: String = path
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.chars().rev().collect::<String>().parse().ok()
}

/// Kind of a configured (non-discovered) camera input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    V4l2,
    Network,
    File,
    Generic,
}

/// A configured input descriptor.
///
/// USB-class (`v4l2`) sources go through the full probe pipeline; the other
/// kinds get synthesized records with [`default_source_formats`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraSource {
    pub kind: SourceKind,
    /// Device path or URL.
    pub source: String,
    #[serde(default)]
    pub description: String,
}

/// Default format list attached to synthesized non-USB records.
pub fn default_source_formats() -> Vec<DeviceFormat> {
    vec![
        DeviceFormat {
            pixel_format: "YUYV".to_string(),
            width: 640,
            height: 480,
            frame_rates: vec!["30.000".to_string(), "25.000".to_string()],
        },
        DeviceFormat {
            pixel_format: "MJPG".to_string(),
            width: 1280,
            height: 720,
            frame_rates: vec![
                "30.000".to_string(),
                "25.000".to_string(),
                "15.000".to_string(),
            ],
        },
    ]
}

/// Kernel-originated add/remove/change notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceEventKind {
    Add,
    Remove,
    Change,
}

/// One event from the kernel subscription layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Kind of an emitted camera event, mapped onto the notifier interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraEventKind {
    Connected,
    Disconnected,
    StatusChanged,
    CapabilityDetected,
    CapabilityError,
}

/// Notification emitted after a registry transition has been committed.
///
/// Carries a snapshot of the record as it was at commit time; handlers can
/// hold onto it without observing later mutations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraEvent {
    pub kind: CameraEventKind,
    pub path: String,
    pub timestamp: DateTime<Utc>,
    pub device: CameraDevice,
}
