//! Direct snapshot capture records.
//!
//! Tier 0 is the fastest capture path: the external utility writes one
//! frame straight to disk, no media server involved. This module holds the
//! pure argument construction and the metadata records; the monitor owns
//! the invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Requested capture parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotOptions {
    pub pixel_format: String,
    pub width: i32,
    pub height: i32,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            pixel_format: "MJPG".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Capture-path metadata attached to every direct snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Tier 0 marks the direct (no media-server) path.
    pub tier_used: u8,
    pub method: String,
    pub capture_duration_ms: u64,
}

/// Result of a completed direct capture.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectSnapshot {
    pub device: String,
    pub output_path: String,
    pub pixel_format: String,
    pub width: i32,
    pub height: i32,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub metadata: SnapshotMetadata,
}

/// Build the ordered capture argument list for the external utility.
///
/// The list always carries the device path (as the leading `--device`
/// pair), the output path, and the pixel-format token. Width and height
/// are emitted as given; the utility rejects nonsense values itself.
pub fn build_capture_args(
    device: &str,
    output_path: &str,
    options: &SnapshotOptions,
) -> Vec<String> {
    vec![
        "--device".to_string(),
        device.to_string(),
        format!(
            "--set-fmt-video=width={},height={},pixelformat={}",
            options.width, options.height, options.pixel_format
        ),
        "--stream-mmap".to_string(),
        "--stream-count=1".to_string(),
        format!("--stream-to={output_path}"),
    ]
}
