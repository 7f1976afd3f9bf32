//! # Camera Monitor Core Library
//!
//! Continuous discovery and capability tracking for video-capture devices.
//! The crate fuses kernel udev events, periodic reconciliation scans, and
//! configured remote sources into a single
//! consistent device map, and fans resulting camera events out to
//! registered consumers through a bounded worker pool. It is the source of
//! truth for "which cameras are usable, what they can do, and when that
//! changed" for the streaming and RPC layers built on top of it.
//!
//! ## Crate Structure
//!
//! - **`monitor`**: The [`monitor::HybridCameraMonitor`] orchestrator:
//!   lifecycle, readiness, reconcile loop, statistics, snapshot capture.
//! - **`registry`**: Authoritative path→record map with the device status
//!   state machine and in-flight probe markers.
//! - **`probe`**: Capability probing with retry/backoff and synthesized
//!   records for non-USB sources.
//! - **`parser`**: Total parsers for the capability-query utility output.
//! - **`command`**: External command execution with timeout, cancellation,
//!   and error classification.
//! - **`checker`**: Device path existence predicate.
//! - **`pool`**: Bounded worker pool with per-task deadlines and panic
//!   capture.
//! - **`source`**: Kernel device event subscription (udev on Linux, no-op
//!   elsewhere) with a bounded drop-oldest buffer.
//! - **`dispatch`**: Handler/callback/notifier fan-out.
//! - **`device`**: The shared data model (records, statuses, events).
//! - **`config`**: Figment-based configuration with env overrides.
//! - **`stats`**: Atomic statistics counters and gauges.
//! - **`snapshot`**: Direct snapshot capture records and argument
//!   construction.
//! - **`telemetry`**: Tracing initialization.
//! - **`error`**: The crate error types.

pub mod checker;
pub mod command;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod monitor;
pub mod parser;
pub mod pool;
pub mod probe;
pub mod registry;
pub mod snapshot;
pub mod source;
pub mod stats;
pub mod telemetry;

pub use config::MonitorConfig;
pub use device::{CameraDevice, CameraEvent, CameraEventKind, DeviceStatus};
pub use error::{ExecError, MonitorError, MonitorResult};
pub use monitor::HybridCameraMonitor;
