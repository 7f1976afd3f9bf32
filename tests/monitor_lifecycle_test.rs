//! Integration tests for monitor lifecycle behavior.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use camera_monitor::checker::DeviceChecker;
use camera_monitor::command::CommandExecutor;
use camera_monitor::config::{DeviceRange, MonitorConfig};
use camera_monitor::device::{CameraEvent, DeviceStatus};
use camera_monitor::dispatch::CameraEventHandler;
use camera_monitor::error::{ExecError, MonitorError};
use camera_monitor::monitor::HybridCameraMonitor;
use camera_monitor::source::NoopEventSource;

const INFO_DUMP: &str = "Driver name     : uvcvideo\n\
                         Card type       : USB 2.0 Camera\n\
                         Bus info        : usb-0000:00:14.0-1\n\
                         Driver version  : 5.15.0\n\
                         Capabilities    : Video Capture Streaming 0x85200001\n";

const FORMAT_DUMP: &str = "[0]: 'YUYV' (YUYV 4:2:2)\n\
                           \tSize: Discrete 640x480\n\
                           \t\tInterval: Discrete 0.033s (30.000 fps)\n";

/// Checker over a shared, test-mutable set of present paths.
#[derive(Clone, Default)]
struct MutableChecker {
    present: Arc<Mutex<HashSet<String>>>,
}

impl MutableChecker {
    fn add(&self, path: &str) {
        self.present.lock().unwrap().insert(path.to_string());
    }
}

#[async_trait]
impl DeviceChecker for MutableChecker {
    async fn exists(&self, path: &str) -> bool {
        self.present.lock().unwrap().contains(path)
    }

    async fn is_char_device(&self, path: &str) -> bool {
        self.exists(path).await
    }
}

/// Executor that answers the standard dumps for every device.
struct HappyExecutor;

#[async_trait]
impl CommandExecutor for HappyExecutor {
    async fn execute(
        &self,
        _cancel: &CancellationToken,
        _device_path: &str,
        args: &str,
        _timeout: Duration,
    ) -> Result<String, ExecError> {
        if args.contains("--all") {
            Ok(INFO_DUMP.to_string())
        } else {
            Ok(FORMAT_DUMP.to_string())
        }
    }
}

#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<CameraEvent>>,
}

#[async_trait]
impl CameraEventHandler for RecordingHandler {
    async fn handle_event(&self, event: &CameraEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn fast_config() -> MonitorConfig {
    let mut config = MonitorConfig::default();
    config.device_range = DeviceRange { lo: 0, hi: 3 };
    config.poll_interval = Duration::from_millis(100);
    config.min_poll_interval = Duration::from_millis(50);
    config.max_poll_interval = Duration::from_millis(500);
    config.detection_timeout = Duration::from_secs(2);
    config.capability_timeout = Duration::from_millis(500);
    config.capability_retry_interval = Duration::from_millis(10);
    config.capability_max_retries = 2;
    config.task_timeout = Duration::from_secs(2);
    config
}

fn build_monitor(checker: MutableChecker) -> HybridCameraMonitor {
    HybridCameraMonitor::with_dependencies(
        fast_config(),
        Arc::new(checker),
        Arc::new(HappyExecutor),
        Arc::new(NoopEventSource::default()),
    )
}

#[tokio::test]
async fn lifecycle_smoke() {
    let monitor = build_monitor(MutableChecker::default());

    assert!(!monitor.is_running());
    assert!(!monitor.is_ready());

    monitor.start().await.expect("start");
    assert!(monitor.is_running());

    assert!(monitor.wait_until_ready().await, "first reconcile must gate readiness");
    assert!(monitor.is_ready());
    assert!(monitor.stats().polling_cycles >= 1);

    monitor.stop(Duration::from_secs(1)).await.expect("stop");
    assert!(!monitor.is_running());
    assert!(!monitor.is_ready());
}

#[tokio::test]
async fn stop_is_idempotent_even_when_never_started() {
    let monitor = build_monitor(MutableChecker::default());
    assert!(monitor.stop(Duration::from_secs(1)).await.is_ok());
    assert!(monitor.stop(Duration::from_secs(1)).await.is_ok());

    monitor.start().await.expect("start");
    monitor.stop(Duration::from_secs(1)).await.expect("stop");
    assert!(monitor.stop(Duration::from_secs(1)).await.is_ok());
}

#[tokio::test]
async fn second_start_reports_already_running() {
    let monitor = build_monitor(MutableChecker::default());
    monitor.start().await.expect("first start");
    assert!(matches!(
        monitor.start().await,
        Err(MonitorError::AlreadyRunning)
    ));
    monitor.stop(Duration::from_secs(1)).await.expect("stop");
}

#[tokio::test]
async fn readiness_fires_once_and_late_subscribers_see_it() {
    let monitor = build_monitor(MutableChecker::default());
    let mut early = monitor.subscribe_to_readiness();
    assert!(!*early.borrow());

    monitor.start().await.expect("start");
    tokio::time::timeout(Duration::from_secs(2), early.wait_for(|ready| *ready))
        .await
        .expect("readiness within deadline")
        .expect("channel open");

    // A subscription after the fact observes the value immediately.
    let late = monitor.subscribe_to_readiness();
    assert!(*late.borrow());

    monitor.stop(Duration::from_secs(1)).await.expect("stop");
}

#[tokio::test]
async fn discovered_device_becomes_connected() {
    let checker = MutableChecker::default();
    checker.add("/dev/video0");
    let monitor = build_monitor(checker);

    let handler = Arc::new(RecordingHandler::default());
    monitor.add_event_handler(handler.clone()).await;

    monitor.start().await.expect("start");
    assert!(monitor.wait_until_ready().await);

    // Probes run on the pool; give the commit a few cycles.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let connected = monitor.connected_cameras().await;
    assert_eq!(connected.len(), 1);
    let device = connected.get("/dev/video0").expect("device present");
    assert_eq!(device.status, DeviceStatus::Connected);
    assert_eq!(device.name, "USB 2.0 Camera");
    assert_eq!(device.capabilities.driver_name, "uvcvideo");
    assert_eq!(device.formats.len(), 1);

    let stats = monitor.stats();
    assert!(stats.probes_attempted >= 1);
    assert_eq!(stats.probes_successful, 1);
    assert_eq!(stats.connected_devices, 1);

    monitor.stop(Duration::from_secs(1)).await.expect("stop");

    let events = handler.events.lock().unwrap();
    assert!(
        events
            .iter()
            .any(|e| e.kind == camera_monitor::device::CameraEventKind::Connected),
        "handler should observe the connected event"
    );
}

#[tokio::test]
async fn resource_stats_exposes_pool_and_handlers() {
    let monitor = build_monitor(MutableChecker::default());
    monitor
        .add_event_handler(Arc::new(RecordingHandler::default()))
        .await;
    monitor
        .add_event_callback(Arc::new(|_event: &CameraEvent| {}))
        .await;

    monitor.start().await.expect("start");
    let stats = monitor.resource_stats().await;
    assert_eq!(stats["active_event_handlers"], 2);
    assert!(stats["worker_pool"]["max_workers"].as_u64().unwrap() >= 1);
    monitor.stop(Duration::from_secs(1)).await.expect("stop");
}

#[tokio::test]
async fn get_device_returns_none_for_unknown_path() {
    let monitor = build_monitor(MutableChecker::default());
    monitor.start().await.expect("start");
    assert!(monitor.wait_until_ready().await);
    assert!(monitor.get_device("/dev/video9").await.is_none());
    monitor.stop(Duration::from_secs(1)).await.expect("stop");
}
