//! Hybrid camera monitor orchestration.
//!
//! [`HybridCameraMonitor`] composes the checker, executor, prober,
//! registry, worker pool, dispatcher, and kernel event source into one
//! long-running subsystem. Two producers feed discovery (the udev event
//! stream and the periodic reconcile scan) and both funnel into a single
//! task, so transitions for any one device path are totally ordered.
//! Probes run as pool tasks; their completions commit to the registry and
//! hand events to the dispatcher from the committing task, and the
//! dispatcher's per-path lanes keep delivery to each consumer in that
//! per-path order even with several pool workers executing at once.
//!
//! The poll interval adapts: clean cycles widen it by 1.1× up to the
//! configured maximum, cycles with failures halve it down to the minimum,
//! so a flapping or broken device is retried quickly while a quiet system
//! costs few syscalls.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checker::{DeviceChecker, StatDeviceChecker};
use crate::command::{CommandExecutor, V4l2Executor};
use crate::config::MonitorConfig;
use crate::device::{
    device_index_from_path, CameraDevice, CameraEvent, CameraEventKind, DeviceEvent,
    DeviceEventKind, DeviceStatus, SourceKind,
};
use crate::dispatch::{CameraEventHandler, EventCallback, EventDispatcher, EventNotifier};
use crate::error::{MonitorError, MonitorResult};
use crate::pool::{PoolConfig, PoolTask, WorkerPool};
use crate::probe::{CapabilityProber, ProbeOutcome};
use crate::registry::{ChangeKind, DeviceRegistry};
use crate::snapshot::{build_capture_args, DirectSnapshot, SnapshotMetadata, SnapshotOptions};
use crate::source::{default_event_source, DeviceEventSource};
use crate::stats::{MonitorStats, StatsSnapshot};

/// Shared state reachable from the reconciler and probe tasks.
struct MonitorCore {
    config: Arc<RwLock<MonitorConfig>>,
    stats: Arc<MonitorStats>,
    registry: Arc<DeviceRegistry>,
    pool: Arc<WorkerPool>,
    dispatcher: Arc<EventDispatcher>,
    prober: Arc<CapabilityProber>,
    checker: Arc<dyn DeviceChecker>,
    executor: Arc<dyn CommandExecutor>,
    event_source: Arc<dyn DeviceEventSource>,
    ready_tx: watch::Sender<bool>,
}

struct MonitorRuntime {
    cancel: CancellationToken,
    reconciler: JoinHandle<()>,
}

/// Public facade over the monitoring subsystem.
pub struct HybridCameraMonitor {
    core: Arc<MonitorCore>,
    running: AtomicBool,
    runtime: Mutex<Option<MonitorRuntime>>,
}

impl HybridCameraMonitor {
    /// Build a monitor with the production checker, executor, and kernel
    /// event source.
    pub fn new(config: MonitorConfig) -> Self {
        let stats = Arc::new(MonitorStats::default());
        let event_source = default_event_source(Arc::clone(&stats), config.event_buffer_capacity);
        let executor: Arc<dyn CommandExecutor> =
            Arc::new(V4l2Executor::new(config.device_command.clone()));
        Self::assemble(config, Arc::new(StatDeviceChecker), executor, event_source, stats)
    }

    /// Build a monitor with injected dependencies (tests, other platforms).
    pub fn with_dependencies(
        config: MonitorConfig,
        checker: Arc<dyn DeviceChecker>,
        executor: Arc<dyn CommandExecutor>,
        event_source: Arc<dyn DeviceEventSource>,
    ) -> Self {
        let stats = Arc::new(MonitorStats::default());
        Self::assemble(config, checker, executor, event_source, stats)
    }

    fn assemble(
        config: MonitorConfig,
        checker: Arc<dyn DeviceChecker>,
        executor: Arc<dyn CommandExecutor>,
        event_source: Arc<dyn DeviceEventSource>,
        stats: Arc<MonitorStats>,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new(Arc::clone(&stats)));
        let pool = Arc::new(WorkerPool::new(PoolConfig {
            max_workers: config.max_workers,
            queue_size: config.task_queue_size,
            task_timeout: config.task_timeout,
        }));
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&pool), Arc::clone(&stats)));
        let config = Arc::new(RwLock::new(config));
        let prober = Arc::new(CapabilityProber::new(
            Arc::clone(&checker),
            Arc::clone(&executor),
            Arc::clone(&registry),
            Arc::clone(&stats),
            Arc::clone(&config),
        ));
        let (ready_tx, _ready_rx) = watch::channel(false);

        Self {
            core: Arc::new(MonitorCore {
                config,
                stats,
                registry,
                pool,
                dispatcher,
                prober,
                checker,
                executor,
                event_source,
                ready_tx,
            }),
            running: AtomicBool::new(false),
            runtime: Mutex::new(None),
        }
    }

    /// Start the monitor: worker pool, kernel subscription (best effort),
    /// and the reconcile loop with its seed discovery pass.
    pub async fn start(&self) -> MonitorResult<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MonitorError::AlreadyRunning);
        }

        if let Err(err) = self.core.pool.start().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(err);
        }

        if let Err(err) = self.core.event_source.start().await {
            warn!(error = %err, "kernel event subscription unavailable, relying on polling");
        }

        let cancel = CancellationToken::new();
        let reconciler = tokio::spawn(reconcile_loop(Arc::clone(&self.core), cancel.clone()));
        *self.runtime.lock().await = Some(MonitorRuntime { cancel, reconciler });
        info!("camera monitor started");
        Ok(())
    }

    /// Stop the monitor, draining in-flight work within `deadline`.
    ///
    /// Stopping a monitor that is not running is a no-op.
    pub async fn stop(&self, deadline: Duration) -> MonitorResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(runtime) = self.runtime.lock().await.take() {
            runtime.cancel.cancel();
            self.core.event_source.close().await;
            if tokio::time::timeout(deadline, runtime.reconciler)
                .await
                .is_err()
            {
                warn!("reconciler did not exit within the stop deadline");
            }
        }

        self.core.pool.stop(deadline).await?;
        let _ = self.core.ready_tx.send(false);
        info!("camera monitor stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True once the first reconcile pass has completed this lifecycle.
    pub fn is_ready(&self) -> bool {
        *self.core.ready_tx.borrow()
    }

    /// Readiness channel: yields `true` once the first reconcile finishes;
    /// late subscribers observe the value immediately.
    pub fn subscribe_to_readiness(&self) -> watch::Receiver<bool> {
        self.core.ready_tx.subscribe()
    }

    /// Block until ready or until `detection_timeout` elapses.
    pub async fn wait_until_ready(&self) -> bool {
        let timeout = self.core.config.read().await.detection_timeout;
        let mut ready_rx = self.subscribe_to_readiness();
        let result = tokio::time::timeout(timeout, ready_rx.wait_for(|ready| *ready)).await;
        matches!(result, Ok(Ok(_)))
    }

    /// Snapshot of currently connected cameras.
    pub async fn connected_cameras(&self) -> HashMap<String, CameraDevice> {
        self.core.registry.connected().await
    }

    pub async fn get_device(&self, path: &str) -> Option<CameraDevice> {
        self.core.registry.get(path).await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Pool statistics, handler counts, and registry gauges in one map.
    pub async fn resource_stats(&self) -> serde_json::Value {
        let snapshot = self.core.stats.snapshot();
        serde_json::json!({
            "worker_pool": self.core.pool.stats(),
            "active_event_handlers": self.core.dispatcher.active_handlers().await,
            "known_devices": snapshot.known_devices,
            "connected_devices": snapshot.connected_devices,
        })
    }

    pub async fn add_event_handler(&self, handler: Arc<dyn CameraEventHandler>) {
        self.core.dispatcher.add_handler(handler).await;
    }

    pub async fn add_event_callback(&self, callback: EventCallback) {
        self.core.dispatcher.add_callback(callback).await;
    }

    pub async fn set_event_notifier(&self, notifier: Option<Arc<dyn EventNotifier>>) {
        self.core.dispatcher.set_notifier(notifier).await;
    }

    /// Apply a configuration update atomically.
    ///
    /// The next reconcile cycle uses the new device range, intervals, and
    /// retry parameters; in-flight probes finish under the old values.
    pub async fn handle_configuration_update(&self, new_config: MonitorConfig) -> MonitorResult<()> {
        new_config.validate().map_err(MonitorError::Configuration)?;
        let mut config = self.core.config.write().await;
        info!(
            device_range = ?new_config.device_range,
            poll_interval = ?new_config.poll_interval,
            capability_detection = new_config.enable_capability_detection,
            "applying configuration update"
        );
        *config = new_config;
        Ok(())
    }

    /// Capture one frame straight to `output_path` via the external tool.
    pub async fn take_direct_snapshot(
        &self,
        cancel: &CancellationToken,
        device: &str,
        output_path: &str,
        options: SnapshotOptions,
    ) -> MonitorResult<DirectSnapshot> {
        if !self.is_running() {
            return Err(MonitorError::NotRunning);
        }

        let timeout = self.core.config.read().await.capability_timeout;
        let argv = build_capture_args(device, output_path, &options);
        // execute() emits the leading --device pair from its own device
        // argument; pass the tokens after the helper's copy so the child
        // sees the pair exactly once.
        let args = argv[2..].join(" ");
        let started = std::time::Instant::now();
        self.core
            .executor
            .execute(cancel, device, &args, timeout)
            .await?;
        let capture_duration_ms = started.elapsed().as_millis() as u64;
        let size_bytes = tokio::fs::metadata(output_path).await?.len();

        info!(device, output_path, size_bytes, capture_duration_ms, "direct snapshot captured");
        Ok(DirectSnapshot {
            device: device.to_string(),
            output_path: output_path.to_string(),
            pixel_format: options.pixel_format,
            width: options.width,
            height: options.height,
            size_bytes,
            created_at: Utc::now(),
            metadata: SnapshotMetadata {
                tier_used: 0,
                method: "v4l2_direct".to_string(),
                capture_duration_ms,
            },
        })
    }
}

/// Grow on clean cycles, shrink on failures, always clamped.
fn adapt_interval(current: Duration, clean: bool, min: Duration, max: Duration) -> Duration {
    let factor = if clean { 1.1 } else { 0.5 };
    let next = current.as_secs_f64() * factor;
    Duration::from_secs_f64(next.clamp(min.as_secs_f64(), max.as_secs_f64()))
}

async fn reconcile_loop(core: Arc<MonitorCore>, cancel: CancellationToken) {
    let mut interval = {
        let config = core.config.read().await;
        config
            .poll_interval
            .clamp(config.min_poll_interval, config.max_poll_interval)
    };
    core.stats.set_poll_interval(interval);
    let mut source_active = core.event_source.started();
    let mut first_cycle = true;

    loop {
        let failures = run_reconcile(&core, &cancel, interval).await;
        MonitorStats::incr(&core.stats.polling_cycles);

        let (min, max) = {
            let config = core.config.read().await;
            (config.min_poll_interval, config.max_poll_interval)
        };
        interval = adapt_interval(interval, failures == 0, min, max);
        core.stats.set_poll_interval(interval);

        if first_cycle {
            first_cycle = false;
            let _ = core.ready_tx.send(true);
            info!("seed discovery complete, monitor ready");
        }

        let wake_at = tokio::time::Instant::now() + interval;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(wake_at) => break,
                event = core.event_source.recv(), if source_active => match event {
                    Some(event) => handle_device_event(&core, event).await,
                    None => source_active = false,
                },
            }
        }
    }
}

/// One pass over the expected path space. Returns the failure count that
/// drives the adaptive interval.
async fn run_reconcile(
    core: &Arc<MonitorCore>,
    cancel: &CancellationToken,
    interval: Duration,
) -> u32 {
    let (usb_paths, sources, grace) = {
        let config = core.config.read().await;
        (
            config.usb_paths(),
            config.sources(),
            config.effective_disconnect_grace(interval),
        )
    };
    let mut failures = 0u32;

    let mut expected: HashSet<String> = usb_paths.iter().cloned().collect();
    expected.extend(sources.iter().map(|s| s.source.clone()));

    for path in &usb_paths {
        if cancel.is_cancelled() {
            return failures;
        }
        match core.registry.get(path).await {
            None => {
                // New paths must be real character devices before probing.
                if core.checker.is_char_device(path).await
                    && !schedule_probe(core, path.clone(), None).await
                {
                    failures += 1;
                }
            }
            Some(record) => match record.status {
                DeviceStatus::Connected => {
                    if !core.checker.exists(path).await {
                        mark_disconnected(core, path).await;
                    }
                }
                DeviceStatus::Error => {
                    // Retry window: a broken device is reprobed every cycle
                    // and keeps the interval at its tight end meanwhile.
                    failures += 1;
                    if core.checker.exists(path).await
                        && !schedule_probe(core, path.clone(), None).await
                    {
                        failures += 1;
                    }
                }
                DeviceStatus::Disconnected => {
                    // Reappeared within the grace period: probe afresh.
                    if core.checker.exists(path).await
                        && !schedule_probe(core, path.clone(), None).await
                    {
                        failures += 1;
                    }
                }
                DeviceStatus::Probing => {}
            },
        }
    }

    for source in &sources {
        if cancel.is_cancelled() {
            return failures;
        }
        let path = source.source.as_str();
        let needs_probe = match core.registry.get(path).await {
            None => true,
            Some(record) => match record.status {
                DeviceStatus::Error => {
                    failures += 1;
                    true
                }
                DeviceStatus::Connected if source.kind == SourceKind::File => {
                    if !core.checker.exists(path).await {
                        mark_disconnected(core, path).await;
                    }
                    false
                }
                DeviceStatus::Disconnected if source.kind == SourceKind::File => {
                    core.checker.exists(path).await
                }
                _ => false,
            },
        };
        if needs_probe {
            match core.prober.probe_source(source).await {
                Ok(outcome) => emit_probe_outcome(core, outcome).await,
                Err(err) => {
                    failures += 1;
                    error!(path, error = %err, "source probe rejected by registry");
                }
            }
        }
    }

    purge_stale(core, &expected, grace).await;
    failures
}

/// Age out records whose paths left the expected space or whose
/// disconnect grace elapsed.
async fn purge_stale(core: &Arc<MonitorCore>, expected: &HashSet<String>, grace: Duration) {
    let now = Utc::now();
    for (path, record) in core.registry.snapshot().await {
        let in_expected = expected.contains(&path);
        let age = now
            .signed_duration_since(record.last_seen)
            .to_std()
            .unwrap_or_default();
        let stale = age > grace;

        match record.status {
            DeviceStatus::Disconnected if stale => {
                debug!(path = %path, "purging disconnected device after grace period");
                core.registry.remove(&path).await;
            }
            DeviceStatus::Connected if !in_expected && stale => {
                // Left the configured space (range shrank); removal event
                // first, purge on a later pass.
                mark_disconnected(core, &path).await;
            }
            DeviceStatus::Error if stale => {
                let gone = !in_expected || !core.checker.exists(&path).await;
                if gone {
                    debug!(path = %path, "purging stale error device");
                    core.registry.remove(&path).await;
                }
            }
            _ => {}
        }
    }
}

/// USB identity strings reported by the kernel alongside an event.
#[derive(Clone)]
struct DeviceIdentity {
    vendor: Option<String>,
    product: Option<String>,
    serial: Option<String>,
}

impl DeviceIdentity {
    fn from_event(event: &DeviceEvent) -> Option<Self> {
        if event.vendor.is_none() && event.product.is_none() && event.serial.is_none() {
            return None;
        }
        Some(Self {
            vendor: event.vendor.clone(),
            product: event.product.clone(),
            serial: event.serial.clone(),
        })
    }
}

/// Queue a probe task; false means the pool rejected it.
///
/// `identity` carries kernel-reported vendor/product/serial strings that
/// the probe pipeline itself cannot observe; they are merged into the
/// committed record before events go out.
async fn schedule_probe(
    core: &Arc<MonitorCore>,
    path: String,
    identity: Option<DeviceIdentity>,
) -> bool {
    let task_core = Arc::clone(core);
    let label = format!("probe:{path}");
    let task = PoolTask::new(label, move |token| {
        async move {
            match task_core.prober.probe(&token, &path).await {
                Ok(mut outcome) => {
                    if let (
                        Some(identity),
                        ProbeOutcome::Completed { device, .. },
                    ) = (&identity, &mut outcome)
                    {
                        device.vendor = identity.vendor.clone();
                        device.product = identity.product.clone();
                        device.serial = identity.serial.clone();
                        // Identity is outside structural equality, so this
                        // re-commit never produces a spurious event.
                        task_core.registry.update_full(device.clone()).await;
                    }
                    emit_probe_outcome(&task_core, outcome).await;
                }
                Err(err) => {
                    // Programmer error in registry use; absorbed.
                    error!(path = %path, error = %err, "probe rejected by registry");
                }
            }
            Ok(())
        }
        .boxed()
    });

    match core.pool.submit(task).await {
        Ok(()) => true,
        Err(err) => {
            MonitorStats::incr(&core.stats.polling_failures);
            warn!(error = %err, "could not schedule probe");
            false
        }
    }
}

/// Translate a committed probe result into camera events.
async fn emit_probe_outcome(core: &Arc<MonitorCore>, outcome: ProbeOutcome) {
    let ProbeOutcome::Completed {
        prior,
        change,
        device,
    } = outcome
    else {
        return;
    };

    match device.status {
        DeviceStatus::Connected => {
            if prior != Some(DeviceStatus::Connected) {
                MonitorStats::incr(&core.stats.device_state_changes);
                info!(path = %device.path, name = %device.name, "camera connected");
                emit_event(core, CameraEventKind::Connected, device.clone()).await;
                emit_event(core, CameraEventKind::CapabilityDetected, device).await;
            } else if change == ChangeKind::UpdatedMaterial {
                MonitorStats::incr(&core.stats.device_state_changes);
                info!(path = %device.path, "camera capabilities changed");
                emit_event(core, CameraEventKind::StatusChanged, device.clone()).await;
                emit_event(core, CameraEventKind::CapabilityDetected, device).await;
            }
        }
        DeviceStatus::Error => {
            if prior != Some(DeviceStatus::Error) {
                MonitorStats::incr(&core.stats.device_state_changes);
                warn!(path = %device.path, error = ?device.error, "camera probe failed");
                emit_event(core, CameraEventKind::CapabilityError, device).await;
            }
        }
        DeviceStatus::Probing | DeviceStatus::Disconnected => {}
    }
}

async fn mark_disconnected(core: &Arc<MonitorCore>, path: &str) {
    match core
        .registry
        .apply_transition(path, DeviceStatus::Disconnected)
        .await
    {
        Ok(_prior) => {
            MonitorStats::incr(&core.stats.device_state_changes);
            info!(path, "camera disconnected");
            if let Some(device) = core.registry.get(path).await {
                emit_event(core, CameraEventKind::Disconnected, device).await;
            }
        }
        Err(err) => error!(path, error = %err, "failed to mark device disconnected"),
    }
}

async fn emit_event(core: &Arc<MonitorCore>, kind: CameraEventKind, device: CameraDevice) {
    let event = CameraEvent {
        kind,
        path: device.path.clone(),
        timestamp: Utc::now(),
        device,
    };
    core.dispatcher.dispatch(event).await;
}

/// Route one kernel event through the serialized processing path.
async fn handle_device_event(core: &Arc<MonitorCore>, event: DeviceEvent) {
    debug!(kind = ?event.kind, path = %event.path, "kernel device event");

    let in_range = {
        let config = core.config.read().await;
        device_index_from_path(&event.path)
            .map(|index| index >= config.device_range.lo && index <= config.device_range.hi)
            .unwrap_or(false)
    };

    match event.kind {
        DeviceEventKind::Add => {
            if !in_range || core.registry.contains(&event.path).await {
                // Already discovered by the scan, or outside the probe
                // space; either way one connected event is enough.
                MonitorStats::incr(&core.stats.udev_events_skipped);
                return;
            }
            let identity = DeviceIdentity::from_event(&event);
            schedule_probe(core, event.path, identity).await;
        }
        DeviceEventKind::Remove => match core.registry.get(&event.path).await {
            Some(record) if record.status == DeviceStatus::Connected => {
                mark_disconnected(core, &event.path).await;
            }
            _ => MonitorStats::incr(&core.stats.udev_events_skipped),
        },
        DeviceEventKind::Change => match core.registry.get(&event.path).await {
            Some(record) if record.status == DeviceStatus::Connected => {
                // Re-probe: begin_probe commits Connected -> Probing.
                let identity = DeviceIdentity::from_event(&event);
                schedule_probe(core, event.path, identity).await;
            }
            _ => MonitorStats::incr(&core.stats.udev_events_skipped),
        },
    }
}
