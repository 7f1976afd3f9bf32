//! Camera event fan-out.
//!
//! The dispatcher owns the registered handlers, plain callbacks, and the
//! optional external notifier. Events are queued into a per-path lane, and
//! one worker-pool task per active lane drains the queue in order, so the
//! sequence of events delivered to any consumer for a given path matches
//! the order `dispatch` was called for that path, no matter how many pool
//! workers are running. Lanes for distinct paths drain on separate tasks
//! and proceed in parallel up to pool concurrency.
//!
//! Within a lane, handlers run one after another with panic isolation; a
//! failing or panicking handler is logged, charged to the pool's failure
//! counter, and the remaining consumers still run. If the pool rejects a
//! lane's drain task the lane's backlog is dropped and counted in
//! `device_events_dropped`; the reconciler never blocks on fan-out.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::RwLock;
use tracing::{error, warn};

use crate::device::{CameraEvent, CameraEventKind};
use crate::pool::{PoolTask, WorkerPool};
use crate::stats::MonitorStats;

/// Capability: consume camera events, possibly failing.
#[async_trait]
pub trait CameraEventHandler: Send + Sync {
    async fn handle_event(&self, event: &CameraEvent) -> anyhow::Result<()>;
}

/// Infallible callback variant for simple consumers.
pub type EventCallback = Arc<dyn Fn(&CameraEvent) + Send + Sync>;

/// Downstream notification interface (WebSocket/RPC publisher).
#[async_trait]
pub trait EventNotifier: Send + Sync {
    async fn camera_connected(&self, event: &CameraEvent);
    async fn camera_disconnected(&self, event: &CameraEvent);
    async fn status_change(&self, event: &CameraEvent);
    async fn capability_detected(&self, event: &CameraEvent);
    async fn capability_error(&self, event: &CameraEvent);
}

/// Pending events for one device path plus the drain-task marker.
struct PathLane {
    queue: VecDeque<Arc<CameraEvent>>,
    draining: bool,
}

/// State shared between the dispatcher facade and its drain tasks.
struct DispatchShared {
    handlers: RwLock<Vec<Arc<dyn CameraEventHandler>>>,
    callbacks: RwLock<Vec<EventCallback>>,
    notifier: RwLock<Option<Arc<dyn EventNotifier>>>,
    lanes: Mutex<HashMap<String, PathLane>>,
    stats: Arc<MonitorStats>,
}

pub struct EventDispatcher {
    shared: Arc<DispatchShared>,
    pool: Arc<WorkerPool>,
}

impl EventDispatcher {
    pub fn new(pool: Arc<WorkerPool>, stats: Arc<MonitorStats>) -> Self {
        Self {
            shared: Arc::new(DispatchShared {
                handlers: RwLock::new(Vec::new()),
                callbacks: RwLock::new(Vec::new()),
                notifier: RwLock::new(None),
                lanes: Mutex::new(HashMap::new()),
                stats,
            }),
            pool,
        }
    }

    pub async fn add_handler(&self, handler: Arc<dyn CameraEventHandler>) {
        self.shared.handlers.write().await.push(handler);
    }

    pub async fn add_callback(&self, callback: EventCallback) {
        self.shared.callbacks.write().await.push(callback);
    }

    /// Install or detach (`None`) the external notifier.
    pub async fn set_notifier(&self, notifier: Option<Arc<dyn EventNotifier>>) {
        *self.shared.notifier.write().await = notifier;
    }

    /// Registered handler + callback count, surfaced in resource stats.
    pub async fn active_handlers(&self) -> usize {
        self.shared.handlers.read().await.len() + self.shared.callbacks.read().await.len()
    }

    /// Queue one event for delivery to every registered consumer.
    ///
    /// Events for the same path are delivered strictly in the order they
    /// were dispatched; the registry commit for each has already happened
    /// when `dispatch` is called, so per-path delivery follows commit
    /// order. Events for distinct paths may interleave.
    pub async fn dispatch(&self, event: CameraEvent) {
        let path = event.path.clone();
        let event = Arc::new(event);

        let start_drain = {
            let mut lanes = self.shared.lanes.lock().unwrap_or_else(|e| e.into_inner());
            let lane = lanes.entry(path.clone()).or_insert_with(|| PathLane {
                queue: VecDeque::new(),
                draining: false,
            });
            lane.queue.push_back(event);
            if lane.draining {
                false
            } else {
                lane.draining = true;
                true
            }
        };

        if start_drain {
            submit_drain(Arc::clone(&self.shared), Arc::clone(&self.pool), path).await;
        }
    }
}

/// Hand a lane's drain loop to the pool; on rejection the backlog is
/// dropped and counted.
async fn submit_drain(shared: Arc<DispatchShared>, pool: Arc<WorkerPool>, path: String) {
    let task = {
        let shared = Arc::clone(&shared);
        let pool = Arc::clone(&pool);
        let path = path.clone();
        PoolTask::new(format!("events:{path}"), move |_token| {
            drain_lane(shared, pool, path).boxed()
        })
    };

    if let Err(err) = pool.submit(task).await {
        let dropped = {
            let mut lanes = shared.lanes.lock().unwrap_or_else(|e| e.into_inner());
            lanes.remove(&path).map(|lane| lane.queue.len()).unwrap_or(0)
        };
        for _ in 0..dropped {
            MonitorStats::incr(&shared.stats.device_events_dropped);
        }
        warn!(path = %path, dropped, error = %err, "dropping camera events, fan-out unavailable");
    }
}

/// Deliver a lane's queued events in order, then retire the lane.
async fn drain_lane(
    shared: Arc<DispatchShared>,
    pool: Arc<WorkerPool>,
    path: String,
) -> anyhow::Result<()> {
    let mut guard = LaneGuard::new(Arc::clone(&shared), Arc::clone(&pool), path.clone());

    loop {
        let event = {
            let mut lanes = shared.lanes.lock().unwrap_or_else(|e| e.into_inner());
            let Some(lane) = lanes.get_mut(&path) else {
                break;
            };
            match lane.queue.pop_front() {
                Some(event) => event,
                None => {
                    // Empty lane retires with the drain; a later dispatch
                    // recreates it.
                    lanes.remove(&path);
                    break;
                }
            }
        };
        deliver_event(&shared, &pool, &event).await;
    }

    guard.disarm();
    Ok(())
}

/// Invoke every consumer for one event, isolating failures.
async fn deliver_event(shared: &DispatchShared, pool: &WorkerPool, event: &Arc<CameraEvent>) {
    let handlers: Vec<_> = shared.handlers.read().await.iter().map(Arc::clone).collect();
    for handler in handlers {
        match AssertUnwindSafe(handler.handle_event(event)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                pool.record_failure();
                warn!(path = %event.path, error = %err, "event handler failed");
            }
            Err(_panic) => {
                pool.record_failure();
                error!(path = %event.path, "event handler panicked");
            }
        }
    }

    let callbacks: Vec<_> = shared.callbacks.read().await.iter().map(Arc::clone).collect();
    for callback in callbacks {
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            pool.record_failure();
            error!(path = %event.path, "event callback panicked");
        }
    }

    let notifier = shared.notifier.read().await.clone();
    if let Some(notifier) = notifier {
        let notify = async {
            match event.kind {
                CameraEventKind::Connected => notifier.camera_connected(event).await,
                CameraEventKind::Disconnected => notifier.camera_disconnected(event).await,
                CameraEventKind::StatusChanged => notifier.status_change(event).await,
                CameraEventKind::CapabilityDetected => notifier.capability_detected(event).await,
                CameraEventKind::CapabilityError => notifier.capability_error(event).await,
            }
        };
        if AssertUnwindSafe(notify).catch_unwind().await.is_err() {
            pool.record_failure();
            error!(path = %event.path, "event notifier panicked");
        }
    }
}

/// Restarts a lane's drain if the drain task is dropped mid-flight (the
/// pool's task deadline), so queued events still deliver in order.
struct LaneGuard {
    shared: Arc<DispatchShared>,
    pool: Arc<WorkerPool>,
    path: String,
    armed: bool,
}

impl LaneGuard {
    fn new(shared: Arc<DispatchShared>, pool: Arc<WorkerPool>, path: String) -> Self {
        Self {
            shared,
            pool,
            path,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let pool = Arc::clone(&self.pool);
        let path = std::mem::take(&mut self.path);
        // During runtime teardown there is nothing left to restart.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            let has_backlog = {
                let mut lanes = shared.lanes.lock().unwrap_or_else(|e| e.into_inner());
                match lanes.get_mut(&path) {
                    None => false,
                    Some(lane) if lane.queue.is_empty() => {
                        lanes.remove(&path);
                        false
                    }
                    Some(_) => true,
                }
            };
            if has_backlog {
                submit_drain(shared, pool, path).await;
            }
        });
    }
}
