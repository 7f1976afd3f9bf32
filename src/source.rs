//! Kernel device event subscription.
//!
//! On Linux the [`UdevEventSource`] subscribes to the `video4linux`
//! subsystem through a udev monitor socket. udev handles are not `Send`,
//! so the socket lives on a dedicated thread that polls with a timeout and
//! pushes mapped events into a bounded [`EventBuffer`]; the monitor task
//! consumes the buffer from async context. Everywhere else (or when the
//! socket cannot be opened) the [`NoopEventSource`] stands in and the
//! reconciler provides all discovery signal.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::device::DeviceEvent;
use crate::stats::MonitorStats;

/// Capability: deliver kernel add/remove/change events for the camera
/// device class.
#[async_trait]
pub trait DeviceEventSource: Send + Sync {
    /// Attempt to subscribe. Failure leaves the source unusable but must
    /// not take the monitor down; polling covers discovery instead.
    async fn start(&self) -> anyhow::Result<()>;

    /// Whether this source can deliver kernel events at all.
    fn events_supported(&self) -> bool;

    fn started(&self) -> bool;

    /// Next event, or `None` once the source is closed and drained.
    ///
    /// Single-consumer; the stream is not restartable.
    async fn recv(&self) -> Option<DeviceEvent>;

    async fn close(&self);
}

struct BufferState {
    queue: VecDeque<DeviceEvent>,
    closed: bool,
}

/// Bounded event queue with drop-oldest overflow.
pub struct EventBuffer {
    state: Mutex<BufferState>,
    notify: Notify,
    capacity: usize,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BufferState {
                queue: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append an event. Returns true if an older event was evicted.
    pub fn push(&self, event: DeviceEvent) -> bool {
        let mut dropped = false;
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return false;
            }
            if state.queue.len() >= self.capacity {
                state.queue.pop_front();
                dropped = true;
            }
            state.queue.push_back(event);
        }
        self.notify.notify_one();
        dropped
    }

    pub async fn recv(&self) -> Option<DeviceEvent> {
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.closed = true;
        }
        // notify_one stores a permit, so a consumer arriving after this
        // call still observes the close.
        self.notify.notify_one();
    }
}

/// Source used where no kernel subscription exists.
#[derive(Default)]
pub struct NoopEventSource {
    started: AtomicBool,
}

#[async_trait]
impl DeviceEventSource for NoopEventSource {
    async fn start(&self) -> anyhow::Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn events_supported(&self) -> bool {
        false
    }

    fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn recv(&self) -> Option<DeviceEvent> {
        None
    }

    async fn close(&self) {
        self.started.store(false, Ordering::SeqCst);
    }
}

/// Build the platform event source.
pub fn default_event_source(
    stats: Arc<MonitorStats>,
    buffer_capacity: usize,
) -> Arc<dyn DeviceEventSource> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(linux::UdevEventSource::new(stats, buffer_capacity))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (stats, buffer_capacity);
        Arc::new(NoopEventSource::default())
    }
}

#[cfg(target_os = "linux")]
pub mod linux {
    use super::*;
    use crate::device::DeviceEventKind;
    use anyhow::{anyhow, Context};
    use chrono::Utc;
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;
    use tracing::{debug, info, warn};

    /// Poll timeout for the monitor socket; bounds shutdown latency.
    const POLL_TIMEOUT_MS: i32 = 500;

    /// udev-backed event source for the `video4linux` subsystem.
    pub struct UdevEventSource {
        buffer: Arc<EventBuffer>,
        stats: Arc<MonitorStats>,
        running: Arc<AtomicBool>,
        started: AtomicBool,
        supported: AtomicBool,
        thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    }

    impl UdevEventSource {
        pub fn new(stats: Arc<MonitorStats>, buffer_capacity: usize) -> Self {
            Self {
                buffer: Arc::new(EventBuffer::new(buffer_capacity)),
                stats,
                running: Arc::new(AtomicBool::new(false)),
                started: AtomicBool::new(false),
                supported: AtomicBool::new(false),
                thread: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl DeviceEventSource for UdevEventSource {
        async fn start(&self) -> anyhow::Result<()> {
            if self.started.load(Ordering::SeqCst) {
                return Ok(());
            }

            // udev handles are not Send, so the socket is created on the
            // thread that will poll it; the ready channel reports whether
            // the subscription came up.
            let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();
            let buffer = Arc::clone(&self.buffer);
            let stats = Arc::clone(&self.stats);
            let running = Arc::clone(&self.running);
            running.store(true, Ordering::SeqCst);

            let handle = std::thread::Builder::new()
                .name("udev-monitor".to_string())
                .spawn(move || pump_events(ready_tx, buffer, stats, running))
                .context("failed to spawn udev monitor thread")?;

            let ready = tokio::task::spawn_blocking(move || {
                ready_rx.recv_timeout(Duration::from_secs(5))
            })
            .await
            .context("udev ready wait task failed")?;

            match ready {
                Ok(Ok(())) => {
                    *self.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                    self.started.store(true, Ordering::SeqCst);
                    self.supported.store(true, Ordering::SeqCst);
                    info!("udev monitor subscribed to video4linux events");
                    Ok(())
                }
                Ok(Err(message)) => {
                    self.running.store(false, Ordering::SeqCst);
                    let _ = handle.join();
                    Err(anyhow!("udev subscription failed: {message}"))
                }
                Err(_) => {
                    self.running.store(false, Ordering::SeqCst);
                    Err(anyhow!("udev subscription did not come up in time"))
                }
            }
        }

        fn events_supported(&self) -> bool {
            self.supported.load(Ordering::SeqCst)
        }

        fn started(&self) -> bool {
            self.started.load(Ordering::SeqCst)
        }

        async fn recv(&self) -> Option<DeviceEvent> {
            self.buffer.recv().await
        }

        async fn close(&self) {
            self.running.store(false, Ordering::SeqCst);
            self.started.store(false, Ordering::SeqCst);
            let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(handle) = handle {
                let _ = tokio::task::spawn_blocking(move || handle.join()).await;
            }
            self.buffer.close();
        }
    }

    fn pump_events(
        ready_tx: std::sync::mpsc::Sender<Result<(), String>>,
        buffer: Arc<EventBuffer>,
        stats: Arc<MonitorStats>,
        running: Arc<AtomicBool>,
    ) {
        let socket = match udev::MonitorBuilder::new()
            .and_then(|b| b.match_subsystem("video4linux"))
            .and_then(|b| b.listen())
        {
            Ok(socket) => socket,
            Err(err) => {
                let _ = ready_tx.send(Err(err.to_string()));
                return;
            }
        };
        let _ = ready_tx.send(Ok(()));

        let fd = socket.as_raw_fd();
        while running.load(Ordering::SeqCst) {
            let mut fds = [libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            }];
            let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, POLL_TIMEOUT_MS) };
            if ret <= 0 {
                // Timeout or EINTR; re-check the running flag.
                continue;
            }

            for event in socket.iter() {
                let Some(devnode) = event.devnode().map(|p| p.to_string_lossy().to_string())
                else {
                    MonitorStats::incr(&stats.udev_events_filtered);
                    continue;
                };
                if !devnode.starts_with("/dev/video") {
                    MonitorStats::incr(&stats.udev_events_filtered);
                    continue;
                }

                let kind = match event.event_type() {
                    udev::EventType::Add => DeviceEventKind::Add,
                    udev::EventType::Remove => DeviceEventKind::Remove,
                    udev::EventType::Change => DeviceEventKind::Change,
                    other => {
                        debug!(event_type = ?other, device = %devnode, "skipping udev event");
                        MonitorStats::incr(&stats.udev_events_skipped);
                        continue;
                    }
                };

                let property = |name: &str| {
                    event
                        .property_value(name)
                        .map(|v| v.to_string_lossy().to_string())
                };
                let device_event = DeviceEvent {
                    kind,
                    path: devnode.clone(),
                    vendor: property("ID_VENDOR_ID"),
                    product: property("ID_MODEL_ID"),
                    serial: property("ID_SERIAL_SHORT"),
                    timestamp: Utc::now(),
                };

                MonitorStats::incr(&stats.udev_events_processed);
                if buffer.push(device_event) {
                    MonitorStats::incr(&stats.device_events_dropped);
                    warn!(device = %devnode, "event buffer full, dropped oldest event");
                }
            }
        }

        buffer.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceEventKind;
    use chrono::Utc;

    fn event(path: &str) -> DeviceEvent {
        DeviceEvent {
            kind: DeviceEventKind::Add,
            path: path.to_string(),
            vendor: None,
            product: None,
            serial: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn buffer_delivers_in_order() {
        let buffer = EventBuffer::new(8);
        assert!(!buffer.push(event("/dev/video0")));
        assert!(!buffer.push(event("/dev/video1")));
        assert_eq!(buffer.recv().await.unwrap().path, "/dev/video0");
        assert_eq!(buffer.recv().await.unwrap().path, "/dev/video1");
    }

    #[tokio::test]
    async fn buffer_overflow_drops_oldest() {
        let buffer = EventBuffer::new(2);
        assert!(!buffer.push(event("/dev/video0")));
        assert!(!buffer.push(event("/dev/video1")));
        assert!(buffer.push(event("/dev/video2")));
        assert_eq!(buffer.recv().await.unwrap().path, "/dev/video1");
        assert_eq!(buffer.recv().await.unwrap().path, "/dev/video2");
    }

    #[tokio::test]
    async fn closed_buffer_returns_none_after_drain() {
        let buffer = EventBuffer::new(4);
        buffer.push(event("/dev/video0"));
        buffer.close();
        assert!(buffer.recv().await.is_some());
        assert!(buffer.recv().await.is_none());
        assert!(!buffer.push(event("/dev/video1")));
    }

    #[tokio::test]
    async fn recv_wakes_on_close() {
        let buffer = Arc::new(EventBuffer::new(4));
        let consumer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.recv().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        buffer.close();
        let received = tokio::time::timeout(std::time::Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake")
            .expect("consumer task should not panic");
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn noop_source_reports_unsupported() {
        let source = NoopEventSource::default();
        assert!(!source.events_supported());
        source.start().await.unwrap();
        assert!(source.started());
        assert!(source.recv().await.is_none());
        source.close().await;
        assert!(!source.started());
    }
}
