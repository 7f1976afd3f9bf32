//! Capability probing.
//!
//! A probe takes a device path from "present on disk" to a fully-populated
//! registry record: existence check, probe-slot claim, `--all` query with
//! retry/backoff, capability parse, tolerant format query, commit. Probes
//! for configured non-USB sources skip the external utility entirely and
//! commit synthesized records.
//!
//! Retry policy: `DeviceBusy` and `Timeout` retry up to the configured cap
//! with linear backoff; `PermissionDenied` and `DeviceCannotOpen` fail the
//! attempt immediately. Retry parameters are sampled once at probe start,
//! so a concurrent config update never changes a probe mid-flight.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::checker::DeviceChecker;
use crate::command::CommandExecutor;
use crate::config::MonitorConfig;
use crate::device::{
    default_source_formats, device_index_from_path, CameraDevice, CameraSource,
    DeviceCapabilities, DeviceStatus, SourceKind,
};
use crate::error::{ExecError, MonitorResult};
use crate::parser::{parse_device_formats, parse_device_info};
use crate::registry::{BeginProbe, ChangeKind, DeviceRegistry};
use crate::stats::MonitorStats;

/// Result of one probe invocation.
#[derive(Clone, Debug)]
pub enum ProbeOutcome {
    /// The path failed the existence check; nothing was committed.
    DeviceMissing,
    /// Another probe already holds the path.
    AlreadyInFlight,
    /// Shutdown fired mid-probe; the claim was reverted.
    Cancelled,
    /// A record was committed.
    Completed {
        prior: Option<DeviceStatus>,
        change: ChangeKind,
        device: CameraDevice,
    },
}

/// Values a probe samples from the live config when it starts.
#[derive(Clone, Copy, Debug)]
struct ProbeParams {
    timeout: Duration,
    retry_interval: Duration,
    max_retries: u32,
    capability_detection: bool,
}

pub struct CapabilityProber {
    checker: Arc<dyn DeviceChecker>,
    executor: Arc<dyn CommandExecutor>,
    registry: Arc<DeviceRegistry>,
    stats: Arc<MonitorStats>,
    config: Arc<RwLock<MonitorConfig>>,
}

impl CapabilityProber {
    pub fn new(
        checker: Arc<dyn DeviceChecker>,
        executor: Arc<dyn CommandExecutor>,
        registry: Arc<DeviceRegistry>,
        stats: Arc<MonitorStats>,
        config: Arc<RwLock<MonitorConfig>>,
    ) -> Self {
        Self {
            checker,
            executor,
            registry,
            stats,
            config,
        }
    }

    /// Probe a USB-class device path.
    pub async fn probe(
        &self,
        cancel: &CancellationToken,
        path: &str,
    ) -> MonitorResult<ProbeOutcome> {
        if !self.checker.exists(path).await {
            return Ok(ProbeOutcome::DeviceMissing);
        }

        let prior = match self.registry.begin_probe(path).await? {
            BeginProbe::AlreadyInFlight => return Ok(ProbeOutcome::AlreadyInFlight),
            BeginProbe::Started { prior } => prior,
        };
        // If this future is dropped mid-probe (pool task deadline), the
        // guard rolls the claim back so the path is not stuck in Probing.
        let mut guard = ProbeGuard::new(Arc::clone(&self.registry), path, prior);

        let params = {
            let config = self.config.read().await;
            ProbeParams {
                timeout: config.capability_timeout,
                retry_interval: config.capability_retry_interval,
                max_retries: config.capability_max_retries,
                capability_detection: config.enable_capability_detection,
            }
        };

        let device = if params.capability_detection {
            match self.query_device(cancel, path, params).await {
                Ok(device) => device,
                Err(ExecError::Cancelled) => {
                    guard.disarm();
                    self.registry.revert_probe(path, prior).await;
                    return Ok(ProbeOutcome::Cancelled);
                }
                Err(err) => self.error_record(path, &err),
            }
        } else {
            // Capability detection disabled: the existence check already
            // passed, so commit a synthesized record.
            synthesized_device(path, None, default_source_formats(), DeviceStatus::Connected)
        };

        if device.status == DeviceStatus::Connected {
            MonitorStats::incr(&self.stats.probes_successful);
        }

        let change = self.registry.update_full(device.clone()).await;
        self.registry.finish_probe(path).await;
        guard.disarm();
        debug!(path, status = %device.status, ?change, "probe committed");
        Ok(ProbeOutcome::Completed {
            prior,
            change,
            device,
        })
    }

    /// Commit a record for a configured non-USB source.
    ///
    /// Bypasses the external utility; `file` sources are `Connected` iff
    /// the file exists, `network` and `generic` are connected by
    /// configuration.
    pub async fn probe_source(&self, source: &CameraSource) -> MonitorResult<ProbeOutcome> {
        let path = source.source.as_str();
        let prior = match self.registry.begin_probe(path).await? {
            BeginProbe::AlreadyInFlight => return Ok(ProbeOutcome::AlreadyInFlight),
            BeginProbe::Started { prior } => prior,
        };

        let status = match source.kind {
            SourceKind::File => {
                if self.checker.exists(path).await {
                    DeviceStatus::Connected
                } else {
                    DeviceStatus::Error
                }
            }
            _ => DeviceStatus::Connected,
        };

        let mut device =
            synthesized_device(path, Some(source), default_source_formats(), status);
        if status == DeviceStatus::Error {
            device.error = Some(format!("source file not found: {path}"));
        }

        let change = self.registry.update_full(device.clone()).await;
        self.registry.finish_probe(path).await;
        Ok(ProbeOutcome::Completed {
            prior,
            change,
            device,
        })
    }

    /// Run the capability and format queries, assembling a full record.
    async fn query_device(
        &self,
        cancel: &CancellationToken,
        path: &str,
        params: ProbeParams,
    ) -> Result<CameraDevice, ExecError> {
        let info_output = self.execute_with_retry(cancel, path, "--all", params).await?;

        let capabilities = parse_device_info(&info_output);
        if !info_output.trim().is_empty() && capabilities.driver_name == "unknown" {
            MonitorStats::incr(&self.stats.parse_errors);
            debug!(path, "capability dump did not match any known grammar");
        }

        // Format listing is best-effort; a device with unreadable formats
        // is still a usable device.
        let formats = match self
            .executor
            .execute(cancel, path, "--list-formats-ext", params.timeout)
            .await
        {
            Ok(output) => {
                let formats = parse_device_formats(&output);
                if formats.is_empty() && !output.trim().is_empty() {
                    MonitorStats::incr(&self.stats.parse_errors);
                    debug!(path, "format dump did not match any known grammar");
                }
                formats
            }
            Err(ExecError::Cancelled) => return Err(ExecError::Cancelled),
            Err(err) => {
                debug!(path, error = %err, "format query failed, leaving format list empty");
                Vec::new()
            }
        };

        Ok(CameraDevice {
            path: path.to_string(),
            name: capabilities.card_name.clone(),
            capabilities,
            formats,
            status: DeviceStatus::Connected,
            last_seen: Utc::now(),
            device_num: device_index_from_path(path),
            error: None,
            vendor: None,
            product: None,
            serial: None,
        })
    }

    /// `--all` with the retry budget applied to transient failures.
    async fn execute_with_retry(
        &self,
        cancel: &CancellationToken,
        path: &str,
        args: &str,
        params: ProbeParams,
    ) -> Result<String, ExecError> {
        let mut retries_used = 0u32;
        loop {
            MonitorStats::incr(&self.stats.probes_attempted);
            match self
                .executor
                .execute(cancel, path, args, params.timeout)
                .await
            {
                Ok(output) => return Ok(output),
                Err(err) => {
                    if matches!(err, ExecError::Timeout { .. }) {
                        MonitorStats::incr(&self.stats.capability_timeouts);
                    }
                    if matches!(err, ExecError::ExecutableMissing(_)) {
                        warn!(path, error = %err, "capability query utility unavailable");
                    }
                    if err.is_retryable() && retries_used < params.max_retries {
                        retries_used += 1;
                        let backoff = params.retry_interval * retries_used;
                        debug!(path, attempt = retries_used, ?backoff, error = %err, "retrying probe");
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(ExecError::Cancelled),
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Assemble an `Error` record preserving the failure message.
    fn error_record(&self, path: &str, err: &ExecError) -> CameraDevice {
        let capabilities = DeviceCapabilities::default();
        CameraDevice {
            path: path.to_string(),
            name: capabilities.card_name.clone(),
            capabilities,
            formats: Vec::new(),
            status: DeviceStatus::Error,
            last_seen: Utc::now(),
            device_num: device_index_from_path(path),
            error: Some(err.to_string()),
            vendor: None,
            product: None,
            serial: None,
        }
    }
}

/// Rolls back a claimed probe slot if the probe future never resolves.
struct ProbeGuard {
    registry: Arc<DeviceRegistry>,
    path: String,
    prior: Option<DeviceStatus>,
    armed: bool,
}

impl ProbeGuard {
    fn new(registry: Arc<DeviceRegistry>, path: &str, prior: Option<DeviceStatus>) -> Self {
        Self {
            registry,
            path: path.to_string(),
            prior,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let path = std::mem::take(&mut self.path);
        let prior = self.prior;
        // During runtime teardown the registry dies with the process.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            registry.revert_probe(&path, prior).await;
        });
    }
}

fn synthesized_device(
    path: &str,
    source: Option<&CameraSource>,
    formats: Vec<crate::device::DeviceFormat>,
    status: DeviceStatus,
) -> CameraDevice {
    let name = match source {
        Some(source) if !source.description.is_empty() => source.description.clone(),
        Some(source) => source.source.clone(),
        None => "Unknown Video Device".to_string(),
    };
    CameraDevice {
        path: path.to_string(),
        name,
        capabilities: DeviceCapabilities::default(),
        formats,
        status,
        last_seen: Utc::now(),
        device_num: device_index_from_path(path),
        error: None,
        vendor: None,
        product: None,
        serial: None,
    }
}
