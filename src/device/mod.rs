// src/device/mod.rs v2
//! GPS device lifecycle and protocol detection

pub mod cache;
pub mod registry;

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{GpsError, Result};
use crate::events::{DeviceEvent, EventSender};
use crate::nmea::SentenceReader;
use crate::transport::{Connector, ConnectorKind, Transport};

pub use cache::{CacheEntry, DeviceCache};
pub use registry::DeviceRegistry;

/// How long `cancel_detection` waits for the worker before aborting it.
const DETECTION_CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Snapshot of a device's flags and detection statistics.
#[derive(Debug, Clone)]
pub struct DeviceStats {
    pub is_open: bool,
    pub is_gps_device: bool,
    pub allow_connections: bool,
    pub is_detection_completed: bool,
    pub successful_detection_count: u32,
    pub failed_detection_count: u32,
    pub total_connection_time: Duration,
    pub date_connected: Option<DateTime<Utc>>,
    pub date_detected: Option<DateTime<Utc>>,
}

impl Default for DeviceStats {
    fn default() -> Self {
        Self {
            is_open: false,
            is_gps_device: false,
            allow_connections: true,
            is_detection_completed: false,
            successful_detection_count: 0,
            failed_detection_count: 0,
            total_connection_time: Duration::ZERO,
            date_connected: None,
            date_detected: None,
        }
    }
}

#[derive(Default)]
struct StreamSlot {
    transport: Option<Transport>,
    checked_out: bool,
}

struct DetectionState {
    running: bool,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// One candidate GPS device: a connector plus everything the engine has
/// learned about it.
///
/// `Device` is a cheap handle; clones share state, so a device handed to the
/// registry and a device held by a caller are the same underlying thing.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    connector: Box<dyn Connector>,
    name: String,
    cache_key: String,
    kind: ConnectorKind,
    /// The live stream, if any. Holding the slot serializes open/close
    /// against stream checkout.
    slot: AsyncMutex<StreamSlot>,
    stats: Mutex<DeviceStats>,
    detection: Mutex<DetectionState>,
    /// Completion handle: `true` whenever no detection attempt is in flight.
    detection_done: watch::Sender<bool>,
    events: EventSender<DeviceEvent>,
}

impl Device {
    pub fn new(connector: Box<dyn Connector>) -> Self {
        let name = connector.name();
        let cache_key = connector.cache_key();
        let kind = connector.kind();
        let (detection_done, _) = watch::channel(true);

        Self {
            inner: Arc::new(DeviceInner {
                connector,
                name,
                cache_key,
                kind,
                slot: AsyncMutex::new(StreamSlot::default()),
                stats: Mutex::new(DeviceStats::default()),
                detection: Mutex::new(DetectionState {
                    running: false,
                    token: CancellationToken::new(),
                    handle: None,
                }),
                detection_done,
                events: EventSender::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn cache_key(&self) -> &str {
        &self.inner.cache_key
    }

    pub fn kind(&self) -> ConnectorKind {
        self.inner.kind
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> DeviceStats {
        self.inner.stats.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.inner.stats.lock().is_open
    }

    pub fn is_gps_device(&self) -> bool {
        self.inner.stats.lock().is_gps_device
    }

    pub fn is_detection_completed(&self) -> bool {
        self.inner.stats.lock().is_detection_completed
    }

    pub fn allow_connections(&self) -> bool {
        self.inner.stats.lock().allow_connections
    }

    /// Excluded devices are skipped by every detection pass.
    pub fn set_allow_connections(&self, value: bool) {
        self.inner.stats.lock().allow_connections = value;
    }

    /// Fraction of detection attempts that succeeded, 0.0 to 1.0. A device
    /// with no history scores zero.
    pub fn reliability(&self) -> f64 {
        let stats = self.inner.stats.lock();
        let total = stats.successful_detection_count + stats.failed_detection_count;
        if total == 0 {
            return 0.0;
        }
        stats.successful_detection_count as f64 / total as f64
    }

    /// Mean time `open` took across successful detections. Devices that
    /// never succeeded sort behind everything else.
    pub fn average_connection_time(&self) -> Duration {
        let stats = self.inner.stats.lock();
        if stats.successful_detection_count == 0 {
            return Duration::MAX;
        }
        stats.total_connection_time / stats.successful_detection_count
    }

    /// Best-first probe ordering: highest reliability wins, fastest average
    /// connect time breaks ties.
    pub fn cmp_detection_priority(&self, other: &Device) -> Ordering {
        other
            .reliability()
            .partial_cmp(&self.reliability())
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                self.average_connection_time()
                    .cmp(&other.average_connection_time())
            })
    }

    /// Open the underlying transport. Opening an already-open device is a
    /// no-op and raises no events.
    pub async fn open(&self) -> Result<()> {
        let mut slot = self.inner.slot.lock().await;
        if self.is_open() {
            return Ok(());
        }

        self.inner.events.send(DeviceEvent::Connecting {
            device: self.inner.name.clone(),
        });

        let started = Instant::now();
        match self.inner.connector.open().await {
            Ok(transport) => {
                slot.transport = Some(transport);
                slot.checked_out = false;
                {
                    let mut stats = self.inner.stats.lock();
                    stats.is_open = true;
                    stats.date_connected = Some(Utc::now());
                    stats.total_connection_time += started.elapsed();
                }
                self.inner.events.send(DeviceEvent::Connected {
                    device: self.inner.name.clone(),
                });
                Ok(())
            }
            Err(e) => {
                self.inner.events.send(DeviceEvent::Disconnected {
                    device: self.inner.name.clone(),
                });
                Err(e)
            }
        }
    }

    /// Close the device, dropping the stream if it is still here. Closing a
    /// closed device does nothing; a stream checked out to a reader dies
    /// with its owner rather than here.
    pub async fn close(&self) {
        let mut slot = self.inner.slot.lock().await;
        if !self.is_open() {
            return;
        }

        self.inner.events.send(DeviceEvent::Disconnecting {
            device: self.inner.name.clone(),
        });
        slot.transport = None;
        slot.checked_out = false;
        self.inner.stats.lock().is_open = false;
        self.inner.events.send(DeviceEvent::Disconnected {
            device: self.inner.name.clone(),
        });
    }

    /// Forcefully mark the device closed without an orderly shutdown. For
    /// dead handles (connection loss, suspend/resume) where closing would
    /// only produce more errors.
    pub fn reset(&self) {
        self.inner.stats.lock().is_open = false;
        if let Ok(mut slot) = self.inner.slot.try_lock() {
            slot.transport = None;
            slot.checked_out = false;
        }
    }

    /// Take exclusive ownership of the open stream, e.g. for a parse loop.
    pub async fn take_stream(&self) -> Result<Transport> {
        let mut slot = self.inner.slot.lock().await;
        match slot.transport.take() {
            Some(transport) => {
                slot.checked_out = true;
                Ok(transport)
            }
            None => Err(GpsError::NotOpen {
                device: self.inner.name.clone(),
            }),
        }
    }

    /// Hand a taken stream back. If the device was closed in the meantime
    /// the stream is dropped instead of revived.
    pub async fn return_stream(&self, transport: Transport) {
        let mut slot = self.inner.slot.lock().await;
        if self.is_open() && slot.transport.is_none() {
            slot.transport = Some(transport);
        }
        slot.checked_out = false;
    }

    /// Spawn a detection attempt and return once the worker has actually
    /// started. Calling this while an attempt is in flight is a no-op.
    pub async fn begin_detection(&self, registry: &Arc<DeviceRegistry>) {
        let token = {
            let mut detection = self.inner.detection.lock();
            if detection.running {
                return;
            }
            detection.running = true;
            detection.token = CancellationToken::new();
            detection.token.clone()
        };
        self.inner.detection_done.send_replace(false);

        let (started_tx, started_rx) = oneshot::channel();
        let device = self.clone();
        let registry = Arc::clone(registry);
        let handle = tokio::spawn(async move {
            let _ = started_tx.send(());
            device.run_detection(&registry, token).await;
        });
        self.inner.detection.lock().handle = Some(handle);

        let _ = started_rx.await;
    }

    /// Probe the device for a GPS protocol on the caller's task.
    /// `begin_detection` is the spawned flavor of the same operation.
    pub async fn detect_protocol(&self, registry: &Arc<DeviceRegistry>) -> Result<()> {
        self.detect_protocol_inner(registry, &CancellationToken::new())
            .await
    }

    /// Block until the in-flight detection attempt (if any) finishes. `Ok`
    /// carries whether the device is now confirmed as GPS; an attempt still
    /// running at `timeout` is an error, not a verdict.
    pub async fn wait_for_detection(&self, timeout: Duration) -> Result<bool> {
        let mut done = self.inner.detection_done.subscribe();
        if tokio::time::timeout(timeout, done.wait_for(|finished| *finished))
            .await
            .is_err()
        {
            return Err(GpsError::timeout("waiting for detection", timeout));
        }
        Ok(self.is_gps_device())
    }

    /// Stop an in-flight detection attempt. Safe to call at any time.
    pub async fn cancel_detection(&self) {
        let handle = {
            let mut detection = self.inner.detection.lock();
            if !detection.running {
                return;
            }
            detection.token.cancel();
            detection.handle.take()
        };

        if let Some(mut handle) = handle {
            if tokio::time::timeout(DETECTION_CANCEL_GRACE, &mut handle)
                .await
                .is_err()
            {
                warn!(
                    "detection worker on {} did not stop in time, aborting it",
                    self.inner.name
                );
                handle.abort();
                // the aborted worker can no longer reset its own flags
                self.inner.detection.lock().running = false;
                self.inner.stats.lock().is_detection_completed = true;
                self.inner.detection_done.send_replace(true);
            }
        }
    }

    /// Final teardown: stop any in-flight detection, then close. Idempotent
    /// and safe to call on a device that was never opened.
    pub async fn shutdown(&self) {
        self.cancel_detection().await;
        self.close().await;
    }

    /// Forget that this device ever spoke GPS: clears the learned flag and
    /// zeroes the statistics. The registry drops its cache entry separately.
    pub fn undetect(&self) {
        let mut stats = self.inner.stats.lock();
        stats.is_gps_device = false;
        stats.is_detection_completed = false;
        stats.successful_detection_count = 0;
        stats.failed_detection_count = 0;
        stats.total_connection_time = Duration::ZERO;
        stats.date_detected = None;
    }

    async fn run_detection(&self, registry: &Arc<DeviceRegistry>, token: CancellationToken) {
        self.inner.events.send(DeviceEvent::DetectionStarted {
            device: self.inner.name.clone(),
        });
        registry.notify_detection_attempted(self.name());

        match self.detect_protocol_inner(registry, &token).await {
            Ok(()) => {
                info!("{} detected as a GPS device", self.inner.name);
                self.inner.events.send(DeviceEvent::DetectionSucceeded {
                    device: self.inner.name.clone(),
                });
            }
            Err(e) if e.is_cancelled() => {
                debug!("detection on {} cancelled", self.inner.name);
            }
            Err(e) => {
                debug!("detection on {} failed: {}", self.inner.name, e);
                self.inner.events.send(DeviceEvent::DetectionFailed {
                    device: self.inner.name.clone(),
                    reason: e.to_string(),
                });
                registry.notify_detection_failed(self.name(), &e.to_string());
            }
        }

        {
            let mut detection = self.inner.detection.lock();
            detection.running = false;
            detection.handle = None;
        }
        self.inner.detection_done.send_replace(true);
    }

    /// The detection core: policy checks, open if needed, protocol sniff,
    /// then bookkeeping. Whatever happens, flags are consistent afterwards
    /// and a device opened here is closed again unless the registry wants
    /// streams kept.
    async fn detect_protocol_inner(
        &self,
        registry: &Arc<DeviceRegistry>,
        token: &CancellationToken,
    ) -> Result<()> {
        if self.is_gps_device() {
            // Confirmed in an earlier run; trust the cache and skip the probe.
            self.inner.stats.lock().is_detection_completed = true;
            registry.add(self);
            return Ok(());
        }

        if !self.allow_connections() {
            self.inner.stats.lock().is_detection_completed = true;
            return Err(GpsError::detection(
                self.name(),
                "connections to this device are disabled",
            ));
        }
        if !registry.allows(self.kind()) {
            self.inner.stats.lock().is_detection_completed = true;
            return Err(GpsError::detection(
                self.name(),
                format!(
                    "{} connections are disabled by policy",
                    self.kind().description()
                ),
            ));
        }

        let opened_here = !self.is_open();
        if opened_here {
            if token.is_cancelled() {
                self.finish_attempt(registry, None);
                return Err(GpsError::Cancelled);
            }
            if let Err(e) = self.open().await {
                self.finish_attempt(registry, Some(false));
                return Err(GpsError::detection_with_source(
                    self.name(),
                    "could not open the device",
                    e,
                ));
            }
        }

        let window = registry.detection_timeout();
        match self.sniff_stream(window, token).await {
            Ok(()) => {
                self.finish_attempt(registry, Some(true));
                registry.add(self);
                if opened_here && !registry.is_stream_needed() {
                    self.close().await;
                }
                Ok(())
            }
            Err(e) if e.is_cancelled() => {
                if opened_here {
                    self.close().await;
                }
                self.finish_attempt(registry, None);
                Err(GpsError::Cancelled)
            }
            Err(e) => {
                if opened_here {
                    self.close().await;
                }
                self.finish_attempt(registry, Some(false));
                Err(GpsError::detection_with_source(
                    self.name(),
                    "no recognizable GPS protocol on this device",
                    e,
                ))
            }
        }
    }

    /// Borrow the stream long enough to look for valid sentences on it.
    async fn sniff_stream(&self, window: Duration, token: &CancellationToken) -> Result<()> {
        let transport = self.take_stream().await?;
        let mut reader = SentenceReader::new(transport);

        let result = tokio::select! {
            _ = token.cancelled() => Err(GpsError::Cancelled),
            result = reader.sniff(window) => result,
        };

        self.return_stream(reader.into_transport()).await;
        result
    }

    /// Record the attempt outcome. `succeeded` is `None` for cancellation,
    /// which concludes the attempt without counting either way.
    fn finish_attempt(&self, registry: &Arc<DeviceRegistry>, succeeded: Option<bool>) {
        {
            let mut stats = self.inner.stats.lock();
            stats.is_detection_completed = true;
            match succeeded {
                Some(true) => {
                    stats.is_gps_device = true;
                    stats.successful_detection_count += 1;
                    stats.date_detected = Some(Utc::now());
                }
                Some(false) => {
                    stats.failed_detection_count += 1;
                }
                None => {}
            }
        }
        if succeeded.is_some() {
            registry.store_statistics(self);
        }
    }

    pub(crate) fn apply_cached_statistics(&self, entry: &CacheEntry) {
        let mut stats = self.inner.stats.lock();
        stats.successful_detection_count = entry.successful_detection_count;
        stats.failed_detection_count = entry.failed_detection_count;
        stats.total_connection_time = Duration::from_millis(entry.total_connection_time_ms);
        stats.date_detected = entry.date_detected;
        stats.date_connected = entry.date_connected;
        // a device detected in an earlier run stays confirmed until undetected
        stats.is_gps_device = entry.date_detected.is_some();
    }

    pub(crate) fn statistics_entry(&self) -> CacheEntry {
        let stats = self.inner.stats.lock();
        CacheEntry {
            name: self.inner.name.clone(),
            baud_rate: self.inner.connector.baud_rate(),
            successful_detection_count: stats.successful_detection_count,
            failed_detection_count: stats.failed_detection_count,
            total_connection_time_ms: stats.total_connection_time.as_millis() as u64,
            date_detected: stats.date_detected,
            date_connected: stats.date_connected,
        }
    }
}

/// Without a runtime to join on, dropping the last handle just cancels the
/// detection token cooperatively; `shutdown()` is the orderly async path.
impl Drop for DeviceInner {
    fn drop(&mut self) {
        let detection = self.detection.get_mut();
        detection.token.cancel();
        if let Some(handle) = detection.handle.take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("stats", &self.stats())
            .finish()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::VirtualConnector;
    use tokio::io::AsyncWriteExt;

    fn virtual_device(name: &str) -> (Device, Arc<VirtualConnector>) {
        let connector = Arc::new(VirtualConnector::new(name.to_string()));
        let device = Device::new(Box::new(Arc::clone(&connector)));
        (device, connector)
    }

    #[tokio::test]
    async fn test_open_close_cycle() {
        let (device, connector) = virtual_device("bench");
        let _far = connector.add_session();

        assert!(!device.is_open());
        device.open().await.unwrap();
        assert!(device.is_open());
        assert!(device.stats().date_connected.is_some());

        // double open is a no-op
        device.open().await.unwrap();

        device.close().await;
        assert!(!device.is_open());
        // double close is harmless
        device.close().await;
    }

    #[tokio::test]
    async fn test_take_stream_requires_open_device() {
        let (device, connector) = virtual_device("bench");
        let mut far = connector.add_session();

        let err = device.take_stream().await.unwrap_err();
        assert!(matches!(err, GpsError::NotOpen { .. }));

        device.open().await.unwrap();
        let mut transport = device.take_stream().await.unwrap();

        // the stream is gone from the slot until returned
        assert!(device.take_stream().await.is_err());

        far.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(transport.read(&mut buf).await.unwrap(), 4);

        device.return_stream(transport).await;
        assert!(device.take_stream().await.is_ok());
    }

    #[tokio::test]
    async fn test_return_stream_after_close_drops_it() {
        let (device, connector) = virtual_device("bench");
        let _far = connector.add_session();

        device.open().await.unwrap();
        let transport = device.take_stream().await.unwrap();
        device.close().await;

        device.return_stream(transport).await;
        assert!(!device.is_open());
        assert!(device.take_stream().await.is_err());
    }

    #[tokio::test]
    async fn test_reset_clears_flags_without_close_events() {
        let (device, connector) = virtual_device("bench");
        let _far = connector.add_session();

        device.open().await.unwrap();
        let mut events = device.subscribe();
        device.reset();

        assert!(!device.is_open());
        // no disconnect events fired by a reset
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_reliability_edges() {
        let (device, _) = virtual_device("bench");
        assert_eq!(device.reliability(), 0.0);

        device.apply_cached_statistics(&CacheEntry {
            name: "bench".into(),
            baud_rate: None,
            successful_detection_count: 3,
            failed_detection_count: 0,
            total_connection_time_ms: 300,
            date_detected: Some(Utc::now()),
            date_connected: None,
        });
        assert_eq!(device.reliability(), 1.0);
        assert_eq!(device.average_connection_time(), Duration::from_millis(100));

        device.undetect();
        assert_eq!(device.reliability(), 0.0);
        assert!(!device.is_gps_device());
    }

    #[test]
    fn test_detection_priority_ordering() {
        let (reliable, _) = virtual_device("reliable");
        let (flaky, _) = virtual_device("flaky");
        let (fast, _) = virtual_device("fast");

        reliable.apply_cached_statistics(&CacheEntry {
            name: "reliable".into(),
            baud_rate: None,
            successful_detection_count: 4,
            failed_detection_count: 0,
            total_connection_time_ms: 4000,
            date_detected: Some(Utc::now()),
            date_connected: None,
        });
        flaky.apply_cached_statistics(&CacheEntry {
            name: "flaky".into(),
            baud_rate: None,
            successful_detection_count: 1,
            failed_detection_count: 3,
            total_connection_time_ms: 100,
            date_detected: Some(Utc::now()),
            date_connected: None,
        });
        fast.apply_cached_statistics(&CacheEntry {
            name: "fast".into(),
            baud_rate: None,
            successful_detection_count: 4,
            failed_detection_count: 0,
            total_connection_time_ms: 400,
            date_detected: Some(Utc::now()),
            date_connected: None,
        });

        // higher reliability first
        assert_eq!(
            reliable.cmp_detection_priority(&flaky),
            Ordering::Less
        );
        // equal reliability: faster average connect first
        assert_eq!(fast.cmp_detection_priority(&reliable), Ordering::Less);

        let mut devices = vec![flaky.clone(), reliable.clone(), fast.clone()];
        devices.sort_by(|a, b| a.cmp_detection_priority(b));
        assert_eq!(devices[0].name(), "fast");
        assert_eq!(devices[1].name(), "reliable");
        assert_eq!(devices[2].name(), "flaky");
    }

    #[tokio::test]
    async fn test_wait_for_detection_with_no_attempt_returns_immediately() {
        let (device, _) = virtual_device("bench");
        let started = Instant::now();
        assert!(!device.wait_for_detection(Duration::from_secs(5)).await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
