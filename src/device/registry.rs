// src/device/registry.rs
//! Registry of candidate and confirmed GPS devices

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::device::cache::DeviceCache;
use crate::device::Device;
use crate::error::{GpsError, Result};
use crate::events::{EventSender, RegistryEvent};
use crate::transport::{ConnectorKind, SerialConnector};

const DEFAULT_DETECTION_TIMEOUT: Duration = Duration::from_secs(6);

/// Central catalog of devices plus the detection policy knobs.
///
/// The registry owns the statistics cache and republishes per-device
/// detection events in aggregate, so an application can watch one stream
/// instead of subscribing to every device it creates.
pub struct DeviceRegistry {
    devices: Mutex<Vec<Device>>,
    cache: Mutex<DeviceCache>,
    events: EventSender<RegistryEvent>,
    /// Bumped whenever the confirmed set may have grown; `any_device`
    /// waiters watch it.
    generation: watch::Sender<u64>,
    is_stream_needed: AtomicBool,
    allow_serial_connections: AtomicBool,
    allow_bluetooth_connections: AtomicBool,
    clock_synchronization_enabled: AtomicBool,
    detection_timeout_ms: AtomicU64,
}

impl DeviceRegistry {
    /// Registry backed by the per-user statistics cache.
    pub fn new() -> Arc<Self> {
        Self::with_cache(DeviceCache::load_default())
    }

    /// Registry with an explicit cache, e.g. in-memory for tests.
    pub fn with_cache(cache: DeviceCache) -> Arc<Self> {
        let (generation, _) = watch::channel(0);
        Arc::new(Self {
            devices: Mutex::new(Vec::new()),
            cache: Mutex::new(cache),
            events: EventSender::new(),
            generation,
            is_stream_needed: AtomicBool::new(false),
            allow_serial_connections: AtomicBool::new(true),
            allow_bluetooth_connections: AtomicBool::new(true),
            clock_synchronization_enabled: AtomicBool::new(false),
            detection_timeout_ms: AtomicU64::new(DEFAULT_DETECTION_TIMEOUT.as_millis() as u64),
        })
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Make a device known as a detection candidate. Cached statistics are
    /// applied so past performance steers probe order. Returns the canonical
    /// handle: registering the same identity twice yields the first device.
    pub fn register(&self, device: Device) -> Device {
        let mut devices = self.devices.lock();
        if let Some(existing) = devices
            .iter()
            .find(|known| known.cache_key() == device.cache_key())
        {
            return existing.clone();
        }

        if let Some(entry) = self.cache.lock().entry(device.cache_key()) {
            device.apply_cached_statistics(entry);
        }
        devices.push(device.clone());
        drop(devices);

        if device.is_gps_device() {
            // cache-confirmed devices are usable before any probe runs
            self.generation.send_modify(|gen| *gen += 1);
        }
        device
    }

    /// Record a device as a confirmed GPS device. De-duplicates by identity;
    /// waiters blocked in `any_device` are woken.
    pub fn add(&self, device: &Device) {
        let mut devices = self.devices.lock();
        let already_known = devices
            .iter()
            .any(|known| known.cache_key() == device.cache_key());
        if !already_known {
            devices.push(device.clone());
        }
        drop(devices);

        self.events.send(RegistryEvent::DeviceAdded {
            device: device.name().to_string(),
        });
        self.generation.send_modify(|gen| *gen += 1);
    }

    /// Snapshot of every known device, candidates included.
    pub fn devices(&self) -> Vec<Device> {
        self.devices.lock().clone()
    }

    /// Confirmed GPS devices, best first.
    pub fn gps_devices(&self) -> Vec<Device> {
        let mut confirmed: Vec<Device> = self
            .devices
            .lock()
            .iter()
            .filter(|device| device.is_gps_device())
            .cloned()
            .collect();
        confirmed.sort_by(|a, b| a.cmp_detection_priority(b));
        confirmed
    }

    fn best_device(&self) -> Option<Device> {
        self.devices
            .lock()
            .iter()
            .filter(|device| device.is_gps_device() && device.allow_connections())
            .min_by(|a, b| a.cmp_detection_priority(b))
            .cloned()
    }

    /// Kick off detection on every eligible candidate, most promising
    /// first. Individual failures never abort the pass.
    pub async fn begin_detection(self: &Arc<Self>) {
        let mut snapshot = self.devices();
        snapshot.sort_by(|a, b| a.cmp_detection_priority(b));

        for device in snapshot {
            if !device.allow_connections() {
                debug!("skipping {}: connections disabled", device.name());
                continue;
            }
            if !self.allows(device.kind()) {
                debug!(
                    "skipping {}: {} connections disabled by policy",
                    device.name(),
                    device.kind().description()
                );
                continue;
            }
            device.begin_detection(self).await;
        }
    }

    /// Return the most reliable confirmed device, triggering a detection
    /// pass and waiting up to `timeout` if none is confirmed yet.
    pub async fn any_device(self: &Arc<Self>, timeout: Duration) -> Result<Device> {
        if let Some(device) = self.best_device() {
            return Ok(device);
        }

        // Subscribe before the detection pass so a confirmation landing
        // mid-setup still wakes the wait below.
        let mut generation = self.generation.subscribe();
        self.begin_detection().await;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(device) = self.best_device() {
                return Ok(device);
            }
            match tokio::time::timeout_at(deadline, generation.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(GpsError::NoDevice),
                Err(_) => return Err(GpsError::NoDevice),
            }
        }
    }

    /// Register a candidate for every serial port present on the system.
    pub fn discover_serial_devices(&self, baud: u32) -> Result<Vec<Device>> {
        let ports = tokio_serial::available_ports()?;
        info!("found {} serial port(s)", ports.len());

        let mut discovered = Vec::new();
        for port in ports {
            let device = Device::new(Box::new(SerialConnector::new(&port.port_name, baud)));
            discovered.push(self.register(device));
        }
        Ok(discovered)
    }

    /// Whether policy currently permits connections of this kind.
    pub fn allows(&self, kind: ConnectorKind) -> bool {
        match kind {
            ConnectorKind::Serial => self.allow_serial_connections.load(Ordering::Relaxed),
            ConnectorKind::Bluetooth => self.allow_bluetooth_connections.load(Ordering::Relaxed),
            ConnectorKind::Network | ConnectorKind::Virtual => true,
        }
    }

    /// When set, a successful detection keeps the device open so consumers
    /// can take the stream without reopening.
    pub fn is_stream_needed(&self) -> bool {
        self.is_stream_needed.load(Ordering::Relaxed)
    }

    pub fn set_is_stream_needed(&self, value: bool) {
        self.is_stream_needed.store(value, Ordering::Relaxed);
    }

    pub fn allow_serial_connections(&self) -> bool {
        self.allow_serial_connections.load(Ordering::Relaxed)
    }

    pub fn set_allow_serial_connections(&self, value: bool) {
        self.allow_serial_connections.store(value, Ordering::Relaxed);
    }

    pub fn allow_bluetooth_connections(&self) -> bool {
        self.allow_bluetooth_connections.load(Ordering::Relaxed)
    }

    pub fn set_allow_bluetooth_connections(&self, value: bool) {
        self.allow_bluetooth_connections.store(value, Ordering::Relaxed);
    }

    /// When set, the interpreter warns if the device clock drifts away
    /// from the system clock.
    pub fn clock_synchronization_enabled(&self) -> bool {
        self.clock_synchronization_enabled.load(Ordering::Relaxed)
    }

    pub fn set_clock_synchronization_enabled(&self, value: bool) {
        self.clock_synchronization_enabled.store(value, Ordering::Relaxed);
    }

    /// How long one detection attempt watches a stream for recognizable
    /// sentences.
    pub fn detection_timeout(&self) -> Duration {
        Duration::from_millis(self.detection_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_detection_timeout(&self, value: Duration) -> Result<()> {
        if value.is_zero() {
            return Err(GpsError::invalid_config(
                "detection_timeout",
                "must be greater than zero",
            ));
        }
        self.detection_timeout_ms
            .store(value.as_millis() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Cancel all in-flight detections and close anything still open.
    pub async fn shutdown(&self) {
        let snapshot = self.devices();
        for device in &snapshot {
            device.cancel_detection().await;
        }
        for device in &snapshot {
            device.close().await;
        }
    }

    /// Drop everything learned about a device, both live and cached.
    pub fn undetect(&self, device: &Device) {
        device.undetect();
        let mut cache = self.cache.lock();
        cache.remove(device.cache_key());
        if let Err(e) = cache.save() {
            warn!("could not persist device cache: {}", e);
        }
    }

    pub(crate) fn store_statistics(&self, device: &Device) {
        let mut cache = self.cache.lock();
        cache.insert(device.cache_key(), device.statistics_entry());
        if let Err(e) = cache.save() {
            // cache trouble must never fail a detection
            warn!("could not persist device cache: {}", e);
        }
    }

    pub(crate) fn notify_detection_attempted(&self, device: &str) {
        self.events.send(RegistryEvent::DetectionAttempted {
            device: device.to_string(),
        });
    }

    pub(crate) fn notify_detection_failed(&self, device: &str, reason: &str) {
        self.events.send(RegistryEvent::DetectionFailed {
            device: device.to_string(),
            reason: reason.to_string(),
        });
    }

    pub(crate) fn notify_fix_acquired(&self, device: &str) {
        self.events.send(RegistryEvent::FixAcquired {
            device: device.to_string(),
        });
    }

    pub(crate) fn notify_fix_lost(&self, device: &str) {
        self.events.send(RegistryEvent::FixLost {
            device: device.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::cache::CacheEntry;
    use crate::transport::VirtualConnector;
    use chrono::Utc;

    fn registry() -> Arc<DeviceRegistry> {
        DeviceRegistry::with_cache(DeviceCache::in_memory())
    }

    fn virtual_device(name: &str) -> (Device, Arc<VirtualConnector>) {
        let connector = Arc::new(VirtualConnector::new(name.to_string()));
        let device = Device::new(Box::new(Arc::clone(&connector)));
        (device, connector)
    }

    #[tokio::test]
    async fn test_register_deduplicates_by_identity() {
        let registry = registry();
        let (first, _) = virtual_device("gps0");
        let (duplicate, _) = virtual_device("gps0");

        let canonical = registry.register(first.clone());
        let resolved = registry.register(duplicate);

        assert_eq!(registry.devices().len(), 1);
        assert_eq!(resolved.cache_key(), canonical.cache_key());
    }

    #[tokio::test]
    async fn test_register_applies_cached_statistics() {
        let mut cache = DeviceCache::in_memory();
        cache.insert(
            "virtual:gps0",
            CacheEntry {
                name: "gps0".into(),
                baud_rate: None,
                successful_detection_count: 5,
                failed_detection_count: 1,
                total_connection_time_ms: 500,
                date_detected: Some(Utc::now()),
                date_connected: Some(Utc::now()),
            },
        );
        let registry = DeviceRegistry::with_cache(cache);

        let (device, _) = virtual_device("gps0");
        let device = registry.register(device);

        assert!(device.is_gps_device());
        assert!((device.reliability() - 5.0 / 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_any_device_returns_cached_device_without_probing() {
        let mut cache = DeviceCache::in_memory();
        cache.insert(
            "virtual:gps0",
            CacheEntry {
                name: "gps0".into(),
                baud_rate: None,
                successful_detection_count: 2,
                failed_detection_count: 0,
                total_connection_time_ms: 100,
                date_detected: Some(Utc::now()),
                date_connected: None,
            },
        );
        let registry = DeviceRegistry::with_cache(cache);

        // no sessions queued: any open attempt would fail loudly
        let (device, _connector) = virtual_device("gps0");
        registry.register(device);

        let found = registry
            .any_device(Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(found.cache_key(), "virtual:gps0");
        assert!(!found.is_open());
    }

    #[tokio::test]
    async fn test_any_device_times_out_without_candidates() {
        let registry = registry();
        let err = registry
            .any_device(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, GpsError::NoDevice));
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let registry = registry();
        let (device, _) = virtual_device("gps0");

        registry.add(&device);
        registry.add(&device);
        assert_eq!(registry.devices().len(), 1);
    }

    #[test]
    fn test_policy_flags() {
        let registry = registry();
        assert!(registry.allows(ConnectorKind::Serial));
        assert!(registry.allows(ConnectorKind::Virtual));

        registry.set_allow_serial_connections(false);
        assert!(!registry.allows(ConnectorKind::Serial));
        // network and virtual transports are never policy-gated
        assert!(registry.allows(ConnectorKind::Network));

        registry.set_allow_bluetooth_connections(false);
        assert!(!registry.allows(ConnectorKind::Bluetooth));
    }

    #[test]
    fn test_detection_timeout_validation() {
        let registry = registry();
        assert!(registry.set_detection_timeout(Duration::ZERO).is_err());
        assert!(registry
            .set_detection_timeout(Duration::from_millis(250))
            .is_ok());
        assert_eq!(registry.detection_timeout(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_undetect_erases_cache_entry() {
        let mut cache = DeviceCache::in_memory();
        cache.insert(
            "virtual:gps0",
            CacheEntry {
                name: "gps0".into(),
                baud_rate: None,
                successful_detection_count: 2,
                failed_detection_count: 0,
                total_connection_time_ms: 100,
                date_detected: Some(Utc::now()),
                date_connected: None,
            },
        );
        let registry = DeviceRegistry::with_cache(cache);
        let (device, _) = virtual_device("gps0");
        let device = registry.register(device);
        assert!(device.is_gps_device());

        registry.undetect(&device);
        assert!(!device.is_gps_device());
        assert_eq!(device.reliability(), 0.0);
        assert!(registry.cache.lock().entry("virtual:gps0").is_none());
    }
}
