// tests/detection.rs
//! End-to-end protocol detection over virtual transports.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use gps_engine::{Device, DeviceCache, DeviceRegistry, GpsError, RegistryEvent, VirtualConnector};

const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

fn registry() -> Arc<DeviceRegistry> {
    let registry = DeviceRegistry::with_cache(DeviceCache::in_memory());
    registry.set_detection_timeout(Duration::from_millis(500)).unwrap();
    registry
}

fn virtual_device(name: &str) -> (Device, Arc<VirtualConnector>) {
    let connector = Arc::new(VirtualConnector::new(name.to_string()));
    let device = Device::new(Box::new(Arc::clone(&connector)));
    (device, connector)
}

#[tokio::test]
async fn detects_nmea_device_and_registers_it_once() {
    let registry = registry();
    let (device, connector) = virtual_device("gps0");
    let device = registry.register(device);
    let mut events = registry.subscribe();

    let mut far = connector.add_session();
    let feeder = tokio::spawn(async move {
        for _ in 0..20 {
            if far
                .write_all(format!("{}\r\n", GGA).as_bytes())
                .await
                .is_err()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });

    device.begin_detection(&registry).await;
    assert!(device.wait_for_detection(Duration::from_secs(2)).await.unwrap());

    assert!(device.is_gps_device());
    assert!(device.is_detection_completed());
    assert_eq!(device.stats().successful_detection_count, 1);
    // detection opened the transport itself and nothing downstream needs
    // the stream, so it is closed again
    assert!(!device.is_open());
    // added exactly once
    assert_eq!(registry.devices().len(), 1);
    assert_eq!(registry.gps_devices().len(), 1);

    let mut attempted = 0;
    let mut added = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            RegistryEvent::DetectionAttempted { .. } => attempted += 1,
            RegistryEvent::DeviceAdded { .. } => added += 1,
            _ => {}
        }
    }
    assert_eq!(attempted, 1);
    assert_eq!(added, 1);

    feeder.abort();
}

#[tokio::test]
async fn non_nmea_stream_fails_detection_and_closes_the_device() {
    let registry = registry();
    let (device, connector) = virtual_device("modem");
    let device = registry.register(device);

    let mut far = connector.add_session();
    far.write_all(b"AT+CGMI\r\nOK\r\nbinary \x01\x02 chatter\r\n")
        .await
        .unwrap();

    device.begin_detection(&registry).await;
    assert!(!device.wait_for_detection(Duration::from_secs(3)).await.unwrap());

    assert!(!device.is_gps_device());
    assert!(device.is_detection_completed());
    assert_eq!(device.stats().failed_detection_count, 1);
    // this attempt opened the device, so failure closed it again
    assert!(!device.is_open());
    assert!(registry.gps_devices().is_empty());
}

#[tokio::test]
async fn detection_failure_leaves_a_caller_opened_device_open() {
    let registry = registry();
    let (device, connector) = virtual_device("shared");
    let device = registry.register(device);

    let mut far = connector.add_session();
    far.write_all(b"nothing that frames as a sentence\r\n")
        .await
        .unwrap();

    device.open().await.unwrap();
    assert!(device.is_open());

    assert!(device.detect_protocol(&registry).await.is_err());
    // the caller opened it; detection must not close it behind their back
    assert!(device.is_open());

    device.close().await;
}

#[tokio::test]
async fn begin_detection_is_idempotent_while_running() {
    let registry = registry();
    let (device, connector) = virtual_device("gps0");
    let device = registry.register(device);

    // a silent session keeps the first attempt in flight
    let _far = connector.add_session();

    device.begin_detection(&registry).await;
    device.begin_detection(&registry).await;
    device.cancel_detection().await;

    // cancellation concludes the attempt without counting either way
    let stats = device.stats();
    assert_eq!(stats.successful_detection_count, 0);
    assert_eq!(stats.failed_detection_count, 0);
}

#[tokio::test]
async fn waiting_on_a_running_probe_times_out_instead_of_ruling_not_gps() {
    let registry = registry();
    let (device, connector) = virtual_device("gps0");
    let device = registry.register(device);

    // a silent session keeps the attempt in flight past the wait
    let _far = connector.add_session();

    device.begin_detection(&registry).await;
    let err = device
        .wait_for_detection(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, GpsError::Timeout { .. }));

    device.cancel_detection().await;
}

#[tokio::test]
async fn shutdown_cancels_detection_and_closes_the_device() {
    let registry = registry();
    let (device, connector) = virtual_device("gps0");
    let device = registry.register(device);

    let _far = connector.add_session();
    device.begin_detection(&registry).await;

    device.shutdown().await;

    assert!(!device.is_open());
    // the cancelled attempt counts neither way
    let stats = device.stats();
    assert_eq!(stats.successful_detection_count, 0);
    assert_eq!(stats.failed_detection_count, 0);

    // shutting down an idle device is harmless
    device.shutdown().await;
}

#[tokio::test]
async fn any_device_waits_for_the_first_confirmation() {
    let registry = registry();
    let (device, connector) = virtual_device("gps0");
    registry.register(device);

    let mut far = connector.add_session();
    let feeder = tokio::spawn(async move {
        for _ in 0..20 {
            if far
                .write_all(format!("{}\r\n", GGA).as_bytes())
                .await
                .is_err()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });

    let found = registry.any_device(Duration::from_secs(3)).await.unwrap();
    assert_eq!(found.cache_key(), "virtual:gps0");
    assert!(found.is_gps_device());

    feeder.abort();
    registry.shutdown().await;
}

#[tokio::test]
async fn one_bad_device_does_not_abort_the_batch() {
    let registry = registry();
    let (good, good_connector) = virtual_device("good");
    let (bad, bad_connector) = virtual_device("bad");
    registry.register(good.clone());
    registry.register(bad.clone());

    let mut good_far = good_connector.add_session();
    let feeder = tokio::spawn(async move {
        for _ in 0..20 {
            if good_far
                .write_all(format!("{}\r\n", GGA).as_bytes())
                .await
                .is_err()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });
    let mut bad_far = bad_connector.add_session();
    bad_far.write_all(b"not nmea at all\r\n").await.unwrap();

    registry.begin_detection().await;
    assert!(good.wait_for_detection(Duration::from_secs(3)).await.unwrap());
    assert!(!bad.wait_for_detection(Duration::from_secs(3)).await.unwrap());

    assert_eq!(registry.gps_devices().len(), 1);
    assert_eq!(registry.gps_devices()[0].name(), "good");

    feeder.abort();
}

#[tokio::test]
async fn stream_needed_keeps_the_device_open_after_detection() {
    let registry = registry();
    registry.set_is_stream_needed(true);
    let (device, connector) = virtual_device("gps0");
    let device = registry.register(device);

    let mut far = connector.add_session();
    far.write_all(format!("{}\r\n{}\r\n", GGA, GGA).as_bytes())
        .await
        .unwrap();

    device.begin_detection(&registry).await;
    assert!(device.wait_for_detection(Duration::from_secs(2)).await.unwrap());

    // a downstream consumer wants the stream, so it stays open
    assert!(device.is_open());
    registry.shutdown().await;
}
