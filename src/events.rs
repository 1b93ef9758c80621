// src/events.rs
//! Event channels published by devices, the registry and the interpreter.
//!
//! Every notification is a plain data message delivered through a tokio
//! broadcast channel. Firing an event never blocks the worker that raises
//! it; a subscriber that falls behind observes `RecvError::Lagged` and
//! loses the overwritten events.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::nav::{FixMethod, FixMode, FixQuality, FixStatus, Position, Satellite};

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle notifications raised by a single device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Connecting { device: String },
    Connected { device: String },
    Disconnecting { device: String },
    Disconnected { device: String },
    DetectionStarted { device: String },
    DetectionSucceeded { device: String },
    DetectionFailed { device: String, reason: String },
}

/// Aggregated notifications raised by the device registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    DeviceAdded { device: String },
    DetectionAttempted { device: String },
    DetectionFailed { device: String, reason: String },
    FixAcquired { device: String },
    FixLost { device: String },
}

/// One navigation field worth of data, as carried by `Received`/`Changed`.
#[derive(Debug, Clone, PartialEq)]
pub enum NavData {
    UtcTime(DateTime<Utc>),
    Position(Position),
    Altitude(f64),
    AltitudeAboveEllipsoid(f64),
    GeoidalSeparation(f64),
    Speed(f64),
    Bearing(f64),
    Heading(f64),
    MagneticVariation(f64),
    FixStatus(FixStatus),
    FixMode(FixMode),
    FixMethod(FixMethod),
    FixQuality(FixQuality),
    FixedSatelliteCount(u8),
    HorizontalDop(f32),
    VerticalDop(f32),
    MeanDop(f32),
    Satellites(Vec<Satellite>),
}

/// Notifications raised by the interpreter.
///
/// For every accepted value a `Received` event fires; `Changed` follows
/// only when the value differs from the previous one.
#[derive(Debug, Clone, PartialEq)]
pub enum InterpreterEvent {
    Starting,
    Started,
    DeviceChanged { device: String },
    Stopping,
    Stopped,
    Paused,
    Resumed,
    ConnectionLost { reason: String },
    ExceptionOccurred { reason: String },
    FixAcquired,
    FixLost,
    Received(NavData),
    Changed(NavData),
}

/// Broadcast sender that tolerates having no subscribers.
#[derive(Debug)]
pub struct EventSender<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> EventSender<T> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Send errors only mean nobody is listening right now.
    pub fn send(&self, event: T) {
        let _ = self.tx.send(event);
    }
}

impl<T: Clone> Default for EventSender<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_without_subscribers_does_not_panic() {
        let sender: EventSender<DeviceEvent> = EventSender::new();
        sender.send(DeviceEvent::Connecting {
            device: "virtual".into(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_sees_events_in_order() {
        let sender: EventSender<InterpreterEvent> = EventSender::new();
        let mut rx = sender.subscribe();

        sender.send(InterpreterEvent::Starting);
        sender.send(InterpreterEvent::Started);

        assert_eq!(rx.recv().await.unwrap(), InterpreterEvent::Starting);
        assert_eq!(rx.recv().await.unwrap(), InterpreterEvent::Started);
    }
}
