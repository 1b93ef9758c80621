// src/lib.rs
//! GPS Engine Library
//!
//! Device detection and NMEA interpretation: discovers candidate GPS
//! devices, probes them to confirm they speak NMEA-0183, and runs a
//! background engine that turns the raw sentence stream into a filtered,
//! thread-safely-published navigation state.

pub mod device;
pub mod error;
pub mod events;
pub mod filter;
pub mod interpreter;
pub mod nav;
pub mod nmea;
pub mod options;
pub mod transport;

// Re-export main types for convenience
pub use device::{Device, DeviceCache, DeviceRegistry, DeviceStats};
pub use error::{GpsError, Result};
pub use events::{DeviceEvent, InterpreterEvent, NavData, RegistryEvent};
pub use filter::PositionFilter;
pub use interpreter::{Interpreter, InterpreterState};
pub use nav::{
    FixMethod, FixMode, FixQuality, FixStatus, NavigationState, Position, Satellite,
};
pub use options::InterpreterOptions;
pub use transport::{
    Connector, ConnectorKind, SerialConnector, TcpConnector, Transport, VirtualConnector,
};
