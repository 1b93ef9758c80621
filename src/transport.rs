// src/transport.rs
//! Byte-stream transports and the connectors that open them

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::SerialPortBuilderExt;
use tracing::warn;

use crate::error::{GpsError, Result};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// Anything a transport can be built from: a serial port, a TCP socket,
/// one end of an in-memory pipe.
pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

/// An open byte stream with per-operation deadlines.
///
/// Reads and writes are bounded by the configured timeouts so a silent
/// device surfaces as a `Timeout` error instead of hanging its caller.
pub struct Transport {
    stream: Box<dyn RawStream>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Transport {
    pub fn new(stream: impl RawStream + 'static) -> Self {
        Self {
            stream: Box::new(stream),
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn with_timeouts(
        stream: impl RawStream + 'static,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Result<Self> {
        let mut transport = Self::new(stream);
        transport.set_read_timeout(read_timeout)?;
        transport.set_write_timeout(write_timeout)?;
        Ok(transport)
    }

    /// Read into `buf`, returning the byte count. `Ok(0)` means the peer
    /// closed the stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match timeout(self.read_timeout, self.stream.read(buf)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(GpsError::timeout(
                "reading from transport",
                self.read_timeout,
            )),
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match timeout(self.write_timeout, async {
            self.stream.write_all(buf).await?;
            self.stream.flush().await
        })
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(GpsError::timeout("writing to transport", self.write_timeout)),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub fn set_read_timeout(&mut self, value: Duration) -> Result<()> {
        if value.is_zero() {
            return Err(GpsError::invalid_config(
                "read_timeout",
                "must be greater than zero",
            ));
        }
        self.read_timeout = value;
        Ok(())
    }

    pub fn set_write_timeout(&mut self, value: Duration) -> Result<()> {
        if value.is_zero() {
            return Err(GpsError::invalid_config(
                "write_timeout",
                "must be greater than zero",
            ));
        }
        self.write_timeout = value;
        Ok(())
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

/// Transport family a connector belongs to, used by registry policy flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    Serial,
    Network,
    Bluetooth,
    Virtual,
}

impl ConnectorKind {
    pub fn description(&self) -> &'static str {
        match self {
            ConnectorKind::Serial => "serial",
            ConnectorKind::Network => "network",
            ConnectorKind::Bluetooth => "bluetooth",
            ConnectorKind::Virtual => "virtual",
        }
    }
}

/// Factory for transports to one physical (or emulated) device.
///
/// `open` may be called repeatedly over the life of a device: once per
/// detection attempt and once per reconnection.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Human-readable device name, e.g. `/dev/ttyUSB0 @ 4800 baud`.
    fn name(&self) -> String;

    /// Stable identity for the statistics cache, e.g. `serial:/dev/ttyUSB0`.
    fn cache_key(&self) -> String;

    fn kind(&self) -> ConnectorKind;

    /// Baud rate for serial-style connectors, for cache bookkeeping.
    fn baud_rate(&self) -> Option<u32> {
        None
    }

    async fn open(&self) -> Result<Transport>;
}

/// Lets callers keep a handle to a connector they have given to a device,
/// which emulated devices rely on to queue sessions.
#[async_trait]
impl<T: Connector + ?Sized> Connector for std::sync::Arc<T> {
    fn name(&self) -> String {
        (**self).name()
    }

    fn cache_key(&self) -> String {
        (**self).cache_key()
    }

    fn kind(&self) -> ConnectorKind {
        (**self).kind()
    }

    fn baud_rate(&self) -> Option<u32> {
        (**self).baud_rate()
    }

    async fn open(&self) -> Result<Transport> {
        (**self).open().await
    }
}

/// Connects to a GPS receiver on a local serial port.
pub struct SerialConnector {
    port: String,
    baud: u32,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl SerialConnector {
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self {
            port: port.into(),
            baud,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    fn name(&self) -> String {
        format!("{} @ {} baud", self.port, self.baud)
    }

    fn cache_key(&self) -> String {
        format!("serial:{}", self.port)
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Serial
    }

    fn baud_rate(&self) -> Option<u32> {
        Some(self.baud)
    }

    async fn open(&self) -> Result<Transport> {
        #[allow(unused_mut)]
        let mut serial = tokio_serial::new(&self.port, self.baud)
            .timeout(Duration::from_millis(1000))
            .open_native_async()?;

        #[cfg(unix)]
        if let Err(e) = serial.set_exclusive(false) {
            warn!("Failed to set exclusive mode on {}: {}", self.port, e);
        }

        Transport::with_timeouts(serial, self.read_timeout, self.write_timeout)
    }
}

/// Connects to a GPS data server over TCP, e.g. a gpsd-style forwarder.
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn name(&self) -> String {
        format!("{}:{} (TCP)", self.host, self.port)
    }

    fn cache_key(&self) -> String {
        format!("tcp:{}:{}", self.host, self.port)
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Network
    }

    async fn open(&self) -> Result<Transport> {
        let address = format!("{}:{}", self.host, self.port);
        let stream = match timeout(self.connect_timeout, TcpStream::connect(&address)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(GpsError::timeout(
                    "connecting to TCP device",
                    self.connect_timeout,
                ))
            }
        };
        Ok(Transport::new(stream))
    }
}

const VIRTUAL_PIPE_CAPACITY: usize = 4096;

/// In-memory connector for tests and emulated receivers.
///
/// Each queued session is one accepted connection: `open` hands the engine
/// the near end of a duplex pipe while the caller keeps the far end and
/// scripts the device's behavior. With no sessions queued, `open` fails the
/// way an unplugged device would.
pub struct VirtualConnector {
    name: String,
    sessions: Mutex<VecDeque<DuplexStream>>,
}

impl VirtualConnector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sessions: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue one connection and return the far end for the caller to drive.
    pub fn add_session(&self) -> DuplexStream {
        let (near, far) = tokio::io::duplex(VIRTUAL_PIPE_CAPACITY);
        self.sessions.lock().push_back(near);
        far
    }
}

#[async_trait]
impl Connector for VirtualConnector {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn cache_key(&self) -> String {
        format!("virtual:{}", self.name)
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Virtual
    }

    async fn open(&self) -> Result<Transport> {
        match self.sessions.lock().pop_front() {
            Some(stream) => Ok(Transport::new(stream)),
            None => Err(GpsError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("virtual device '{}' has no session to accept", self.name),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_round_trip() {
        let (near, far) = tokio::io::duplex(256);
        let mut transport = Transport::new(near);
        let mut peer = Transport::new(far);

        transport.write_all(b"$GPGGA,test\r\n").await.unwrap();

        let mut buf = [0u8; 64];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"$GPGGA,test\r\n");
    }

    #[tokio::test]
    async fn test_read_times_out_on_silent_stream() {
        let (near, _far) = tokio::io::duplex(256);
        let mut transport =
            Transport::with_timeouts(near, Duration::from_millis(20), DEFAULT_WRITE_TIMEOUT)
                .unwrap();

        let mut buf = [0u8; 16];
        let err = transport.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, GpsError::Timeout { .. }));
        assert!(err.is_connection_loss());
    }

    #[tokio::test]
    async fn test_read_returns_zero_on_closed_peer() {
        let (near, far) = tokio::io::duplex(256);
        drop(far);
        let mut transport = Transport::new(near);

        let mut buf = [0u8; 16];
        assert_eq!(transport.read(&mut buf).await.unwrap(), 0);
    }

    #[test]
    fn test_timeout_setters_reject_zero() {
        let (near, _far) = tokio::io::duplex(16);
        let mut transport = Transport::new(near);

        assert!(transport.set_read_timeout(Duration::ZERO).is_err());
        assert!(transport.set_write_timeout(Duration::ZERO).is_err());
        assert!(transport.set_read_timeout(Duration::from_secs(1)).is_ok());
        assert_eq!(transport.read_timeout(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_virtual_connector_hands_out_queued_sessions() {
        let connector = VirtualConnector::new("bench");
        let mut far = connector.add_session();

        let mut transport = connector.open().await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut far, b"hello")
            .await
            .unwrap();

        let mut buf = [0u8; 8];
        let n = transport.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        // queue exhausted: behaves like an unplugged device
        assert!(connector.open().await.is_err());
    }

    #[test]
    fn test_connector_identity() {
        let serial = SerialConnector::new("/dev/ttyUSB0", 4800);
        assert_eq!(serial.cache_key(), "serial:/dev/ttyUSB0");
        assert_eq!(serial.kind(), ConnectorKind::Serial);
        assert_eq!(serial.baud_rate(), Some(4800));

        let tcp = TcpConnector::new("localhost", 2947);
        assert_eq!(tcp.cache_key(), "tcp:localhost:2947");
        assert_eq!(tcp.kind(), ConnectorKind::Network);
        assert_eq!(tcp.baud_rate(), None);
    }
}
