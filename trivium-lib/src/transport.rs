//! Byte-stream transport to the device.
//!
//! The device only needs a reliable, ordered byte stream: Bluetooth RFCOMM in
//! the field, or a serial-over-TCP bridge on the bench. [`Connector`] is the
//! factory seam; [`TcpConnector`] covers the bridge case and tests use
//! in-memory duplex pipes.

use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{Result, TriviumError};
use crate::frame::Command;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Identifies the device to connect to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTarget {
    /// Transport address, e.g. a MAC address or `host:port`.
    pub address: String,
    /// Human-readable device name.
    pub name: String,
}

impl DeviceTarget {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }

    /// Name followed by the last five characters of the address.
    pub fn label(&self) -> String {
        let tail_start = self
            .address
            .char_indices()
            .rev()
            .nth(4)
            .map(|(i, _)| i)
            .unwrap_or(0);
        format!("{} ({})", self.name, &self.address[tail_start..])
    }
}

/// An open connection to one device, split into its two directions.
///
/// The read half is lent to the telemetry reader while monitoring runs, so it
/// is `None` for that time (or for good, once the reader hit a read error).
pub struct Connection {
    pub(crate) reader: Option<BoxedReader>,
    pub(crate) writer: BoxedWriter,
}

impl Connection {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Some(Box::new(reader)),
            writer: Box::new(writer),
        }
    }

    /// Split a bidirectional stream into a connection.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }

    pub fn has_reader(&self) -> bool {
        self.reader.is_some()
    }

    /// Send a command. Start frames are paced byte by byte with `byte_delay`.
    pub(crate) async fn send(&mut self, command: Command, byte_delay: Duration) -> Result<()> {
        let bytes = command.to_bytes()?;
        debug!(bytes = hex::encode(&bytes), ?command, "Device write");

        let written = if command.is_paced() {
            write_paced(&mut self.writer, &bytes, byte_delay).await
        } else {
            write_flushed(&mut self.writer, &bytes).await
        };
        written.map_err(|e| TriviumError::SendFailed(e.to_string()))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("reader", &self.reader.as_ref().map(|_| "<stream>"))
            .finish_non_exhaustive()
    }
}

/// Write one byte at a time, flushing and sleeping after each.
///
/// The device UART drops bytes when a frame arrives in one burst.
pub async fn write_paced<W>(writer: &mut W, frame: &[u8], byte_delay: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    for byte in frame {
        writer.write_all(std::slice::from_ref(byte)).await?;
        writer.flush().await?;
        tokio::time::sleep(byte_delay).await;
    }
    Ok(())
}

pub async fn write_flushed<W>(writer: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Opens byte streams to devices.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, target: &DeviceTarget) -> impl Future<Output = io::Result<Connection>> + Send;
}

/// Connects to serial bridges that expose the device UART on a TCP port.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub nodelay: bool,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

impl Connector for TcpConnector {
    async fn connect(&self, target: &DeviceTarget) -> io::Result<Connection> {
        let stream = TcpStream::connect(target.address.as_str()).await?;
        stream.set_nodelay(self.nodelay)?;
        info!(address = %target.address, name = %target.name, "TCP link established");
        let (reader, writer) = stream.into_split();
        Ok(Connection::new(reader, writer))
    }
}
