//! A software stand-in for the stimulator firmware.
//!
//! Parses host commands off a byte stream and answers battery requests with a
//! telemetry frame. Used by the integration tests and by `trivium simulate`
//! for bench work without hardware.

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::constants::{FRAME_START, START_FRAME_SIZE};
use crate::frame::{Command, encode_telemetry};

/// Simulated device. Clones share the battery reading.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    battery: Arc<AtomicU16>,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

impl SimulatedDevice {
    pub fn new(battery_value: u16) -> Self {
        Self {
            battery: Arc::new(AtomicU16::new(battery_value)),
            commands: None,
        }
    }

    /// Forward every parsed command to `log`.
    pub fn with_command_log(mut self, log: mpsc::UnboundedSender<Command>) -> Self {
        self.commands = Some(log);
        self
    }

    pub fn set_battery(&self, value: u16) {
        self.battery.store(value, Ordering::SeqCst);
    }

    pub fn battery(&self) -> u16 {
        self.battery.load(Ordering::SeqCst)
    }

    /// Serve one host connection until it closes.
    pub async fn run<S>(&self, mut stream: S) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut pending = BytesMut::with_capacity(64);
        let mut buf = [0u8; 64];

        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                debug!("Host closed the connection");
                return Ok(());
            }
            pending.extend_from_slice(&buf[..n]);

            while !pending.is_empty() {
                if let Some((command, len)) = Command::parse(&pending) {
                    pending.advance(len);
                    self.apply(command, &mut stream).await?;
                } else if pending[0] == FRAME_START && pending.len() < START_FRAME_SIZE {
                    break;
                } else {
                    trace!(byte = pending[0], "Skipping unexpected byte");
                    pending.advance(1);
                }
            }
        }
    }

    async fn apply<S>(&self, command: Command, stream: &mut S) -> std::io::Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        match command {
            Command::Start {
                intensity,
                duration_min,
            } => info!(intensity, duration_min, "Stimulation running"),
            Command::Stop => info!("Stimulation stopped"),
            Command::BatteryRequest => {
                let value = self.battery();
                debug!(value, "Reporting battery");
                stream.write_all(&encode_telemetry(value)).await?;
                stream.flush().await?;
            }
        }

        if let Some(log) = &self.commands {
            let _ = log.send(command);
        }
        Ok(())
    }
}
