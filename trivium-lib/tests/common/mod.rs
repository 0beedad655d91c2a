//! Common test utilities and shared imports

// Not every test file uses every helper
#![allow(dead_code, unused_imports)]

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use bytes::Bytes;
pub use hex;
pub use trivium_lib::frame::{Decoded, TelemetryDecoder, decode_telemetry, encode_start};
pub use trivium_lib::{
    BatteryLevel, Command, Connection, Connector, ControllerBuilder, ControllerHandle, DeviceTarget,
    EngineConfig, Event, EventReceiver, ManualClock, Patient, SimulatedDevice, SlotId, TriviumError,
};

use tokio::sync::mpsc;

/// Decode hex string to bytes for testing
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data.replace(' ', "")).expect("Failed to decode hex"))
}

pub const DEVICE_ONE: &str = "00:11:22:33:44:01";
pub const DEVICE_TWO: &str = "00:11:22:33:44:02";

/// Connects to in-memory simulated devices keyed by address.
#[derive(Clone, Default)]
pub struct SimConnector {
    devices: Arc<Mutex<HashMap<String, SimulatedDevice>>>,
    delay: Duration,
}

impl SimConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every connect attempt take `delay` before it resolves.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Register a device and return the receiving end of its command log.
    pub fn add(&self, address: &str, battery: u16) -> (SimulatedDevice, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let device = SimulatedDevice::new(battery).with_command_log(tx);
        self.devices
            .lock()
            .unwrap()
            .insert(address.to_string(), device.clone());
        (device, rx)
    }
}

impl Connector for SimConnector {
    async fn connect(&self, target: &DeviceTarget) -> io::Result<Connection> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let device = self.devices.lock().unwrap().get(&target.address).cloned();
        let Some(device) = device else {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no device at {}", target.address),
            ));
        };

        let (host, remote) = tokio::io::duplex(256);
        tokio::spawn(async move { device.run(remote).await });
        Ok(Connection::from_stream(host))
    }
}

pub fn target(address: &str) -> DeviceTarget {
    DeviceTarget::new(address, "TENS")
}

pub fn patient() -> Patient {
    Patient {
        id: 42,
        document_id: "12345678Z".to_string(),
        name: "Lucia".to_string(),
    }
}

/// Wait for the next event. Under paused time this lets session timers fire.
pub async fn next_event(events: &mut EventReceiver) -> Event {
    tokio::time::timeout(Duration::from_secs(300), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

pub fn assert_no_event(events: &mut EventReceiver) {
    if let Ok(event) = events.try_recv() {
        panic!("unexpected event: {event:?}");
    }
}

/// Spawn a controller over `connector` driven by a manual clock.
pub fn spawn_controller(connector: SimConnector, clock: &ManualClock) -> (ControllerHandle, EventReceiver) {
    ControllerBuilder::new(connector)
        .config(EngineConfig::default())
        .clock(clock.clone())
        .spawn()
}

/// Connect `slot` and wait until the controller reports it.
pub async fn connect(handle: &ControllerHandle, events: &mut EventReceiver, slot: SlotId, address: &str) {
    handle.connect(slot, target(address)).await.unwrap();
    match next_event(events).await {
        Event::DeviceConnected { slot: s, .. } => assert_eq!(s, slot),
        other => panic!("expected DeviceConnected, got {other:?}"),
    }
}

/// Move the wall clock one minute and wait for the resulting countdown event.
pub async fn next_minute(clock: &ManualClock, events: &mut EventReceiver) -> Event {
    clock.advance();
    next_event(events).await
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
