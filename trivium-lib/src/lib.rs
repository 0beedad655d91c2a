pub mod clock;
pub mod config;
pub mod constants;
pub mod controller;
mod engine;
pub mod error;
pub mod event;
pub mod frame;
pub mod recorder;
pub mod simulator;
pub mod slot;
mod telemetry;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use controller::{ControllerBuilder, ControllerHandle};
pub use error::{Result, TriviumError};
pub use event::{Event, EventReceiver};
pub use frame::{BatteryLevel, Command, TelemetrySample};
pub use recorder::{JsonLinesRecorder, SessionRecord, SessionRecorder};
pub use simulator::SimulatedDevice;
pub use slot::{Patient, SlotId, SlotSnapshot};
pub use transport::{Connection, Connector, DeviceTarget, TcpConnector};
