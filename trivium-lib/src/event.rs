use serde::Serialize;
use tokio::sync::mpsc;

use crate::frame::BatteryLevel;
use crate::slot::SlotId;

/// Notifications delivered to the listener, in the order the controller
/// produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    DeviceConnected { slot: SlotId, label: String },
    DeviceDisconnected { slot: SlotId },
    ConnectionFailed { slot: SlotId, message: String },
    SessionStarted { slot: SlotId },
    IntensityUpdated { slot: SlotId, intensity: u8 },
    TimeRemainingUpdated { slot: SlotId, minutes: i32 },
    SessionEnded { slot: SlotId },
    BatteryUpdated { slot: SlotId, value: u16, level: BatteryLevel },
    SessionRecorded { slot: SlotId, session_id: u64 },
    Error { slot: SlotId, message: String },
}

impl Event {
    pub fn slot(&self) -> SlotId {
        match self {
            Event::DeviceConnected { slot, .. }
            | Event::DeviceDisconnected { slot }
            | Event::ConnectionFailed { slot, .. }
            | Event::SessionStarted { slot }
            | Event::IntensityUpdated { slot, .. }
            | Event::TimeRemainingUpdated { slot, .. }
            | Event::SessionEnded { slot }
            | Event::BatteryUpdated { slot, .. }
            | Event::SessionRecorded { slot, .. }
            | Event::Error { slot, .. } => *slot,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;
