//! Per-device state. Exactly two slots exist and they never share fields.

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::transport::{Connection, DeviceTarget};

/// Which of the two device slots an operation targets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum SlotId {
    One = 1,
    Two = 2,
}

impl SlotId {
    pub const ALL: [SlotId; 2] = [SlotId::One, SlotId::Two];

    pub fn index(self) -> usize {
        u8::from(self) as usize - 1
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Patient assigned to a slot; only used to label session records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    pub id: i64,
    pub document_id: String,
    pub name: String,
}

/// State of one physical device.
///
/// `connection.is_some() == connected` holds at all times, and
/// `elapsed_min <= duration_min` while the clock runs.
#[derive(Debug)]
pub struct DeviceSlot {
    pub(crate) connection: Option<Connection>,
    pub(crate) target: Option<DeviceTarget>,
    pub(crate) connected: bool,
    pub(crate) batt_mon: bool,
    pub(crate) clock_stopped: bool,
    pub(crate) elapsed_min: u32,
    pub(crate) duration_min: u8,
    pub(crate) intensity: u8,
    pub(crate) patient: Option<Patient>,
}

impl DeviceSlot {
    pub fn new() -> Self {
        Self {
            connection: None,
            target: None,
            connected: false,
            batt_mon: false,
            clock_stopped: true,
            elapsed_min: 0,
            duration_min: 0,
            intensity: 0,
            patient: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_battery_monitoring(&self) -> bool {
        self.batt_mon
    }

    pub fn is_clock_stopped(&self) -> bool {
        self.clock_stopped
    }

    pub fn elapsed_min(&self) -> u32 {
        self.elapsed_min
    }

    pub fn duration_min(&self) -> u8 {
        self.duration_min
    }

    pub fn intensity(&self) -> u8 {
        self.intensity
    }

    pub fn patient(&self) -> Option<&Patient> {
        self.patient.as_ref()
    }

    pub fn is_time_exhausted(&self) -> bool {
        self.duration_min > 0 && self.elapsed_min >= self.duration_min as u32
    }

    /// Remaining minutes as reported to listeners. Negative only when a
    /// session runs without a configured duration.
    pub fn remaining_min(&self) -> i32 {
        self.duration_min as i32 - self.elapsed_min as i32
    }

    /// Label used in events and session records, e.g. `TENS-01 (AB:CD)`.
    pub fn label(&self) -> Option<String> {
        self.target.as_ref().map(DeviceTarget::label)
    }

    pub(crate) fn install(&mut self, target: DeviceTarget, connection: Connection) {
        self.connection = Some(connection);
        self.target = Some(target);
        self.connected = true;
    }

    /// Drops the connection, closing both halves of the stream.
    pub fn reset_connection(&mut self) {
        self.connection = None;
        self.target = None;
        self.connected = false;
        self.batt_mon = false;
    }

    pub fn reset_session(&mut self) {
        self.clock_stopped = true;
        self.elapsed_min = 0;
    }

    pub fn reset_patient(&mut self) {
        self.patient = None;
        self.intensity = 0;
        self.duration_min = 0;
    }

    pub fn reset_all(&mut self) {
        self.reset_connection();
        self.reset_session();
        self.reset_patient();
    }
}

impl Default for DeviceSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only copy of a slot handed out by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    pub slot: SlotId,
    pub connected: bool,
    pub label: Option<String>,
    pub battery_monitoring: bool,
    pub running: bool,
    pub elapsed_min: u32,
    pub duration_min: u8,
    pub intensity: u8,
    pub patient: Option<Patient>,
    pub timer_active: bool,
    pub reader_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_numbers() {
        assert_eq!(SlotId::One.index(), 0);
        assert_eq!(SlotId::Two.index(), 1);
        assert_eq!(SlotId::try_from(2).unwrap(), SlotId::Two);
        assert!(SlotId::try_from(3).is_err());
        assert_eq!(SlotId::Two.to_string(), "2");
    }

    #[test]
    fn test_new_slot_is_idle_and_disconnected() {
        let slot = DeviceSlot::new();
        assert!(!slot.is_connected());
        assert!(slot.is_clock_stopped());
        assert!(slot.label().is_none());
        assert!(!slot.is_time_exhausted());
    }

    #[test]
    fn test_time_exhausted_needs_a_duration() {
        let mut slot = DeviceSlot::new();
        slot.elapsed_min = 3;
        assert!(!slot.is_time_exhausted());
        slot.duration_min = 3;
        assert!(slot.is_time_exhausted());
        assert_eq!(slot.remaining_min(), 0);
    }

    #[test]
    fn test_reset_all_clears_patient_and_session() {
        let mut slot = DeviceSlot::new();
        slot.patient = Some(Patient {
            id: 7,
            document_id: "12345678Z".into(),
            name: "Ana".into(),
        });
        slot.intensity = 9;
        slot.duration_min = 20;
        slot.elapsed_min = 4;
        slot.clock_stopped = false;
        slot.batt_mon = true;

        slot.reset_all();

        assert!(slot.patient().is_none());
        assert_eq!(slot.intensity(), 0);
        assert_eq!(slot.elapsed_min(), 0);
        assert!(slot.is_clock_stopped());
        assert!(!slot.is_battery_monitoring());
    }
}
