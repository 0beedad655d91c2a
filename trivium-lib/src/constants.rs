// Protocol constants for the stimulation device

/// First byte of a start/update frame ('A')
pub const FRAME_START: u8 = 0x41;

/// Last byte of a start/update frame ('B')
pub const FRAME_END: u8 = 0x42;

/// Single-byte stop command ('C')
pub const CMD_STOP: u8 = 0x43;

/// Single-byte battery telemetry request ('F')
pub const CMD_BATTERY_REQUEST: u8 = 0x46;

/// Pulse width in milliseconds, sent twice in every start frame
pub const PULSE_WIDTH_MS: u32 = 4;

/// Pulse period in milliseconds (10 Hz), sent twice in every start frame
pub const PERIOD_MS: u32 = 100;

/// Total size of a start/update frame
pub const START_FRAME_SIZE: usize = 24;

/// Bytes consumed from the marker onward for one telemetry sample
pub const TELEMETRY_FRAME_SIZE: usize = 4;

/// High bytes accepted as the start of a telemetry sample
pub const TELEMETRY_MARKERS: [u8; 2] = [0x02, 0x03];

/// Readings at or above this are reported as a high battery level
pub const BATTERY_HIGH_THRESHOLD: u16 = 890;

/// Readings at or above this (and below high) are reported as medium
pub const BATTERY_MEDIUM_THRESHOLD: u16 = 840;

/// A changed reading above this value ends battery monitoring
pub const BATTERY_SETTLED_THRESHOLD: u16 = 780;

/// Battery is requested every time the elapsed minutes hit a multiple of this
pub const BATTERY_CHECK_INTERVAL_MIN: u32 = 5;

/// Lowest intensity accepted by the hardware
pub const INTENSITY_MIN: u8 = 1;

/// Highest intensity accepted by the hardware
pub const INTENSITY_MAX: u8 = 19;
