//! # Stimulator wire protocol
//!
//! The device speaks a tiny command protocol over a byte stream:
//!
//! ```text
//! Start/update (24 bytes):
//!   'A' | pulse width (4 digits) x2 | period (4 digits) x2
//!       | intensity (2 digits) x2 | duration (2 digits) | 'B'
//! Stop:             'C'
//! Battery request:  'F'
//! ```
//!
//! Every numeric field is sent as zero-padded ASCII decimal digits. The
//! duplicated fields are protocol redundancy and are not checked by the
//! receiver.
//!
//! Telemetry coming back from the device has no length prefix or delimiter.
//! The decoder resynchronizes on the first byte that can be the high byte of a
//! 10-bit ADC reading (`0x02` or `0x03`) and consumes a 4-byte window from it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;
use strum_macros::Display;

use crate::constants::*;
use crate::error::{Result, TriviumError};

/// Leading byte of every command understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Start = 0x41,
    Stop = 0x43,
    BatteryRequest = 0x46,
}

/// A command sent from the host to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start a session, or update the intensity of the running one.
    Start { intensity: u8, duration_min: u8 },
    Stop,
    BatteryRequest,
}

impl Command {
    /// Serialize the command to its wire representation.
    pub fn to_bytes(&self) -> Result<Bytes> {
        match *self {
            Command::Start {
                intensity,
                duration_min,
            } => encode_start(intensity, duration_min),
            Command::Stop => Ok(encode_stop()),
            Command::BatteryRequest => Ok(encode_battery_request()),
        }
    }

    /// Multi-byte frames go through the paced writer, single bytes do not.
    pub fn is_paced(&self) -> bool {
        matches!(self, Command::Start { .. })
    }

    /// Parse one complete command from the start of `bytes`.
    ///
    /// Returns the command and the number of bytes it occupied, or `None` when
    /// the buffer does not start with a complete, well-formed command.
    pub fn parse(bytes: &[u8]) -> Option<(Command, usize)> {
        let opcode = Opcode::try_from(*bytes.first()?).ok()?;
        match opcode {
            Opcode::Stop => Some((Command::Stop, 1)),
            Opcode::BatteryRequest => Some((Command::BatteryRequest, 1)),
            Opcode::Start => {
                let frame = bytes.get(..START_FRAME_SIZE)?;
                if frame[START_FRAME_SIZE - 1] != FRAME_END {
                    return None;
                }
                // intensity is the first copy at offset 17, duration at 21
                let intensity = read_ascii_digits(&frame[17..19])?;
                let duration_min = read_ascii_digits(&frame[21..23])?;
                Some((
                    Command::Start {
                        intensity: u8::try_from(intensity).ok()?,
                        duration_min: u8::try_from(duration_min).ok()?,
                    },
                    START_FRAME_SIZE,
                ))
            }
        }
    }
}

/// Build the 24-byte start/update frame.
pub fn encode_start(intensity: u8, duration_min: u8) -> Result<Bytes> {
    let mut frame = BytesMut::with_capacity(START_FRAME_SIZE);
    frame.put_u8(FRAME_START);

    put_ascii_digits(&mut frame, PULSE_WIDTH_MS, 4)?;
    put_ascii_digits(&mut frame, PULSE_WIDTH_MS, 4)?;

    put_ascii_digits(&mut frame, PERIOD_MS, 4)?;
    put_ascii_digits(&mut frame, PERIOD_MS, 4)?;

    put_ascii_digits(&mut frame, intensity as u32, 2)?;
    put_ascii_digits(&mut frame, intensity as u32, 2)?;

    put_ascii_digits(&mut frame, duration_min as u32, 2)?;

    frame.put_u8(FRAME_END);
    debug_assert_eq!(frame.len(), START_FRAME_SIZE);
    Ok(frame.freeze())
}

pub fn encode_stop() -> Bytes {
    Bytes::from_static(&[CMD_STOP])
}

pub fn encode_battery_request() -> Bytes {
    Bytes::from_static(&[CMD_BATTERY_REQUEST])
}

/// Append `value` as exactly `digits` ASCII decimal digits, most significant first.
fn put_ascii_digits(buf: &mut BytesMut, value: u32, digits: usize) -> Result<()> {
    let limit = 10u32.pow(digits as u32);
    if value >= limit {
        return Err(TriviumError::FieldOverflow { value, digits });
    }

    let mut divisor = limit / 10;
    while divisor > 0 {
        buf.put_u8(b'0' + ((value / divisor) % 10) as u8);
        divisor /= 10;
    }
    Ok(())
}

fn read_ascii_digits(bytes: &[u8]) -> Option<u32> {
    bytes.iter().try_fold(0u32, |acc, &b| {
        b.is_ascii_digit().then(|| acc * 10 + (b - b'0') as u32)
    })
}

/// Battery charge category derived from a raw ADC reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, Serialize)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(u8)]
pub enum BatteryLevel {
    Low = 1,
    Medium = 2,
    High = 3,
}

pub fn classify_level(value: u16) -> BatteryLevel {
    if value >= BATTERY_HIGH_THRESHOLD {
        BatteryLevel::High
    } else if value >= BATTERY_MEDIUM_THRESHOLD {
        BatteryLevel::Medium
    } else {
        BatteryLevel::Low
    }
}

/// One decoded battery reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TelemetrySample {
    pub value: u16,
    pub level: BatteryLevel,
}

impl TelemetrySample {
    pub fn new(value: u16) -> Self {
        Self {
            value,
            level: classify_level(value),
        }
    }
}

/// Outcome of a single decode attempt over the accumulated bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// A sample was found. `consumed` covers the whole buffer: anything past
    /// the 4-byte window is dropped together with the frame.
    Sample {
        sample: TelemetrySample,
        consumed: usize,
    },
    /// No complete frame yet. The first `discard` bytes can never start a
    /// frame and should be dropped before more data is appended.
    NeedMoreData { discard: usize },
}

/// Try to decode one telemetry sample from `buf`.
pub fn decode_telemetry(buf: &[u8]) -> Decoded {
    let Some(marker) = buf.iter().position(|b| TELEMETRY_MARKERS.contains(b)) else {
        return Decoded::NeedMoreData { discard: buf.len() };
    };

    if buf.len() - marker < TELEMETRY_FRAME_SIZE {
        return Decoded::NeedMoreData { discard: marker };
    }

    let hi = buf[marker] as u16;
    let lo = normalize_low_byte(buf[marker + 1] as i8);
    Decoded::Sample {
        sample: TelemetrySample::new(hi * 256 + lo),
        consumed: buf.len(),
    }
}

/// Device-side encoding of a reading: big-endian value followed by two filler bytes.
pub fn encode_telemetry(value: u16) -> Bytes {
    let [hi, lo] = value.to_be_bytes();
    Bytes::copy_from_slice(&[hi, lo, 0x00, 0x00])
}

/// The low byte arrives as a signed 8-bit reading and is folded back into 0..=255.
fn normalize_low_byte(raw: i8) -> u16 {
    if raw < 0 {
        (raw as i16 + 256) as u16
    } else {
        raw as u16
    }
}

/// Accumulates raw reads and yields telemetry samples as they complete.
#[derive(Debug, Default)]
pub struct TelemetryDecoder {
    buffer: BytesMut,
}

impl TelemetryDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_sample(&mut self) -> Option<TelemetrySample> {
        match decode_telemetry(&self.buffer) {
            Decoded::Sample { sample, consumed } => {
                self.buffer.advance(consumed);
                Some(sample)
            }
            Decoded::NeedMoreData { discard } => {
                self.buffer.advance(discard);
                None
            }
        }
    }
}

/// Step an intensity up or down, staying inside the range the hardware accepts.
pub fn adjust_intensity(value: u8, delta: i8) -> u8 {
    (value as i16 + delta as i16).clamp(INTENSITY_MIN as i16, INTENSITY_MAX as i16) as u8
}
