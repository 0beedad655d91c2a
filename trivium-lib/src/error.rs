use std::io;
use thiserror::Error;

use crate::slot::SlotId;

/// The primary error type for the `trivium-lib` library.
#[derive(Error, Debug)]
pub enum TriviumError {
    #[error("Device {slot} is not connected")]
    NotConnected { slot: SlotId },

    #[error("Failed to send frame: {0}")]
    SendFailed(String),

    #[error("Failed to read telemetry: {0}")]
    ReadFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Value {value} does not fit in {digits} ASCII digits")]
    FieldOverflow { value: u32, digits: usize },

    #[error("Session record could not be stored: {0}")]
    Record(String),

    #[error("Controller task is no longer running")]
    ControllerClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TriviumError>;
