//! Session recording hook.
//!
//! The controller calls the recorder once per new session (never on intensity
//! updates). Recording runs off the control task and its outcome is reported
//! as an event; it never changes the state of a slot.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TriviumError};
use crate::slot::Patient;

/// Timestamp layout used in stored records.
pub const RECORD_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One treatment session as handed to the recorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub patient_id: i64,
    pub patient_document: String,
    pub device: String,
    pub intensity: u8,
    pub duration_min: u8,
    pub recorded_at: String,
}

impl SessionRecord {
    pub fn new(patient: &Patient, device: String, intensity: u8, duration_min: u8) -> Self {
        Self {
            patient_id: patient.id,
            patient_document: patient.document_id.clone(),
            device,
            intensity,
            duration_min,
            recorded_at: chrono::Local::now().format(RECORD_TIME_FORMAT).to_string(),
        }
    }
}

/// Persists session records. Returns the id of the stored record.
pub trait SessionRecorder: Send + Sync + 'static {
    fn record(&self, record: &SessionRecord) -> Result<u64>;
}

#[derive(Debug, Serialize)]
struct StoredRecord<'a> {
    id: u64,
    #[serde(flatten)]
    record: &'a SessionRecord,
}

#[derive(Debug)]
struct RecorderFile {
    file: File,
    next_id: u64,
}

/// Appends one JSON object per session to a file.
#[derive(Debug)]
pub struct JsonLinesRecorder {
    path: PathBuf,
    state: Mutex<RecorderFile>,
}

impl JsonLinesRecorder {
    /// Open (or create) the file. Ids continue after the records already in it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let existing = match File::open(&path) {
            Ok(file) => BufReader::new(file).lines().count() as u64,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), existing, "Session log opened");
        Ok(Self {
            path,
            state: Mutex::new(RecorderFile {
                file,
                next_id: existing + 1,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionRecorder for JsonLinesRecorder {
    fn record(&self, record: &SessionRecord) -> Result<u64> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TriviumError::Record("recorder lock poisoned".to_string()))?;

        let id = state.next_id;
        let line = serde_json::to_string(&StoredRecord { id, record })?;
        writeln!(state.file, "{line}").map_err(|e| TriviumError::Record(e.to_string()))?;
        state.file.flush().map_err(|e| TriviumError::Record(e.to_string()))?;
        state.next_id += 1;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patient() -> Patient {
        Patient {
            id: 3,
            document_id: "X1234567L".to_string(),
            name: "Marta".to_string(),
        }
    }

    #[test]
    fn test_records_are_appended_with_increasing_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.jsonl");

        let recorder = JsonLinesRecorder::open(&path).unwrap();
        let first = recorder
            .record(&SessionRecord::new(&patient(), "TENS-01 (AB:CD)".into(), 5, 20))
            .unwrap();
        let second = recorder
            .record(&SessionRecord::new(&patient(), "TENS-01 (AB:CD)".into(), 6, 30))
            .unwrap();
        assert_eq!((first, second), (1, 2));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["id"], 2);
        assert_eq!(lines[1]["intensity"], 6);
        assert_eq!(lines[0]["patient_document"], "X1234567L");
    }

    #[test]
    fn test_reopen_continues_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.jsonl");

        {
            let recorder = JsonLinesRecorder::open(&path).unwrap();
            recorder
                .record(&SessionRecord::new(&patient(), "dev".into(), 1, 10))
                .unwrap();
        }

        let recorder = JsonLinesRecorder::open(&path).unwrap();
        let id = recorder
            .record(&SessionRecord::new(&patient(), "dev".into(), 1, 10))
            .unwrap();
        assert_eq!(id, 2);
    }
}
