//! Background battery telemetry reader.
//!
//! A reader owns the input stream of one connection for as long as it runs.
//! It never looks at the slot: everything it learns is posted to the control
//! task, which decides when monitoring stops. Cancelling a reader hands the
//! stream back so the next reader on the same connection can resume.

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::engine::Message;
use crate::error::TriviumError;
use crate::frame::TelemetryDecoder;
use crate::slot::SlotId;
use crate::transport::BoxedReader;

pub(crate) struct TelemetryReader {
    id: u64,
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<Option<BoxedReader>>,
}

impl TelemetryReader {
    pub(crate) fn spawn(
        id: u64,
        slot: SlotId,
        stream: BoxedReader,
        buffer_size: usize,
        loopback: mpsc::UnboundedSender<Message>,
    ) -> Self {
        let (cancel, cancelled) = oneshot::channel();
        let handle = tokio::spawn(read_loop(id, slot, stream, buffer_size, cancelled, loopback));
        debug!(slot = %slot, reader = id, "Telemetry reader started");
        Self { id, cancel, handle }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Stop the reader and take back its stream, if it still has one.
    ///
    /// The pending read is dropped, so this returns without waiting for data.
    pub(crate) async fn cancel(self) -> Option<BoxedReader> {
        let _ = self.cancel.send(());
        match self.handle.await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(reader = self.id, "Telemetry reader task failed: {e}");
                None
            }
        }
    }
}

async fn read_loop(
    id: u64,
    slot: SlotId,
    mut stream: BoxedReader,
    buffer_size: usize,
    mut cancelled: oneshot::Receiver<()>,
    loopback: mpsc::UnboundedSender<Message>,
) -> Option<BoxedReader> {
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut decoder = TelemetryDecoder::new();

    loop {
        let read = tokio::select! {
            biased;
            // a dropped sender counts as a cancellation too
            _ = &mut cancelled => None,
            read = stream.read(&mut buf) => Some(read),
        };

        let error = match read {
            None => {
                debug!(slot = %slot, reader = id, "Telemetry reader cancelled");
                return Some(stream);
            }
            Some(Ok(0)) => "end of stream".to_string(),
            Some(Ok(n)) => {
                trace!(slot = %slot, bytes = hex::encode(&buf[..n]), "Telemetry read");
                decoder.push(&buf[..n]);
                while let Some(sample) = decoder.next_sample() {
                    let message = Message::Telemetry {
                        slot,
                        reader_id: id,
                        sample,
                    };
                    if loopback.send(message).is_err() {
                        return Some(stream);
                    }
                }
                continue;
            }
            Some(Err(e)) => TriviumError::ReadFailed(e.to_string()).to_string(),
        };

        warn!(slot = %slot, reader = id, "Telemetry reader stopped: {error}");
        let _ = loopback.send(Message::ReaderExited {
            slot,
            reader_id: id,
            error,
        });
        return None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{BatteryLevel, encode_telemetry};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_reader_posts_samples_and_returns_stream_on_cancel() {
        let (host, mut device) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let reader = TelemetryReader::spawn(7, SlotId::Two, Box::new(host), 28, tx);
        device.write_all(&encode_telemetry(900)).await.unwrap();

        match rx.recv().await.unwrap() {
            Message::Telemetry {
                slot,
                reader_id,
                sample,
            } => {
                assert_eq!(slot, SlotId::Two);
                assert_eq!(reader_id, 7);
                assert_eq!(sample.value, 900);
                assert_eq!(sample.level, BatteryLevel::High);
            }
            other => panic!("unexpected message {other:?}"),
        }

        assert!(reader.cancel().await.is_some());
    }

    #[tokio::test]
    async fn test_reader_reports_closed_stream() {
        let (host, device) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let reader = TelemetryReader::spawn(1, SlotId::One, Box::new(host), 28, tx);
        drop(device);

        match rx.recv().await.unwrap() {
            Message::ReaderExited { reader_id, .. } => assert_eq!(reader_id, 1),
            other => panic!("unexpected message {other:?}"),
        }
        assert!(reader.cancel().await.is_none());
    }
}
