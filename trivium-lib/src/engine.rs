//! Per-slot session state machine.
//!
//! ```text
//!            start (new session)
//!   Idle  ───────────────────────▶  Running ──┐ start: intensity update
//!    ▲                                 │  ◀──┘
//!    └──── stop / time exhausted ──────┘
//! ```
//!
//! The engine is driven by exactly one task (see [`crate::controller`]). Timer
//! loops and telemetry readers run on their own tasks and only talk back
//! through [`Message`]s, so slot state is never touched concurrently.

use std::io;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::constants::BATTERY_SETTLED_THRESHOLD;
use crate::error::{Result, TriviumError};
use crate::event::{Event, EventSender};
use crate::frame::{Command, TelemetrySample};
use crate::recorder::{SessionRecord, SessionRecorder};
use crate::slot::{DeviceSlot, Patient, SlotId, SlotSnapshot};
use crate::telemetry::TelemetryReader;
use crate::transport::{Connection, DeviceTarget};

/// Messages posted to the control task by background work.
#[derive(Debug)]
pub enum Message {
    Tick {
        slot: SlotId,
        timer_id: u64,
    },
    Telemetry {
        slot: SlotId,
        reader_id: u64,
        sample: TelemetrySample,
    },
    ReaderExited {
        slot: SlotId,
        reader_id: u64,
        error: String,
    },
    Connected {
        slot: SlotId,
        attempt: u64,
        target: DeviceTarget,
        result: io::Result<Connection>,
    },
    Recorded {
        slot: SlotId,
        result: Result<u64>,
    },
}

/// A running timer loop. Dropping it stops the loop.
struct SessionTimer {
    id: u64,
    handle: JoinHandle<()>,
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Background work and bookkeeping that belongs to one slot.
#[derive(Default)]
struct SlotTasks {
    timer: Option<SessionTimer>,
    reader: Option<TelemetryReader>,
    previous_minute: u32,
    last_charge_value: u16,
}

pub struct SessionEngine {
    slots: [DeviceSlot; 2],
    tasks: [SlotTasks; 2],
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    recorder: Option<Arc<dyn SessionRecorder>>,
    events: EventSender,
    loopback: mpsc::UnboundedSender<Message>,
    next_task_id: u64,
}

impl SessionEngine {
    pub fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        recorder: Option<Arc<dyn SessionRecorder>>,
        events: EventSender,
        loopback: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            slots: [DeviceSlot::new(), DeviceSlot::new()],
            tasks: Default::default(),
            config,
            clock,
            recorder,
            events,
            loopback,
            next_task_id: 0,
        }
    }

    pub fn slot(&self, id: SlotId) -> &DeviceSlot {
        &self.slots[id.index()]
    }

    fn slot_mut(&mut self, id: SlotId) -> &mut DeviceSlot {
        &mut self.slots[id.index()]
    }

    fn tasks_mut(&mut self, id: SlotId) -> &mut SlotTasks {
        &mut self.tasks[id.index()]
    }

    pub fn snapshot(&self, id: SlotId) -> SlotSnapshot {
        let slot = self.slot(id);
        let tasks = &self.tasks[id.index()];
        SlotSnapshot {
            slot: id,
            connected: slot.connected,
            label: slot.label(),
            battery_monitoring: slot.batt_mon,
            running: !slot.clock_stopped,
            elapsed_min: slot.elapsed_min,
            duration_min: slot.duration_min,
            intensity: slot.intensity,
            patient: slot.patient.clone(),
            timer_active: tasks.timer.is_some(),
            reader_active: tasks.reader.is_some(),
        }
    }

    fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("Event listener dropped, event discarded");
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_task_id += 1;
        self.next_task_id
    }

    async fn send(&mut self, id: SlotId, command: Command) -> Result<()> {
        let byte_delay = self.config.byte_delay();
        match self.slot_mut(id).connection.as_mut() {
            Some(connection) => connection.send(command, byte_delay).await,
            None => Err(TriviumError::NotConnected { slot: id }),
        }
    }

    /// Start a new session, or update the intensity of the running one.
    ///
    /// Returns `true` when a new session was started.
    pub async fn start(&mut self, id: SlotId, intensity: u8, duration_min: u8) -> Result<bool> {
        if !self.slot(id).connected {
            let err = TriviumError::NotConnected { slot: id };
            self.emit(Event::Error {
                slot: id,
                message: err.to_string(),
            });
            return Err(err);
        }

        let command = Command::Start {
            intensity,
            duration_min,
        };
        // reject values that cannot be encoded before anything changes
        command.to_bytes()?;

        let is_new = self.slot(id).clock_stopped;
        let slot = self.slot_mut(id);
        slot.intensity = intensity;
        slot.duration_min = duration_min;

        if let Err(err) = self.send(id, command).await {
            warn!(slot = %id, "Start frame not delivered: {err}");
            self.emit(Event::Error {
                slot: id,
                message: err.to_string(),
            });
            return Err(err);
        }

        if !is_new {
            info!(slot = %id, intensity, "Intensity updated");
            self.emit(Event::IntensityUpdated { slot: id, intensity });
            return Ok(false);
        }

        // a session that ran out of time leaves its timer and reader behind
        self.stop_timer(id);
        self.stop_reader(id).await;

        let slot = self.slot_mut(id);
        slot.elapsed_min = 0;
        slot.clock_stopped = false;
        slot.batt_mon = true;

        self.start_timer(id);
        self.start_reader(id);

        info!(slot = %id, intensity, duration_min, "Session started");
        self.emit(Event::SessionStarted { slot: id });
        self.record_session(id);
        Ok(true)
    }

    /// Send the stop command and halt the session clock. Silent no-op when
    /// the slot is not connected.
    pub async fn stop(&mut self, id: SlotId) {
        if !self.slot(id).connected {
            return;
        }

        if let Err(err) = self.send(id, Command::Stop).await {
            warn!(slot = %id, "Stop command not delivered: {err}");
        }

        self.slot_mut(id).clock_stopped = true;
        self.stop_timer(id);
        self.stop_reader(id).await;
        info!(slot = %id, "Session stopped");
    }

    /// Ask the device for a battery reading and (re)start the telemetry reader.
    pub async fn request_battery(&mut self, id: SlotId) -> Result<()> {
        if !self.slot(id).connected {
            let err = TriviumError::NotConnected { slot: id };
            self.emit(Event::Error {
                slot: id,
                message: err.to_string(),
            });
            return Err(err);
        }

        // the old reader must not swallow the reply
        self.stop_reader(id).await;
        if let Err(err) = self.send(id, Command::BatteryRequest).await {
            warn!(slot = %id, "Battery request not delivered: {err}");
            self.emit(Event::Error {
                slot: id,
                message: err.to_string(),
            });
            return Err(err);
        }
        self.slot_mut(id).batt_mon = true;
        self.start_reader(id);
        debug!(slot = %id, "Battery reading requested");
        Ok(())
    }

    pub fn assign_patient(&mut self, id: SlotId, patient: Option<Patient>) {
        match &patient {
            Some(p) => info!(slot = %id, patient = p.id, "Patient assigned"),
            None => info!(slot = %id, "Patient cleared"),
        }
        self.slot_mut(id).patient = patient;
    }

    /// Install a freshly opened connection, replacing any previous one.
    pub async fn connected(&mut self, id: SlotId, target: DeviceTarget, connection: Connection) {
        if self.slot(id).connection.is_some() {
            debug!(slot = %id, "Replacing existing connection");
            self.stop(id).await;
            self.drop_connection(id);
        }

        let label = target.label();
        self.slot_mut(id).install(target, connection);
        info!(slot = %id, device = %label, "Device connected");
        self.emit(Event::DeviceConnected { slot: id, label });
    }

    pub async fn connection_failed(&mut self, id: SlotId, message: String) {
        warn!(slot = %id, "{message}");
        self.stop(id).await;
        self.drop_connection(id);
        self.emit(Event::ConnectionFailed { slot: id, message });
    }

    /// Stop the session, close the stream and forget everything about the slot.
    pub async fn disconnect(&mut self, id: SlotId) {
        if !self.slot(id).connected {
            return;
        }
        self.stop(id).await;
        self.slot_mut(id).reset_all();
        info!(slot = %id, "Device disconnected");
        self.emit(Event::DeviceDisconnected { slot: id });
    }

    /// The link went away underneath us; nothing can be sent any more.
    pub async fn link_lost(&mut self, id: SlotId) {
        if !self.slot(id).connected {
            return;
        }
        self.slot_mut(id).clock_stopped = true;
        self.stop_timer(id);
        self.stop_reader(id).await;
        self.slot_mut(id).reset_all();
        warn!(slot = %id, "Link lost");
        self.emit(Event::DeviceDisconnected { slot: id });
    }

    /// Cancel all background work and close both connections.
    pub async fn shutdown(&mut self) {
        for id in SlotId::ALL {
            self.stop_timer(id);
            self.stop_reader(id).await;
            self.drop_connection(id);
        }
        info!("Session engine shut down");
    }

    fn drop_connection(&mut self, id: SlotId) {
        let slot = self.slot_mut(id);
        slot.reset_connection();
        slot.reset_session();
    }

    pub async fn handle(&mut self, message: Message) {
        match message {
            Message::Tick { slot, timer_id } => self.on_tick(slot, timer_id).await,
            Message::Telemetry {
                slot,
                reader_id,
                sample,
            } => self.on_telemetry(slot, reader_id, sample).await,
            Message::ReaderExited {
                slot,
                reader_id,
                error,
            } => self.on_reader_exited(slot, reader_id, error),
            Message::Connected {
                slot,
                target,
                result,
                ..
            } => match result {
                Ok(connection) => self.connected(slot, target, connection).await,
                Err(e) => {
                    let err = TriviumError::ConnectionFailed(e.to_string());
                    self.connection_failed(slot, err.to_string()).await
                }
            },
            Message::Recorded { slot, result } => match result {
                Ok(session_id) => {
                    debug!(slot = %slot, session_id, "Session recorded");
                    self.emit(Event::SessionRecorded { slot, session_id });
                }
                Err(err) => {
                    warn!(slot = %slot, "Session not recorded: {err}");
                    self.emit(Event::Error {
                        slot,
                        message: err.to_string(),
                    });
                }
            },
        }
    }

    // --- Timer ---

    fn start_timer(&mut self, id: SlotId) {
        let timer_id = self.next_id();
        let minute = self.clock.minute_of_hour();
        let interval = self.config.tick_interval();
        let loopback = self.loopback.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if loopback.send(Message::Tick { slot: id, timer_id }).is_err() {
                    break;
                }
            }
        });

        let tasks = self.tasks_mut(id);
        tasks.previous_minute = minute;
        tasks.timer = Some(SessionTimer {
            id: timer_id,
            handle,
        });
    }

    fn stop_timer(&mut self, id: SlotId) {
        self.tasks_mut(id).timer = None;
    }

    /// Elapsed time advances when the wall-clock minute differs from the one
    /// seen on the previous tick, not by measuring the tick interval.
    async fn on_tick(&mut self, id: SlotId, timer_id: u64) {
        let tasks = self.tasks_mut(id);
        if tasks.timer.as_ref().map(|t| t.id) != Some(timer_id) {
            return;
        }

        let minute = self.clock.minute_of_hour();
        let previous = std::mem::replace(&mut self.tasks_mut(id).previous_minute, minute);
        if minute == previous || self.slot(id).clock_stopped {
            return;
        }

        let slot = self.slot_mut(id);
        slot.elapsed_min += 1;
        let elapsed = slot.elapsed_min;
        let remaining = slot.remaining_min();
        debug!(slot = %id, elapsed, remaining, "Minute elapsed");
        self.emit(Event::TimeRemainingUpdated {
            slot: id,
            minutes: remaining,
        });

        let every = self.config.battery_check_interval_min;
        if every > 0 && elapsed % every == 0 {
            // failures already reach the listener as an error event
            let _ = self.request_battery(id).await;
        }

        if self.slot(id).is_time_exhausted() {
            self.slot_mut(id).clock_stopped = true;
            info!(slot = %id, "Session time exhausted");
            self.emit(Event::SessionEnded { slot: id });
        }
    }

    // --- Telemetry ---

    fn start_reader(&mut self, id: SlotId) {
        let Some(stream) = self
            .slot_mut(id)
            .connection
            .as_mut()
            .and_then(|c| c.reader.take())
        else {
            warn!(slot = %id, "No input stream available, telemetry not started");
            return;
        };

        let reader_id = self.next_id();
        let reader = TelemetryReader::spawn(
            reader_id,
            id,
            stream,
            self.config.read_buffer_size,
            self.loopback.clone(),
        );
        let tasks = self.tasks_mut(id);
        tasks.last_charge_value = 0;
        tasks.reader = Some(reader);
    }

    /// Cancel the reader, clear `batt_mon` and give the stream back to the
    /// connection it came from.
    async fn stop_reader(&mut self, id: SlotId) {
        self.slot_mut(id).batt_mon = false;
        let Some(reader) = self.tasks_mut(id).reader.take() else {
            return;
        };

        if let Some(stream) = reader.cancel().await {
            if let Some(connection) = self.slot_mut(id).connection.as_mut() {
                connection.reader = Some(stream);
            }
        }
    }

    async fn on_telemetry(&mut self, id: SlotId, reader_id: u64, sample: TelemetrySample) {
        if self.tasks[id.index()].reader.as_ref().map(|r| r.id()) != Some(reader_id) {
            return;
        }

        let tasks = self.tasks_mut(id);
        if sample.value != tasks.last_charge_value && sample.value > BATTERY_SETTLED_THRESHOLD {
            tasks.last_charge_value = sample.value;
            debug!(slot = %id, value = sample.value, "Battery reading settled, monitoring off");
            self.stop_reader(id).await;
        }

        self.emit(Event::BatteryUpdated {
            slot: id,
            value: sample.value,
            level: sample.level,
        });
    }

    fn on_reader_exited(&mut self, id: SlotId, reader_id: u64, error: String) {
        let tasks = self.tasks_mut(id);
        if tasks.reader.as_ref().map(|r| r.id()) == Some(reader_id) {
            // the stream went with it; a reconnect brings a new one
            tasks.reader = None;
            debug!(slot = %id, "Telemetry reader gone: {error}");
        }
    }

    // --- Recording ---

    fn record_session(&self, id: SlotId) {
        let Some(recorder) = self.recorder.clone() else {
            return;
        };
        let slot = self.slot(id);
        let Some(patient) = slot.patient.as_ref() else {
            debug!(slot = %id, "No patient assigned, session not recorded");
            return;
        };

        let record = SessionRecord::new(
            patient,
            slot.label().unwrap_or_default(),
            slot.intensity,
            slot.duration_min,
        );
        let loopback = self.loopback.clone();
        tokio::task::spawn_blocking(move || {
            let result = recorder.record(&record);
            let _ = loopback.send(Message::Recorded { slot: id, result });
        });
    }
}
