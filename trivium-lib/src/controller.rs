//! The control task and its handle.
//!
//! [`ControllerBuilder::spawn`] starts one tokio task that owns both device
//! slots. Callers talk to it through a cloneable [`ControllerHandle`]; every
//! request carries a oneshot reply so requests for a slot are applied in call
//! order. Connect attempts, session timers and telemetry readers run on their
//! own tasks and report back through an internal loopback channel.

use std::sync::Arc;

use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::engine::{Message, SessionEngine};
use crate::error::{Result, TriviumError};
use crate::event::EventReceiver;
use crate::recorder::SessionRecorder;
use crate::slot::{Patient, SlotId, SlotSnapshot};
use crate::transport::{Connector, DeviceTarget};

const COMMAND_QUEUE_DEPTH: usize = 64;

/// A connect task in flight. Only its result may install a connection.
struct ConnectAttempt {
    id: u64,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
enum ControlCommand {
    Connect {
        slot: SlotId,
        target: DeviceTarget,
    },
    Start {
        slot: SlotId,
        intensity: u8,
        duration_min: u8,
        reply: oneshot::Sender<Result<bool>>,
    },
    Stop {
        slot: SlotId,
        reply: oneshot::Sender<()>,
    },
    RequestBattery {
        slot: SlotId,
        reply: oneshot::Sender<Result<()>>,
    },
    AssignPatient {
        slot: SlotId,
        patient: Option<Patient>,
        reply: oneshot::Sender<()>,
    },
    Disconnect {
        slot: SlotId,
        reply: oneshot::Sender<()>,
    },
    LinkLost {
        slot: SlotId,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        slot: SlotId,
        reply: oneshot::Sender<SlotSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Configures and starts the control task.
pub struct ControllerBuilder<C> {
    connector: C,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    recorder: Option<Arc<dyn SessionRecorder>>,
}

impl<C: Connector> ControllerBuilder<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            recorder: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn recorder(mut self, recorder: impl SessionRecorder) -> Self {
        self.recorder = Some(Arc::new(recorder));
        self
    }

    /// Spawn the control task on the current runtime.
    pub fn spawn(self) -> (ControllerHandle, EventReceiver) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (loopback_tx, loopback_rx) = mpsc::unbounded_channel();

        let engine = SessionEngine::new(
            self.config,
            self.clock,
            self.recorder,
            event_tx,
            loopback_tx.clone(),
        );
        let actor = ControlActor {
            engine,
            connector: Arc::new(self.connector),
            commands: command_rx,
            loopback_rx,
            loopback_tx,
            connecting: [None, None],
            next_attempt: 0,
        };
        tokio::spawn(actor.run());

        (ControllerHandle { inbox: command_tx }, event_rx)
    }
}

/// Cloneable handle to the control task.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    inbox: mpsc::Sender<ControlCommand>,
}

impl ControllerHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ControlCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(build(tx))
            .await
            .map_err(|_| TriviumError::ControllerClosed)?;
        rx.await.map_err(|_| TriviumError::ControllerClosed)
    }

    /// Begin connecting `slot` to `target`. Returns once the attempt is
    /// queued; the outcome arrives as `DeviceConnected` or `ConnectionFailed`.
    pub async fn connect(&self, slot: SlotId, target: DeviceTarget) -> Result<()> {
        self.inbox
            .send(ControlCommand::Connect { slot, target })
            .await
            .map_err(|_| TriviumError::ControllerClosed)
    }

    /// Start a session or update the running one's intensity. `Ok(true)` means
    /// a new session started.
    pub async fn start(&self, slot: SlotId, intensity: u8, duration_min: u8) -> Result<bool> {
        self.request(|reply| ControlCommand::Start {
            slot,
            intensity,
            duration_min,
            reply,
        })
        .await?
    }

    pub async fn stop(&self, slot: SlotId) -> Result<()> {
        self.request(|reply| ControlCommand::Stop { slot, reply }).await
    }

    pub async fn request_battery(&self, slot: SlotId) -> Result<()> {
        self.request(|reply| ControlCommand::RequestBattery { slot, reply })
            .await?
    }

    pub async fn assign_patient(&self, slot: SlotId, patient: Patient) -> Result<()> {
        self.request(|reply| ControlCommand::AssignPatient {
            slot,
            patient: Some(patient),
            reply,
        })
        .await
    }

    pub async fn clear_patient(&self, slot: SlotId) -> Result<()> {
        self.request(|reply| ControlCommand::AssignPatient {
            slot,
            patient: None,
            reply,
        })
        .await
    }

    pub async fn disconnect(&self, slot: SlotId) -> Result<()> {
        self.request(|reply| ControlCommand::Disconnect { slot, reply })
            .await
    }

    /// Report that the link of `slot` dropped outside our control.
    pub async fn link_lost(&self, slot: SlotId) -> Result<()> {
        self.request(|reply| ControlCommand::LinkLost { slot, reply })
            .await
    }

    pub async fn snapshot(&self, slot: SlotId) -> Result<SlotSnapshot> {
        self.request(|reply| ControlCommand::Snapshot { slot, reply })
            .await
    }

    /// Stop all background work, close both connections and end the control task.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| ControlCommand::Shutdown { reply }).await
    }
}

struct ControlActor<C> {
    engine: SessionEngine,
    connector: Arc<C>,
    commands: mpsc::Receiver<ControlCommand>,
    loopback_rx: mpsc::UnboundedReceiver<Message>,
    loopback_tx: mpsc::UnboundedSender<Message>,
    connecting: [Option<ConnectAttempt>; 2],
    next_attempt: u64,
}

impl<C: Connector> ControlActor<C> {
    async fn run(mut self) {
        info!("Controller started");

        loop {
            select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("All controller handles dropped");
                        self.shutdown().await;
                        break;
                    };
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
                Some(message) = self.loopback_rx.recv() => {
                    if self.is_current(&message) {
                        self.engine.handle(message).await;
                    }
                }
            }
        }

        info!("Controller stopped");
    }

    /// Returns `false` when the control task should exit.
    async fn handle_command(&mut self, cmd: ControlCommand) -> bool {
        match cmd {
            ControlCommand::Connect { slot, target } => self.connect(slot, target),
            ControlCommand::Start {
                slot,
                intensity,
                duration_min,
                reply,
            } => {
                let result = self.engine.start(slot, intensity, duration_min).await;
                let _ = reply.send(result);
            }
            ControlCommand::Stop { slot, reply } => {
                self.engine.stop(slot).await;
                let _ = reply.send(());
            }
            ControlCommand::RequestBattery { slot, reply } => {
                let result = self.engine.request_battery(slot).await;
                let _ = reply.send(result);
            }
            ControlCommand::AssignPatient {
                slot,
                patient,
                reply,
            } => {
                self.engine.assign_patient(slot, patient);
                let _ = reply.send(());
            }
            ControlCommand::Disconnect { slot, reply } => {
                self.abort_connect(slot);
                self.engine.disconnect(slot).await;
                let _ = reply.send(());
            }
            ControlCommand::LinkLost { slot, reply } => {
                self.engine.link_lost(slot).await;
                let _ = reply.send(());
            }
            ControlCommand::Snapshot { slot, reply } => {
                let _ = reply.send(self.engine.snapshot(slot));
            }
            ControlCommand::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn connect(&mut self, slot: SlotId, target: DeviceTarget) {
        // a newer request for the same slot supersedes one still in flight
        self.abort_connect(slot);

        info!(slot = %slot, address = %target.address, "Connecting");
        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let connector = Arc::clone(&self.connector);
        let loopback = self.loopback_tx.clone();
        let handle = tokio::spawn(async move {
            let result = connector.connect(&target).await;
            let _ = loopback.send(Message::Connected {
                slot,
                attempt,
                target,
                result,
            });
        });
        self.connecting[slot.index()] = Some(ConnectAttempt { id: attempt, handle });
    }

    /// Forget the attempt in flight for `slot`. A result it already queued is
    /// dropped by [`Self::is_current`].
    fn abort_connect(&mut self, slot: SlotId) {
        if let Some(attempt) = self.connecting[slot.index()].take() {
            attempt.handle.abort();
        }
    }

    /// `false` for connect results of an attempt that was superseded or
    /// cancelled; everything else goes to the engine.
    fn is_current(&mut self, message: &Message) -> bool {
        let Message::Connected { slot, attempt, .. } = message else {
            return true;
        };
        let pending = &mut self.connecting[slot.index()];
        if pending.as_ref().map(|a| a.id) == Some(*attempt) {
            *pending = None;
            true
        } else {
            debug!(slot = %slot, attempt, "Dropping stale connect result");
            false
        }
    }

    async fn shutdown(&mut self) {
        for slot in SlotId::ALL {
            self.abort_connect(slot);
        }
        self.engine.shutdown().await;
    }
}
