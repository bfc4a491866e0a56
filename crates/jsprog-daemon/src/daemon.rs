//! The daemon main loop.
//!
//! A single task owns the supervisor and drives the engine: it sleeps
//! until the nearest script-task deadline or an external wake-up (a
//! device event, a hotplug notice, a bus request), applies what
//! arrived, and runs one scheduler iteration. That keeps every piece of
//! core state on one thread and gives the output device its one
//! synchronize per iteration.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{info, warn};

use jsprog_engine::{Engine, Millis};
use jsprog_types::{ControlKind, DeviceId, DeviceSnapshot, EV_ABS, EV_KEY};

use crate::dbus::MonitorEvent;
use crate::error::DaemonError;
use crate::profile;
use crate::supervisor::Supervisor;

/// Events processed by the daemon's main loop.
pub enum DaemonEvent {
    /// A candidate device node appeared or changed attributes.
    DeviceCandidate(PathBuf),
    /// A device node disappeared.
    DeviceVanished(PathBuf),
    /// A raw input event from a live session's pump.
    DeviceInput {
        id: DeviceId,
        ev_type: u16,
        code: u16,
        value: i32,
    },
    /// A pump reached end-of-stream.
    DeviceGone(DeviceId),
    /// A request from the bus facade.
    Ipc(IpcRequest),
    /// Shutdown signal.
    Shutdown,
}

/// Bus requests, each answered through a oneshot.
pub enum IpcRequest {
    ListDevices {
        reply: oneshot::Sender<Vec<DeviceSnapshot>>,
    },
    LoadProfile {
        id: u32,
        xml: String,
        reply: oneshot::Sender<bool>,
    },
    HasDevice {
        id: u32,
        reply: oneshot::Sender<bool>,
    },
    Exit,
}

/// The core daemon.
pub struct Daemon {
    engine: Engine,
    supervisor: Supervisor,
    monitor: mpsc::UnboundedSender<MonitorEvent>,
    event_tx: mpsc::Sender<DaemonEvent>,
    event_rx: mpsc::Receiver<DaemonEvent>,
    /// Epoch of the scheduler clock.
    origin: Instant,
}

impl Daemon {
    pub fn new(engine: Engine, monitor: mpsc::UnboundedSender<MonitorEvent>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        let supervisor = Supervisor::new(engine.clone(), event_tx.clone(), monitor.clone());
        Self {
            engine,
            supervisor,
            monitor,
            event_tx,
            event_rx,
            origin: Instant::now(),
        }
    }

    /// Sender for feeding events into the daemon.
    pub fn event_sender(&self) -> mpsc::Sender<DaemonEvent> {
        self.event_tx.clone()
    }

    fn now(&self) -> Millis {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Run until an exit request.
    pub async fn run(&mut self) -> Result<(), DaemonError> {
        info!("daemon running");
        loop {
            let wake_at = self
                .engine
                .next_deadline()
                .map(|deadline| self.origin + Duration::from_millis(deadline));

            let event = match wake_at {
                Some(at) => tokio::select! {
                    event = self.event_rx.recv() => event,
                    () = tokio::time::sleep_until(at) => None,
                },
                None => self.event_rx.recv().await,
            };

            if let Some(event) = event {
                self.handle(event).await;
            }
            // Everything already queued belongs to this iteration.
            while let Ok(event) = self.event_rx.try_recv() {
                self.handle(event).await;
            }

            self.engine.run_once(self.now());
            if self.engine.is_stopped() {
                break;
            }
        }

        self.supervisor.shutdown();
        info!("daemon shut down");
        Ok(())
    }

    async fn handle(&mut self, event: DaemonEvent) {
        match event {
            DaemonEvent::DeviceCandidate(path) => self.supervisor.add_device(path).await,
            DaemonEvent::DeviceVanished(path) => self.supervisor.remove_path(&path),
            DaemonEvent::DeviceGone(id) => self.supervisor.remove_device(id),
            DaemonEvent::DeviceInput {
                id,
                ev_type,
                code,
                value,
            } => self.handle_input(id, ev_type, code, value),
            DaemonEvent::Ipc(request) => self.handle_ipc(request),
            DaemonEvent::Shutdown => {
                info!("shutting down");
                self.engine.stop();
            }
        }
    }

    /// Update control state, notify monitors and queue the handler.
    fn handle_input(&mut self, id: DeviceId, ev_type: u16, code: u16, value: i32) {
        let Some(session) = self.supervisor.session(id) else {
            return;
        };
        let kind = match ev_type {
            EV_KEY => ControlKind::Key,
            EV_ABS => ControlKind::Axis,
            _ => return,
        };

        let known = match kind {
            ControlKind::Key => session.apply_key_event(code, value != 0),
            ControlKind::Axis => session.apply_axis_event(code, value),
        };
        if !known {
            warn!(id = %id, kind = %kind, code, "event arrived for unknown control");
            return;
        }

        let notice = match kind {
            ControlKind::Key if value != 0 => MonitorEvent::KeyPressed { id, code },
            ControlKind::Key => MonitorEvent::KeyReleased { id, code },
            ControlKind::Axis => MonitorEvent::AxisChanged { id, code, value },
        };
        let _ = self.monitor.send(notice);

        if session.has_handler(kind, code) {
            self.engine.queue_event(session, ev_type, code, value);
        }
    }

    fn handle_ipc(&mut self, request: IpcRequest) {
        match request {
            IpcRequest::ListDevices { reply } => {
                let _ = reply.send(self.supervisor.snapshots());
            }
            IpcRequest::HasDevice { id, reply } => {
                let _ = reply.send(self.supervisor.session(DeviceId(id)).is_some());
            }
            IpcRequest::LoadProfile { id, xml, reply } => {
                let loaded = match self.supervisor.session(DeviceId(id)) {
                    Some(session) => match profile::parse(&xml) {
                        Ok(profile) => session.set_profile(&profile),
                        Err(e) => {
                            warn!(id, error = %e, "rejecting profile");
                            false
                        }
                    },
                    None => {
                        warn!(id, "load_profile for unknown device");
                        false
                    }
                };
                let _ = reply.send(loaded);
            }
            IpcRequest::Exit => {
                info!("exit requested");
                self.engine.stop();
            }
        }
    }
}
