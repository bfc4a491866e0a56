//! The device supervisor.
//!
//! Owns the session registry: accepts appeared/vanished notices from
//! discovery, probes candidates on the blocking pool, builds sessions
//! and pumps for accepted joysticks, and tears everything down on
//! device loss or daemon shutdown. Ids are monotonic and never reused.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use jsprog_engine::{Engine, Session};
use jsprog_input::{probe, ControlRegistry, InputError};
use jsprog_types::{DeviceId, DeviceSnapshot};

use crate::daemon::DaemonEvent;
use crate::dbus::MonitorEvent;
use crate::pump;

pub struct Supervisor {
    engine: Engine,
    sessions: HashMap<DeviceId, std::rc::Rc<Session>>,
    pumps: HashMap<DeviceId, JoinHandle<()>>,
    by_path: HashMap<PathBuf, DeviceId>,
    next_id: u32,
    events: mpsc::Sender<DaemonEvent>,
    monitor: mpsc::UnboundedSender<MonitorEvent>,
}

impl Supervisor {
    pub fn new(
        engine: Engine,
        events: mpsc::Sender<DaemonEvent>,
        monitor: mpsc::UnboundedSender<MonitorEvent>,
    ) -> Self {
        Self {
            engine,
            sessions: HashMap::new(),
            pumps: HashMap::new(),
            by_path: HashMap::new(),
            next_id: 1,
            events,
            monitor,
        }
    }

    pub fn session(&self, id: DeviceId) -> Option<&std::rc::Rc<Session>> {
        self.sessions.get(&id)
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let mut snapshots: Vec<DeviceSnapshot> =
            self.sessions.values().map(|s| s.snapshot()).collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    /// Probe a candidate node and build a session if it is a joystick.
    /// Duplicate notices for a path with a live session are ignored.
    pub async fn add_device(&mut self, path: PathBuf) {
        if self.by_path.contains_key(&path) {
            debug!(path = %path.display(), "device already tracked");
            return;
        }

        let probe_path = path.clone();
        let probed = tokio::task::spawn_blocking(move || probe::probe(&probe_path)).await;
        let probed = match probed {
            Ok(Ok(probed)) => probed,
            Ok(Err(InputError::NotJoystick(reason))) => {
                debug!(reason, "device rejected");
                return;
            }
            Ok(Err(e)) => {
                warn!(path = %path.display(), error = %e, "could not open device");
                return;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "device probe task failed");
                return;
            }
        };

        let id = DeviceId(self.next_id);
        self.next_id += 1;

        let registry = ControlRegistry::new(
            probed.keys.iter().copied(),
            probed
                .axes
                .iter()
                .map(|a| (a.code, a.value, a.minimum, a.maximum)),
        );
        let session = match Session::new(&self.engine, id, probed.meta, registry) {
            Ok(session) => session,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not create session");
                return;
            }
        };

        let pump = tokio::task::spawn_local(pump::run(probed.device, id, self.events.clone()));

        let snapshot = session.snapshot();
        self.sessions.insert(id, session);
        self.pumps.insert(id, pump);
        self.by_path.insert(path.clone(), id);
        let _ = self.monitor.send(MonitorEvent::DeviceAdded(snapshot));
        info!(id = %id, path = %path.display(), "joystick added");
    }

    /// Handle a vanished device node.
    pub fn remove_path(&mut self, path: &Path) {
        if let Some(id) = self.by_path.remove(path) {
            self.teardown(id);
        }
    }

    /// Handle end-of-stream from a pump.
    pub fn remove_device(&mut self, id: DeviceId) {
        self.by_path.retain(|_, session_id| *session_id != id);
        self.teardown(id);
    }

    /// Close every session.
    pub fn shutdown(&mut self) {
        let ids: Vec<DeviceId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.teardown(id);
        }
        self.by_path.clear();
        info!("all sessions closed");
    }

    fn teardown(&mut self, id: DeviceId) {
        if let Some(pump) = self.pumps.remove(&id) {
            pump.abort();
        }
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        session.destroy();
        let _ = self.monitor.send(MonitorEvent::DeviceRemoved(id));
    }
}
