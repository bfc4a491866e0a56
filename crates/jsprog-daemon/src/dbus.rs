//! The session-bus facade.
//!
//! One object at a well-known name translates bus calls into daemon
//! operations and fans control-change notifications out to subscribed
//! listeners. Listener callbacks that fail drop that listener; device
//! removal drops all of a device's listeners.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zbus::object_server::SignalEmitter;
use zvariant::OwnedObjectPath;

use jsprog_types::{DeviceId, DeviceSnapshot};

use crate::daemon::{DaemonEvent, IpcRequest};
use crate::error::DaemonError;

pub const BUS_NAME: &str = "org.jsprog.JSProg";
pub const OBJECT_PATH: &str = "/org/jsprog/JSProg";

/// Control-change notifications flowing from the core to the bus.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    DeviceAdded(DeviceSnapshot),
    DeviceRemoved(DeviceId),
    KeyPressed { id: DeviceId, code: u16 },
    KeyReleased { id: DeviceId, code: u16 },
    AxisChanged { id: DeviceId, code: u16, value: i32 },
}

/// Remote listener objects receiving monitor callbacks.
#[zbus::proxy(interface = "org.jsprog.JSProgListener")]
trait JsProgListener {
    fn key_pressed(&self, id: u32, code: u16) -> zbus::Result<()>;
    fn key_released(&self, id: u32, code: u16) -> zbus::Result<()>;
    fn axis_changed(&self, id: u32, code: u16, value: i32) -> zbus::Result<()>;
}

enum MonitorCmd {
    Subscribe {
        id: u32,
        destination: String,
        path: OwnedObjectPath,
        reply: oneshot::Sender<bool>,
    },
    Unsubscribe {
        id: u32,
        path: OwnedObjectPath,
    },
}

/// Handle for mutating the subscription table from bus methods.
#[derive(Clone)]
pub struct MonitorHandle {
    commands: mpsc::Sender<MonitorCmd>,
}

impl MonitorHandle {
    async fn subscribe(&self, id: u32, destination: String, path: OwnedObjectPath) -> bool {
        let (reply, result) = oneshot::channel();
        if self
            .commands
            .send(MonitorCmd::Subscribe {
                id,
                destination,
                path,
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        result.await.unwrap_or(false)
    }

    async fn unsubscribe(&self, id: u32, path: OwnedObjectPath) {
        let _ = self.commands.send(MonitorCmd::Unsubscribe { id, path }).await;
    }
}

/// The bus object.
pub struct JsProgService {
    events: mpsc::Sender<DaemonEvent>,
    monitor: MonitorHandle,
}

impl JsProgService {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> IpcRequest,
        fallback: T,
    ) -> T {
        let (reply, result) = oneshot::channel();
        if self
            .events
            .send(DaemonEvent::Ipc(build(reply)))
            .await
            .is_err()
        {
            return fallback;
        }
        result.await.unwrap_or(fallback)
    }
}

#[zbus::interface(name = "org.jsprog.JSProg")]
impl JsProgService {
    /// Enumerate the joysticks the daemon currently manages.
    async fn list_devices(&self) -> Vec<DeviceSnapshot> {
        self.request(|reply| IpcRequest::ListDevices { reply }, Vec::new())
            .await
    }

    /// Load a profile onto a device. False for unknown ids, malformed
    /// XML or profiles that fail to compile.
    async fn load_profile(&self, id: u32, profile_xml: String) -> bool {
        self.request(
            |reply| IpcRequest::LoadProfile {
                id,
                xml: profile_xml,
                reply,
            },
            false,
        )
        .await
    }

    /// Subscribe a listener object to control-change callbacks for one
    /// device.
    async fn start_monitor(
        &self,
        id: u32,
        caller_name: String,
        listener_path: OwnedObjectPath,
    ) -> bool {
        let known = self
            .request(|reply| IpcRequest::HasDevice { id, reply }, false)
            .await;
        if !known {
            return false;
        }
        debug!(id, listener = %listener_path, "monitor subscription");
        self.monitor.subscribe(id, caller_name, listener_path).await
    }

    /// Drop a listener subscription.
    async fn stop_monitor(&self, id: u32, listener_path: OwnedObjectPath) {
        self.monitor.unsubscribe(id, listener_path).await;
    }

    /// Request orderly daemon shutdown.
    async fn exit(&self) {
        info!("exit requested over the bus");
        let _ = self.events.send(DaemonEvent::Ipc(IpcRequest::Exit)).await;
    }

    #[zbus(signal)]
    async fn device_added(
        emitter: &SignalEmitter<'_>,
        device: DeviceSnapshot,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn device_removed(emitter: &SignalEmitter<'_>, id: u32) -> zbus::Result<()>;
}

struct Listener {
    path: OwnedObjectPath,
    proxy: JsProgListenerProxy<'static>,
}

/// Owns the subscription table and delivers monitor callbacks.
struct MonitorHub {
    connection: zbus::Connection,
    events: mpsc::UnboundedReceiver<MonitorEvent>,
    commands: mpsc::Receiver<MonitorCmd>,
    listeners: HashMap<u32, Vec<Listener>>,
}

impl MonitorHub {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: MonitorCmd) {
        match command {
            MonitorCmd::Subscribe {
                id,
                destination,
                path,
                reply,
            } => {
                let built = async {
                    JsProgListenerProxy::builder(&self.connection)
                        .destination(destination)?
                        .path(path.clone())?
                        .build()
                        .await
                }
                .await;
                match built {
                    Ok(proxy) => {
                        self.listeners
                            .entry(id)
                            .or_default()
                            .push(Listener { path, proxy });
                        let _ = reply.send(true);
                    }
                    Err(e) => {
                        warn!(id, error = %e, "failed to build listener proxy");
                        let _ = reply.send(false);
                    }
                }
            }
            MonitorCmd::Unsubscribe { id, path } => {
                if let Some(list) = self.listeners.get_mut(&id) {
                    list.retain(|l| l.path != path);
                    if list.is_empty() {
                        self.listeners.remove(&id);
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: MonitorEvent) {
        match event {
            MonitorEvent::DeviceAdded(snapshot) => {
                if let Err(e) = self.emit_added(snapshot).await {
                    warn!(error = %e, "failed to emit device_added");
                }
            }
            MonitorEvent::DeviceRemoved(id) => {
                self.listeners.remove(&id.0);
                if let Err(e) = self.emit_removed(id.0).await {
                    warn!(error = %e, "failed to emit device_removed");
                }
            }
            MonitorEvent::KeyPressed { id, code } => self.deliver(id.0, |l| {
                let proxy = l.proxy.clone();
                async move { proxy.key_pressed(id.0, code).await }
            })
            .await,
            MonitorEvent::KeyReleased { id, code } => self.deliver(id.0, |l| {
                let proxy = l.proxy.clone();
                async move { proxy.key_released(id.0, code).await }
            })
            .await,
            MonitorEvent::AxisChanged { id, code, value } => self.deliver(id.0, |l| {
                let proxy = l.proxy.clone();
                async move { proxy.axis_changed(id.0, code, value).await }
            })
            .await,
        }
    }

    async fn emit_added(&self, snapshot: DeviceSnapshot) -> zbus::Result<()> {
        let emitter = SignalEmitter::new(&self.connection, OBJECT_PATH)?;
        JsProgService::device_added(&emitter, snapshot).await
    }

    async fn emit_removed(&self, id: u32) -> zbus::Result<()> {
        let emitter = SignalEmitter::new(&self.connection, OBJECT_PATH)?;
        JsProgService::device_removed(&emitter, id).await
    }

    /// Call every listener of a device; drop the ones whose delivery
    /// fails.
    async fn deliver<F, Fut>(&mut self, id: u32, call: F)
    where
        F: Fn(&Listener) -> Fut,
        Fut: std::future::Future<Output = zbus::Result<()>>,
    {
        let Some(list) = self.listeners.remove(&id) else {
            return;
        };
        let mut kept = Vec::with_capacity(list.len());
        for listener in list {
            match call(&listener).await {
                Ok(()) => kept.push(listener),
                Err(e) => {
                    warn!(id, listener = %listener.path, error = %e,
                        "listener callback failed, dropping listener");
                }
            }
        }
        if !kept.is_empty() {
            self.listeners.insert(id, kept);
        }
    }
}

/// Connect to the session bus, claim the well-known name and start the
/// monitor hub.
pub async fn serve(
    events: mpsc::Sender<DaemonEvent>,
    monitor_events: mpsc::UnboundedReceiver<MonitorEvent>,
) -> Result<(zbus::Connection, JoinHandle<()>), DaemonError> {
    let (commands_tx, commands_rx) = mpsc::channel(16);
    let service = JsProgService {
        events,
        monitor: MonitorHandle {
            commands: commands_tx,
        },
    };

    let connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;
    info!(name = BUS_NAME, path = OBJECT_PATH, "bus facade ready");

    let hub = MonitorHub {
        connection: connection.clone(),
        events: monitor_events,
        commands: commands_rx,
        listeners: HashMap::new(),
    };
    let task = tokio::task::spawn_local(hub.run());

    Ok((connection, task))
}
