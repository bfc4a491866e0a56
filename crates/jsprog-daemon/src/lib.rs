//! The jsprog daemon.
//!
//! Wires the pieces together: the engine with its uinput-backed output
//! device, the `/dev/input` watch, the device supervisor with one event
//! pump per joystick, and the session-bus facade. Everything runs on a
//! single thread inside a tokio `LocalSet`; only device probing is
//! pushed onto the blocking pool.

pub mod config;
pub mod daemon;
pub mod dbus;
pub mod discovery;
pub mod error;
pub mod profile;
pub mod pump;
pub mod supervisor;

pub use config::Config;
pub use daemon::{Daemon, DaemonEvent, IpcRequest};
pub use error::DaemonError;

use anyhow::anyhow;
use jsprog_engine::Engine;
use jsprog_input::{OutputDevice, UinputWriter};
use tokio::sync::mpsc;
use tracing::info;

/// Bring the daemon up and run it until an exit request.
pub async fn run(config: Config) -> Result<(), DaemonError> {
    let identity = config.output.identity();
    let writer = tokio::task::spawn_blocking(move || UinputWriter::create(&identity))
        .await
        .map_err(|e| DaemonError::Other(anyhow!("output device task failed: {e}")))??;
    let engine = Engine::new(OutputDevice::new(Box::new(writer)));

    let (monitor_tx, monitor_rx) = mpsc::unbounded_channel();
    let mut daemon = Daemon::new(engine, monitor_tx);
    let events = daemon.event_sender();

    let _watcher = discovery::start(config.daemon.device_dir.clone(), events.clone()).await?;
    let (_connection, hub_task) = dbus::serve(events, monitor_rx).await?;

    info!("jsprog daemon started");
    let result = daemon.run().await;
    hub_task.abort();
    result
}
