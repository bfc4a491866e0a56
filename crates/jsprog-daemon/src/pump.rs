//! Per-device event pump.
//!
//! One task per joystick reads raw evdev events and forwards the
//! interesting ones to the daemon loop. End-of-stream means the device
//! is gone and the session gets torn down.

use evdev::Device;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use jsprog_types::{DeviceId, EV_ABS, EV_SYN};

use crate::daemon::DaemonEvent;

/// Read a device until end-of-stream, forwarding events to the daemon.
pub(crate) async fn run(device: Device, id: DeviceId, events: mpsc::Sender<DaemonEvent>) {
    let mut stream = match device.into_event_stream() {
        Ok(stream) => stream,
        Err(e) => {
            warn!(id = %id, error = %e, "failed to create device event stream");
            let _ = events.send(DaemonEvent::DeviceGone(id)).await;
            return;
        }
    };

    loop {
        match stream.next_event().await {
            Ok(event) => {
                let ev_type = event.event_type().0;
                let code = event.code();
                // EV_SYN records and the (EV_ABS, 0x05) pair carry no
                // control information; dropped as the original did.
                if ev_type == EV_SYN || (ev_type == EV_ABS && code == 0x05) {
                    continue;
                }
                debug!(id = %id, ev_type, code, value = event.value(), "device event");
                let forwarded = events
                    .send(DaemonEvent::DeviceInput {
                        id,
                        ev_type,
                        code,
                        value: event.value(),
                    })
                    .await;
                if forwarded.is_err() {
                    break;
                }
            }
            Err(e) => {
                info!(id = %id, error = %e, "joystick is gone");
                let _ = events.send(DaemonEvent::DeviceGone(id)).await;
                break;
            }
        }
    }
}
