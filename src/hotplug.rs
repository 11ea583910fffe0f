use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Result};
use log::{debug, error};
use rusb::{Context, Device, UsbContext};

/// Everything the event loop reacts to: kernel hot-plug traffic plus
/// setup-failure notices from relay threads.
pub enum Event {
    Added {
        device: Device<Context>,
        vid: u16,
        pid: u16,
        bus: u8,
        addr: u8,
        port_id: String,
    },
    Removed {
        port_id: String,
    },
    SetupFailed {
        port_id: String,
    },
}

/// Physical-port identifier in the kernel's sysfs naming scheme
/// ("<bus>-<port>.<port>..."), stable across re-enumerations on the same
/// port. Root hubs get the "usbN" form.
pub fn port_path(bus: u8, ports: &[u8]) -> String {
    if ports.is_empty() {
        return format!("usb{}", bus);
    }
    let chain: Vec<String> = ports.iter().map(u8::to_string).collect();
    format!("{}-{}", bus, chain.join("."))
}

struct HotplugForwarder {
    events: Sender<Event>,
}

impl rusb::Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        let desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => return,
        };
        let (vid, pid) = (desc.vendor_id(), desc.product_id());
        let (bus, addr) = (device.bus_number(), device.address());
        if vid == 0 || pid == 0 || bus == 0 || addr == 0 {
            return;
        }
        let ports = match device.port_numbers() {
            Ok(p) => p,
            Err(_) => return,
        };
        let port_id = port_path(bus, &ports);
        debug!("uevent: add {} ({:04x}:{:04x})", port_id, vid, pid);
        let _ = self.events.send(Event::Added { device, vid, pid, bus, addr, port_id });
    }

    fn device_left(&mut self, device: Device<Context>) {
        let ports = match device.port_numbers() {
            Ok(p) => p,
            Err(_) => return,
        };
        let port_id = port_path(device.bus_number(), &ports);
        debug!("uevent: remove {}", port_id);
        let _ = self.events.send(Event::Removed { port_id });
    }
}

/// Owns the thread that drives libusb's event handling. Registration uses
/// `enumerate(true)`, so every device already present is delivered as a
/// synthetic add before live events start.
pub struct HotplugWatcher {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HotplugWatcher {
    pub fn start(ctx: Context, events: Sender<Event>) -> Result<Self> {
        if !rusb::has_hotplug() {
            bail!("hotplug support is not available in this libusb build");
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = thread::spawn(move || {
            // Registered on the thread that pumps libusb events; dropping
            // the registration unregisters the callback.
            let _registration = match rusb::HotplugBuilder::new()
                .enumerate(true)
                .register(&ctx, Box::new(HotplugForwarder { events }))
            {
                Ok(r) => r,
                Err(e) => {
                    error!("registering USB hotplug callback failed: {}", e);
                    return;
                }
            };
            while !thread_stop.load(Ordering::SeqCst) {
                if let Err(e) = ctx.handle_events(Some(Duration::from_millis(500))) {
                    error!("usb event handling failed: {}", e);
                    break;
                }
            }
        });

        Ok(Self { stop, thread: Some(thread) })
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_path() {
        assert_eq!(port_path(1, &[1]), "1-1");
        assert_eq!(port_path(1, &[1, 4, 2]), "1-1.4.2");
        assert_eq!(port_path(3, &[]), "usb3");
    }
}
