use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use rusb::Context;

use crate::aoa;
use crate::hotplug::Event;
use crate::relay::{self, Halt, RelaySetup};
use crate::subnet::{network_base, phone_address, SubnetPool};
use crate::usb::AccessoryLink;
use crate::Config;

/// Deferred-setup debounce: lets the event loop unwind the add event
/// before control transfers or relay threads start.
pub const SETUP_DELAY: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Candidate,
    Accessory,
}

impl Mode {
    fn label(self) -> &'static str {
        match self {
            Mode::Candidate => "candidate",
            Mode::Accessory => "Android Open Accessory",
        }
    }
}

/// One tracked USB device, keyed by its physical port. Candidates hold the
/// probe-time handle until their deferred AOA setup runs; accessory
/// devices hold the setup thread that owns TUN + USB resources.
pub struct Device {
    port_id: String,
    vid: u16,
    pid: u16,
    bus: u8,
    addr: u8,
    mode: Mode,
    subnet: u8,
    usb: rusb::Device<Context>,
    probe_handle: Option<AccessoryLink>,
    halt: Arc<Halt>,
    worker: Option<JoinHandle<()>>,
}

pub struct Tracker {
    config: Config,
    devices: HashMap<String, Device>,
    pending: Vec<(Instant, String)>,
    events: Sender<Event>,
}

/// True when (vid, pid) matches the target the operator asked to tether
/// (pid 0 means any product under the vendor).
pub fn matches_target(config: &Config, vid: u16, pid: u16) -> bool {
    vid == config.vid && (config.pid == 0 || pid == config.pid)
}

impl Tracker {
    pub fn new(config: Config, events: Sender<Event>) -> Self {
        Self { config, devices: HashMap::new(), pending: Vec::new(), events }
    }

    pub fn on_added(
        &mut self,
        device: rusb::Device<Context>,
        vid: u16,
        pid: u16,
        bus: u8,
        addr: u8,
        port_id: &str,
    ) {
        if matches_target(&self.config, vid, pid) {
            self.track(Mode::Candidate, device.clone(), vid, pid, bus, addr, port_id);
        }
        if aoa::is_accessory_id(vid, pid) {
            self.track(Mode::Accessory, device, vid, pid, bus, addr, port_id);
        }
    }

    /// Unknown ports are a no-op; the subnet mapping outlives the device so
    /// a reconnect keeps its addresses.
    pub fn on_removed(&mut self, port_id: &str) {
        if self.devices.contains_key(port_id) {
            self.untrack(port_id);
        }
    }

    /// Relay setup died before its workers existed; drop the device. Other
    /// devices are unaffected.
    pub fn on_setup_failed(&mut self, port_id: &str) {
        if self.devices.contains_key(port_id) {
            self.untrack(port_id);
        }
    }

    fn track(
        &mut self,
        mode: Mode,
        device: rusb::Device<Context>,
        vid: u16,
        pid: u16,
        bus: u8,
        addr: u8,
        port_id: &str,
    ) {
        if self.devices.contains_key(port_id) {
            warn!("device already tracked: {}", port_id);
            return;
        }

        let probe_handle = match mode {
            Mode::Candidate => match probe_candidate(&device, bus, addr) {
                Ok(link) => Some(link),
                // Unsupported or unreachable: never tracked, wait for the
                // next hot-plug cycle.
                Err(e) => {
                    error!("[{:03},{:03}] AOA probing failed: {}", bus, addr, e);
                    return;
                }
            },
            Mode::Accessory => None,
        };

        self.pending.push((Instant::now() + SETUP_DELAY, port_id.to_string()));
        self.devices.insert(
            port_id.to_string(),
            Device {
                port_id: port_id.to_string(),
                vid,
                pid,
                bus,
                addr,
                mode,
                subnet: 0,
                usb: device,
                probe_handle,
                halt: Arc::new(Halt::new()),
                worker: None,
            },
        );
        info!(
            "device 0x{:04x}:0x{:04x} [{:03}:{:03}]: tracked ({})",
            vid,
            pid,
            bus,
            addr,
            mode.label()
        );
    }

    fn untrack(&mut self, port_id: &str) {
        let Some(mut device) = self.devices.remove(port_id) else {
            return;
        };
        self.pending.retain(|(_, p)| p != port_id);
        device.halt.raise();
        if let Some(worker) = device.worker.take() {
            let _ = worker.join();
        }
        info!(
            "device 0x{:04x}:0x{:04x} [{:03}:{:03}]: untracked ({})",
            device.vid,
            device.pid,
            device.bus,
            device.addr,
            device.mode.label()
        );
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|(t, _)| *t).min()
    }

    pub fn run_due_setups(&mut self, now: Instant, pool: &mut SubnetPool) {
        let mut due = Vec::new();
        self.pending.retain(|(t, p)| {
            if *t <= now {
                due.push(p.clone());
                false
            } else {
                true
            }
        });
        for port_id in due {
            self.run_setup(&port_id, pool);
        }
    }

    fn run_setup(&mut self, port_id: &str, pool: &mut SubnetPool) {
        let Some(device) = self.devices.get_mut(port_id) else {
            return;
        };
        let (bus, addr) = (device.bus, device.addr);

        // Exhaustion leaves the device tracked but idle.
        let Some(subnet) = pool.allocate(port_id) else {
            error!("[{:03},{:03}] subnet allocation failed", bus, addr);
            return;
        };
        device.subnet = subnet;
        info!("[{:03},{:03}] subnet allocated: {}", bus, addr, network_base(subnet));

        match device.mode {
            Mode::Candidate => {
                let Some(link) = device.probe_handle.take() else {
                    return;
                };
                let result = aoa::switch_to_accessory(&link, &phone_address(subnet), bus, addr);
                // Close the handle either way; on success the phone is
                // about to drop off the bus and re-enumerate.
                drop(link);
                if let Err(e) = result {
                    error!("[{:03},{:03}] accessory initialization failed: {}", bus, addr, e);
                    self.untrack(port_id);
                }
            }
            Mode::Accessory => {
                let setup = RelaySetup {
                    device: device.usb.clone(),
                    port_id: device.port_id.clone(),
                    bus,
                    addr,
                    subnet: device.subnet,
                    uplink: self.config.uplink.clone(),
                    halt: Arc::clone(&device.halt),
                    events: self.events.clone(),
                };
                device.worker = Some(relay::spawn(setup));
            }
        }
    }

    /// Signal-driven teardown, phase one: flip every halt flag so workers
    /// start winding down while the loop finishes its last iteration.
    pub fn halt_all(&self) {
        for device in self.devices.values() {
            device.halt.raise();
        }
    }

    /// Phase two: join and release everything.
    pub fn shutdown(&mut self) {
        let ports: Vec<String> = self.devices.keys().cloned().collect();
        for port_id in ports {
            self.untrack(&port_id);
        }
    }
}

fn probe_candidate(
    device: &rusb::Device<Context>,
    bus: u8,
    addr: u8,
) -> crate::usb::Result<AccessoryLink> {
    info!("[{:03},{:03}] checking AOA support...", bus, addr);
    let mut link = AccessoryLink::open(device)?;
    link.detach_kernel_driver()?;
    let version = aoa::probe(&link)?;
    info!("[{:03},{:03}] device supports AOA {}", bus, addr, version);
    Ok(link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn test_config() -> Config {
        Config { vid: 0x18D1, pid: 0, uplink: "eth0".to_string() }
    }

    #[test]
    fn test_matches_target_any_pid() {
        let config = test_config();
        assert!(matches_target(&config, 0x18D1, 0x4EE7));
        assert!(matches_target(&config, 0x18D1, 0x0001));
        assert!(!matches_target(&config, 0x04E8, 0x4EE7));
    }

    #[test]
    fn test_matches_target_exact_pid() {
        let config = Config { vid: 0x18D1, pid: 0x4EE7, uplink: "eth0".to_string() };
        assert!(matches_target(&config, 0x18D1, 0x4EE7));
        assert!(!matches_target(&config, 0x18D1, 0x4EE8));
    }

    #[test]
    fn test_remove_unknown_port_is_noop() {
        let (tx, _rx) = mpsc::channel();
        let mut tracker = Tracker::new(test_config(), tx);
        tracker.on_removed("/p/1-1");
        tracker.on_setup_failed("/p/1-1");
        assert!(tracker.next_deadline().is_none());
    }

    #[test]
    fn test_shutdown_with_no_devices() {
        let (tx, _rx) = mpsc::channel();
        let mut tracker = Tracker::new(test_config(), tx);
        tracker.halt_all();
        tracker.shutdown();
    }
}
