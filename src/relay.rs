use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context as _, Result};
use log::{error, info};
use rusb::{Context, Device};

use crate::hotplug::Event;
use crate::tun::{TunDevice, TunRead};
use crate::usb::{AccessoryLink, UsbError};

/// One IP packet per transfer; AOA bulk transfers are treated atomically
/// on both sides, so this also bounds the TUN-side MTU.
const BUFFER_SIZE: usize = 4096;

/// TUN-side wait per iteration. Bounds how long a worker can go without
/// re-checking the halt flag.
const TUN_WAIT: Duration = Duration::from_secs(1);

/// Monotonic stop flag shared by one device's workers. Once raised it
/// never clears; every worker checks it before starting new I/O.
pub struct Halt(AtomicBool);

impl Halt {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything the per-device setup thread needs, handed over by value so
/// workers never touch event-loop state.
pub struct RelaySetup {
    pub device: Device<Context>,
    pub port_id: String,
    pub bus: u8,
    pub addr: u8,
    pub subnet: u8,
    pub uplink: String,
    pub halt: Arc<Halt>,
    pub events: Sender<Event>,
}

pub fn spawn(setup: RelaySetup) -> JoinHandle<()> {
    thread::spawn(move || run(setup))
}

fn run(setup: RelaySetup) {
    if let Err(e) = tether(&setup) {
        error!("[{:03},{:03}] tethering setup failed: {:#}", setup.bus, setup.addr, e);
        // Tell the event loop to untrack this device; failures here happen
        // before any worker exists.
        let _ = setup.events.send(Event::SetupFailed { port_id: setup.port_id.clone() });
    }
}

fn tether(setup: &RelaySetup) -> Result<()> {
    let tun = TunDevice::create()?;
    tun.bring_up(&setup.uplink, setup.subnet)?;

    let mut link = AccessoryLink::open(&setup.device).context("opening accessory device")?;
    link.claim().context("claiming accessory interface")?;

    info!(
        "[{:03},{:03}] relaying {} <-> accessory bulk endpoints",
        setup.bus,
        setup.addr,
        tun.name()
    );

    let tun = Arc::new(tun);
    let link = Arc::new(link);

    let tx_worker = {
        let tun = Arc::clone(&tun);
        let link = Arc::clone(&link);
        let halt = Arc::clone(&setup.halt);
        let (bus, addr) = (setup.bus, setup.addr);
        thread::spawn(move || tun_to_usb(&tun, &link, &halt, bus, addr))
    };
    let rx_worker = {
        let tun = Arc::clone(&tun);
        let link = Arc::clone(&link);
        let halt = Arc::clone(&setup.halt);
        let (bus, addr) = (setup.bus, setup.addr);
        thread::spawn(move || usb_to_tun(&tun, &link, &halt, bus, addr))
    };

    let _ = tx_worker.join();
    let _ = rx_worker.join();

    // Dropping `link` releases interface 0 and closes the handle; dropping
    // `tun` closes the fd, which removes the interface kernel-side.
    Ok(())
}

fn tun_to_usb(tun: &TunDevice, link: &AccessoryLink, halt: &Halt, bus: u8, addr: u8) {
    let mut buf = [0u8; BUFFER_SIZE];
    loop {
        if halt.is_raised() {
            break;
        }
        match tun.read_timeout(&mut buf, TUN_WAIT) {
            Ok(TunRead::TimedOut) => continue,
            Ok(TunRead::Eof) => break,
            Ok(TunRead::Data(n)) => match link.bulk_out(&buf[..n]) {
                Ok(_) => {}
                Err(UsbError::Timeout) => continue,
                Err(e) => {
                    error!("[{:03},{:03}] bulk transfer failed: {}", bus, addr, e);
                    break;
                }
            },
            Err(e) => {
                error!("[{:03},{:03}] couldn't read from TUN device: {}", bus, addr, e);
                break;
            }
        }
    }
    halt.raise();
}

fn usb_to_tun(tun: &TunDevice, link: &AccessoryLink, halt: &Halt, bus: u8, addr: u8) {
    let mut buf = [0u8; BUFFER_SIZE];
    loop {
        if halt.is_raised() {
            break;
        }
        match link.bulk_in(&mut buf) {
            Ok(n) => {
                if let Err(e) = tun.write(&buf[..n]) {
                    error!("[{:03},{:03}] couldn't write to TUN device: {}", bus, addr, e);
                    break;
                }
            }
            Err(UsbError::Timeout) => continue,
            Err(e) => {
                error!("[{:03},{:03}] bulk transfer failed: {}", bus, addr, e);
                break;
            }
        }
    }
    halt.raise();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halt_is_monotonic() {
        let halt = Halt::new();
        assert!(!halt.is_raised());
        halt.raise();
        assert!(halt.is_raised());
        halt.raise();
        assert!(halt.is_raised());
    }
}
