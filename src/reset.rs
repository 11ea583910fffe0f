use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;

use anyhow::{bail, Context as _, Result};
use log::{error, info};
use rusb::UsbContext;

use crate::aoa;

const USBDEVFS_RESET: libc::Ioctl = 0x5514 as libc::Ioctl;

pub fn devfs_path(bus: u8, addr: u8) -> String {
    format!("/dev/bus/usb/{:03}/{:03}", bus, addr)
}

fn reset_device(bus: u8, addr: u8) -> bool {
    let path = devfs_path(bus, addr);
    let file = match OpenOptions::new().write(true).open(&path) {
        Ok(f) => f,
        Err(e) => {
            error!("cannot open {}: {}", path, e);
            return false;
        }
    };

    if unsafe { libc::ioctl(file.as_raw_fd(), USBDEVFS_RESET, 0) } < 0 {
        let err = io::Error::last_os_error();
        // ENODEV just means the device already fell off the bus mid-reset.
        if err.raw_os_error() != Some(libc::ENODEV) {
            error!("failed resetting device [{:03},{:03}]: {}", bus, addr, err);
            return false;
        }
    }
    info!("reset device [{:03},{:03}]: done", bus, addr);
    true
}

/// One-shot: kick every device currently in accessory mode back to its
/// normal enumeration via a kernel-level USB reset.
pub fn run() -> Result<()> {
    let usb = rusb::Context::new().context("initializing libusb")?;

    let mut resets = 0u32;
    for device in usb.devices().context("enumerating USB devices")?.iter() {
        let desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };
        if !aoa::is_accessory_id(desc.vendor_id(), desc.product_id()) {
            continue;
        }
        if reset_device(device.bus_number(), device.address()) {
            resets += 1;
        }
    }

    if resets == 0 {
        bail!("no devices in accessory mode were reset");
    }
    info!("success: a total of {} device(s) reset", resets);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_devfs_path_zero_padded() {
        assert_eq!(devfs_path(2, 3), "/dev/bus/usb/002/003");
        assert_eq!(devfs_path(12, 113), "/dev/bus/usb/012/113");
    }
}
