//! Android Open Accessory v1 negotiation: protocol probe, identity push,
//! accessory-mode switch. Vendor-class control transfers on endpoint 0.

use byteorder::{ByteOrder, LittleEndian};
use log::info;

use crate::usb::{AccessoryLink, Result, UsbError};

pub const AOA_GET_PROTOCOL: u8 = 51;
pub const AOA_SEND_IDENT: u8 = 52;
pub const AOA_START_ACCESSORY: u8 = 53;

/* String IDs for AOA_SEND_IDENT */
const STRING_MANUFACTURER: u16 = 0;
const STRING_MODEL: u16 = 1;
const STRING_DESCRIPTION: u16 = 2;
const STRING_VERSION: u16 = 3;
const STRING_URL: u16 = 4;
const STRING_SERIAL: u16 = 5;

/// Google's accessory-mode vendor ID and the product IDs a switched phone
/// may re-enumerate under (accessory / audio / adb combinations).
pub const ACCESSORY_VID: u16 = 0x18D1;
pub const ACCESSORY_PIDS: [u16; 6] = [0x2D00, 0x2D01, 0x2D02, 0x2D03, 0x2D04, 0x2D05];

const MANUFACTURER: &str = "The SimpleRT developers";
const MODEL: &str = "gSimpleRT";
const DESCRIPTION: &str = "Simple Reverse Tethering";
const VERSION: &str = "1.0";
const URL: &str = "https://github.com/aleksander0m/SimpleRT";

pub fn is_accessory_id(vid: u16, pid: u16) -> bool {
    vid == ACCESSORY_VID && ACCESSORY_PIDS.contains(&pid)
}

/// Ask the device which AOA protocol version it speaks. Anything >= 1 is
/// good enough for the byte-pipe accessory interface we need.
pub fn probe(link: &AccessoryLink) -> Result<u16> {
    let mut buf = [0u8; 2];
    let n = link.control_read(AOA_GET_PROTOCOL, 0, 0, &mut buf)?;
    if n < 2 {
        return Err(UsbError::Io(rusb::Error::Other));
    }
    let version = LittleEndian::read_u16(&buf);
    if version < 1 {
        return Err(UsbError::Io(rusb::Error::NotSupported));
    }
    Ok(version)
}

fn send_ident(link: &AccessoryLink, id: u16, value: &str) -> Result<()> {
    let mut payload = Vec::with_capacity(value.len() + 1);
    payload.extend_from_slice(value.as_bytes());
    payload.push(0);
    link.control_write(AOA_SEND_IDENT, 0, id, &payload)?;
    Ok(())
}

/// Push the six identity strings and request the switch into accessory
/// mode. `serial` carries the phone's IPv4 address so the companion app
/// can configure itself. After this returns the device drops off the bus
/// and re-enumerates under the accessory VID/PID.
pub fn switch_to_accessory(link: &AccessoryLink, serial: &str, bus: u8, addr: u8) -> Result<()> {
    let strings: [(u16, &str, &str); 6] = [
        (STRING_MANUFACTURER, "manufacturer", MANUFACTURER),
        (STRING_MODEL, "model", MODEL),
        (STRING_DESCRIPTION, "description", DESCRIPTION),
        (STRING_VERSION, "version", VERSION),
        (STRING_URL, "url", URL),
        (STRING_SERIAL, "serial", serial),
    ];
    for (id, label, value) in strings {
        info!("[{:03},{:03}] sending {}: {}", bus, addr, label, value);
        send_ident(link, id, value)?;
    }
    info!("[{:03},{:03}] switching device into accessory mode...", bus, addr);
    link.control_write(AOA_START_ACCESSORY, 0, 0, &[])?;
    info!("[{:03},{:03}] switch requested", bus, addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessory_id_set() {
        assert!(is_accessory_id(0x18D1, 0x2D00));
        assert!(is_accessory_id(0x18D1, 0x2D05));
        assert!(!is_accessory_id(0x18D1, 0x4EE7));
        assert!(!is_accessory_id(0x2B24, 0x2D00));
    }
}
