use std::time::Duration;

use rusb::{Context, Device, DeviceHandle};
use thiserror::Error;

/// Bulk endpoints exposed by interface 0 once a phone is in accessory mode.
pub const ACCESSORY_EP_IN: u8 = 0x81;
pub const ACCESSORY_EP_OUT: u8 = 0x02;

/// Relay bulk transfers are bounded so workers can notice the halt flag.
pub const BULK_TIMEOUT: Duration = Duration::from_millis(200);

// libusb treats a zero timeout as "wait forever"; AOA control traffic is
// short and the phone either answers or the transfer errors out.
const CONTROL_TIMEOUT: Duration = Duration::ZERO;

#[derive(Debug, Error)]
pub enum UsbError {
    #[error("device not found")]
    NotFound,
    #[error("access denied (insufficient permissions?)")]
    AccessDenied,
    #[error("transfer timed out")]
    Timeout,
    #[error("device disconnected")]
    Disconnected,
    #[error("usb error: {0}")]
    Io(rusb::Error),
}

impl From<rusb::Error> for UsbError {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::NotFound => UsbError::NotFound,
            rusb::Error::Access => UsbError::AccessDenied,
            rusb::Error::Timeout => UsbError::Timeout,
            rusb::Error::NoDevice => UsbError::Disconnected,
            other => UsbError::Io(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, UsbError>;

/// An opened handle on interface 0 of a (future or current) accessory
/// device. Exclusively owned by one tracked device; the two bulk endpoints
/// are distinct, so the two relay directions may share the handle.
pub struct AccessoryLink {
    handle: DeviceHandle<Context>,
    claimed: bool,
}

impl AccessoryLink {
    pub fn open(device: &Device<Context>) -> Result<Self> {
        let handle = device.open()?;
        Ok(Self { handle, claimed: false })
    }

    /// Detach a kernel driver bound to interface 0, if any. Required before
    /// AOA control traffic on candidate devices.
    pub fn detach_kernel_driver(&mut self) -> Result<()> {
        if self.handle.kernel_driver_active(0)? {
            self.handle.detach_kernel_driver(0)?;
        }
        Ok(())
    }

    pub fn claim(&mut self) -> Result<()> {
        self.handle.claim_interface(0)?;
        self.claimed = true;
        Ok(())
    }

    pub fn control_read(&self, request: u8, value: u16, index: u16, buf: &mut [u8]) -> Result<usize> {
        let rt = rusb::request_type(rusb::Direction::In, rusb::RequestType::Vendor, rusb::Recipient::Device);
        Ok(self.handle.read_control(rt, request, value, index, buf, CONTROL_TIMEOUT)?)
    }

    pub fn control_write(&self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<usize> {
        let rt = rusb::request_type(rusb::Direction::Out, rusb::RequestType::Vendor, rusb::Recipient::Device);
        Ok(self.handle.write_control(rt, request, value, index, data, CONTROL_TIMEOUT)?)
    }

    pub fn bulk_in(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.handle.read_bulk(ACCESSORY_EP_IN, buf, BULK_TIMEOUT)?)
    }

    pub fn bulk_out(&self, data: &[u8]) -> Result<usize> {
        Ok(self.handle.write_bulk(ACCESSORY_EP_OUT, data, BULK_TIMEOUT)?)
    }
}

impl Drop for AccessoryLink {
    fn drop(&mut self) {
        if self.claimed {
            let _ = self.handle.release_interface(0);
        }
    }
}
