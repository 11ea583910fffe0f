use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::process::Command;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use libc::{c_char, c_short, IFF_NO_PI, IFF_TUN, IFNAMSIZ};
use log::debug;

use crate::subnet::{host_address, network_base};

const TUNSETIFF: libc::Ioctl = 0x4004_54ca as libc::Ioctl;
const CLONE_DEVICE: &str = "/dev/net/tun";

/// Bring-up helper resolved through PATH. Fixed 7-argument contract:
/// helper "linux" <tun> <uplink> <network> 30 <host-addr>.
pub const IFACE_UP_HELPER: &str = "g-simple-rt-iface-up.sh";

#[repr(C)]
struct IfReq {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_flags: c_short,
    _padding: [u8; 22],
}

pub enum TunRead {
    Data(usize),
    TimedOut,
    Eof,
}

/// Layer-3 point-to-point interface backed by a blocking fd. Closing the
/// fd removes the interface, which is how per-device teardown happens.
pub struct TunDevice {
    file: File,
    name: String,
}

impl TunDevice {
    pub fn create() -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(CLONE_DEVICE)
            .with_context(|| format!("opening {}", CLONE_DEVICE))?;

        let mut ifr = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: (IFF_TUN | IFF_NO_PI) as c_short,
            _padding: [0; 22],
        };
        if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut ifr) } < 0 {
            return Err(io::Error::last_os_error()).context("creating TUN device (TUNSETIFF)");
        }

        let name = ifname_to_string(&ifr.ifr_name);
        debug!("TUN device created: {}", name);
        Ok(Self { file, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Assign addresses, enable forwarding and install NAT by delegating to
    /// the external helper. A non-zero exit is fatal for this device.
    pub fn bring_up(&self, uplink: &str, subnet: u8) -> Result<()> {
        run_helper(&self.name, uplink, subnet)
    }

    /// Bounded read: wait up to `timeout` for readability, then pull one
    /// packet. EINTR counts as a timeout tick so callers re-check their
    /// halt flag.
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> io::Result<TunRead> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as i32) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(TunRead::TimedOut);
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(TunRead::TimedOut);
        }

        let n = unsafe { libc::read(self.file.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        match n {
            n if n < 0 => Err(io::Error::last_os_error()),
            0 => Ok(TunRead::Eof),
            n => Ok(TunRead::Data(n as usize)),
        }
    }

    /// One packet in, one write out. The kernel preserves packet boundaries
    /// on TUN fds, so a short write means the frame was truncated.
    pub fn write(&self, buf: &[u8]) -> io::Result<()> {
        let n = unsafe { libc::write(self.file.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n as usize != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write to TUN device: {} of {} bytes", n, buf.len()),
            ));
        }
        Ok(())
    }
}

fn run_helper(tun_name: &str, uplink: &str, subnet: u8) -> Result<()> {
    let args = helper_args(tun_name, uplink, subnet);
    let status = Command::new(IFACE_UP_HELPER)
        .args(&args)
        .status()
        .with_context(|| format!("running {}", IFACE_UP_HELPER))?;
    if !status.success() {
        bail!("unable to set iface {} up: {} {}", tun_name, IFACE_UP_HELPER, status);
    }
    Ok(())
}

pub fn helper_args(tun_name: &str, uplink: &str, subnet: u8) -> [String; 6] {
    [
        "linux".to_string(),
        tun_name.to_string(),
        uplink.to_string(),
        network_base(subnet),
        "30".to_string(),
        host_address(subnet),
    ]
}

fn ifname_to_string(raw: &[c_char; IFNAMSIZ]) -> String {
    let len = raw.iter().position(|&c| c == 0).unwrap_or(IFNAMSIZ);
    raw[..len].iter().map(|&c| c as u8 as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_args() {
        let args = helper_args("tun3", "eth0", 1);
        assert_eq!(args, ["linux", "tun3", "eth0", "10.11.1.0", "30", "10.11.1.1"]);
    }

    #[test]
    fn test_ifname_to_string() {
        let mut raw = [0 as c_char; IFNAMSIZ];
        for (i, b) in b"tun12".iter().enumerate() {
            raw[i] = *b as c_char;
        }
        assert_eq!(ifname_to_string(&raw), "tun12");
    }

    // Covers both helper outcomes in one test because it rewrites PATH,
    // which is process-wide state.
    #[test]
    fn test_run_helper() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join(IFACE_UP_HELPER);
        let log = dir.path().join("invocation");
        std::fs::write(&script, format!("#!/bin/sh\necho \"$@\" > {}\nexit 0\n", log.display()))
            .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{}", dir.path().display(), path));

        run_helper("tun7", "eth0", 7).unwrap();
        let recorded = std::fs::read_to_string(&log).unwrap();
        assert_eq!(recorded.trim(), "linux tun7 eth0 10.11.7.0 30 10.11.7.1");

        std::fs::write(&script, "#!/bin/sh\nexit 3\n").unwrap();
        assert!(run_helper("tun7", "eth0", 7).is_err());
    }
}
