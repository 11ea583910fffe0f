use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use log::warn;

mod aoa;
mod hotplug;
mod relay;
mod reset;
mod subnet;
mod tether;
mod tracker;
mod tun;
mod usb;

/// Validated tethering options handed to the event loop; nothing reads
/// the raw CLI state after startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub vid: u16,
    /// 0 means any product under `vid`.
    pub pid: u16,
    /// Host interface the phones are NATed through.
    pub uplink: String,
}

#[derive(Debug, Parser)]
#[command(name = "g-simple-rt", version, about = "Reverse tethering for Android devices over USB")]
struct Cli {
    /// Device USB vendor ID, hex (mandatory for tethering)
    #[arg(long, short = 'v', value_name = "VID")]
    vid: Option<String>,

    /// Device USB product ID, hex (default: any product under --vid)
    #[arg(long, short = 'p', value_name = "PID")]
    pid: Option<String>,

    /// Network interface to share connectivity from (mandatory for tethering)
    #[arg(long, short = 'i', value_name = "IFACE")]
    interface: Option<String>,

    /// Reset devices already in accessory mode and exit
    #[arg(long, short = 'r', action = ArgAction::SetTrue)]
    reset: bool,

    /// Verbose logging (repeat for trace)
    #[arg(long, action = ArgAction::Count)]
    verbose: u8,
}

fn parse_usb_id(value: &str) -> Result<u16> {
    let digits = value.trim_start_matches("0x").trim_start_matches("0X");
    let id = u32::from_str_radix(digits, 16)
        .with_context(|| format!("invalid USB id given: '{}'", value))?;
    if id == 0 || id > 0xFFFF {
        bail!("USB id out of range (0001..ffff): '{}'", value);
    }
    Ok(id as u16)
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_millis()
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    if cli.reset {
        if cli.vid.is_some() {
            warn!("--vid is ignored when using --reset");
        }
        if cli.pid.is_some() {
            warn!("--pid is ignored when using --reset");
        }
        if cli.interface.is_some() {
            warn!("--interface is ignored when using --reset");
        }
        return reset::run();
    }

    let vid = match cli.vid.as_deref() {
        Some(v) => parse_usb_id(v).context("--vid")?,
        None => bail!("--vid is mandatory"),
    };
    let pid = match cli.pid.as_deref() {
        Some(p) => parse_usb_id(p).context("--pid")?,
        None => 0,
    };
    let uplink = match cli.interface {
        Some(i) => i,
        None => bail!("--interface is mandatory"),
    };

    tether::run(Config { vid, pid, uplink })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_usb_id() {
        assert_eq!(parse_usb_id("18d1").unwrap(), 0x18D1);
        assert_eq!(parse_usb_id("0x18D1").unwrap(), 0x18D1);
        assert_eq!(parse_usb_id("1").unwrap(), 1);
        assert_eq!(parse_usb_id("ffff").unwrap(), 0xFFFF);
    }

    #[test]
    fn test_parse_usb_id_rejects_zero_and_overflow() {
        assert!(parse_usb_id("0").is_err());
        assert!(parse_usb_id("0x0").is_err());
        assert!(parse_usb_id("10000").is_err());
        assert!(parse_usb_id("banana").is_err());
        assert!(parse_usb_id("").is_err());
    }

    #[test]
    fn test_cli_tether_mode() {
        let cli = Cli::try_parse_from(["g-simple-rt", "--vid", "18d1", "--pid", "4ee7", "-i", "eth0"]).unwrap();
        assert_eq!(cli.vid.as_deref(), Some("18d1"));
        assert_eq!(cli.pid.as_deref(), Some("4ee7"));
        assert_eq!(cli.interface.as_deref(), Some("eth0"));
        assert!(!cli.reset);
    }

    #[test]
    fn test_cli_reset_mode() {
        let cli = Cli::try_parse_from(["g-simple-rt", "--reset"]).unwrap();
        assert!(cli.reset);
        assert!(cli.vid.is_none());
    }

    #[test]
    fn test_cli_short_flags() {
        let cli = Cli::try_parse_from(["g-simple-rt", "-v", "18d1", "-i", "wlan0"]).unwrap();
        assert_eq!(cli.vid.as_deref(), Some("18d1"));
        assert_eq!(cli.interface.as_deref(), Some("wlan0"));
    }
}
