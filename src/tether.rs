use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use log::info;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};

use crate::hotplug::{Event, HotplugWatcher};
use crate::subnet::SubnetPool;
use crate::tracker::Tracker;
use crate::Config;

/// Upper bound on one loop iteration, so signal flags and newly scheduled
/// setups are observed promptly.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Tethering event loop. Hot-plug events, deferred device setups and
/// relay-failure notices all funnel through one channel consumed here;
/// tracker and subnet state are only ever touched on this thread.
pub fn run(config: Config) -> Result<()> {
    let usb = rusb::Context::new().context("initializing libusb")?;
    let (events_tx, events_rx) = mpsc::channel();
    let watcher = HotplugWatcher::start(usb, events_tx.clone())?;

    let shutdown = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGTERM, SIGHUP] {
        signal_hook::flag::register(sig, Arc::clone(&shutdown))
            .context("installing signal handler")?;
    }

    let mut tracker = Tracker::new(config, events_tx);
    let mut pool = SubnetPool::new();

    info!("waiting for devices...");
    loop {
        if shutdown.load(Ordering::SeqCst) {
            // Flip every halt flag first; workers wind down while the
            // tracker joins them below.
            tracker.halt_all();
            break;
        }

        let now = Instant::now();
        let wait = tracker
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or(IDLE_WAIT)
            .min(IDLE_WAIT);

        match events_rx.recv_timeout(wait) {
            Ok(Event::Added { device, vid, pid, bus, addr, port_id }) => {
                tracker.on_added(device, vid, pid, bus, addr, &port_id);
            }
            Ok(Event::Removed { port_id }) => tracker.on_removed(&port_id),
            Ok(Event::SetupFailed { port_id }) => tracker.on_setup_failed(&port_id),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        tracker.run_due_setups(Instant::now(), &mut pool);
    }

    info!("shutting down...");
    tracker.shutdown();
    watcher.stop();
    Ok(())
}
