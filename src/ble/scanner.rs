//! BLE scanning functionality.
//!
//! Drives a timed discovery scan and runs each advertisement through the
//! matcher. The radio work itself is done by the [`Transport`].

use std::time::Duration;
use tracing::{debug, info, trace};

use crate::ble::matcher::{match_advertisement, DeviceIdentity, MatchReason};
use crate::config::TargetSpec;
use crate::error::Result;
use crate::timer::{TimerId, Timers};
use crate::transport::Transport;

/// Timed scanner for the target peripheral.
#[derive(Debug)]
pub struct Scanner {
    /// How long a scan may run without a match.
    timeout: Duration,
    /// Whether scanning is currently active.
    is_scanning: bool,
    /// Pending scan timeout.
    timer: Option<TimerId>,
}

impl Scanner {
    /// Create a scanner with the given scan timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            is_scanning: false,
            timer: None,
        }
    }

    /// Start scanning and arm the scan timeout.
    ///
    /// The timeout's [`TimerId`] doubles as the scan's identity, so a failure
    /// reported for an earlier scan can be told apart from the live one.
    ///
    /// # Errors
    ///
    /// Returns the transport error if scanning cannot be started.
    pub fn start(&mut self, transport: &mut dyn Transport, timers: &mut dyn Timers) -> Result<()> {
        if self.is_scanning {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        info!("Starting BLE scan ({:?} timeout)", self.timeout);
        let timer = timers.schedule(self.timeout);
        if let Err(e) = transport.start_scan(timer) {
            timers.cancel(timer);
            return Err(e);
        }

        self.is_scanning = true;
        self.timer = Some(timer);
        Ok(())
    }

    /// Stop scanning. No-op if not scanning.
    pub fn stop(&mut self, transport: &mut dyn Transport, timers: &mut dyn Timers) {
        if let Some(timer) = self.timer.take() {
            timers.cancel(timer);
        }

        if !self.is_scanning {
            return;
        }

        info!("Stopping BLE scan");
        self.is_scanning = false;
        transport.stop_scan();
    }

    /// Run an advertisement through the matcher.
    ///
    /// Advertisements arriving while not scanning never match.
    pub fn observe(&self, candidate: &DeviceIdentity, target: &TargetSpec) -> Option<MatchReason> {
        if !self.is_scanning {
            trace!("Ignoring advertisement from {} while not scanning", candidate);
            return None;
        }
        let reason = match_advertisement(candidate, target);
        trace!("Advertisement from {}: {:?}", candidate, reason);
        reason
    }

    /// Claim a timer expiry. Returns `true` if it is the live scan timeout.
    pub fn take_timeout(&mut self, id: TimerId) -> bool {
        if self.is_scanning && self.timer == Some(id) {
            self.timer = None;
            true
        } else {
            false
        }
    }

    /// Whether `scan` identifies the scan in progress.
    pub fn is_current(&self, scan: TimerId) -> bool {
        self.is_scanning && self.timer == Some(scan)
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        self.is_scanning
    }
}
