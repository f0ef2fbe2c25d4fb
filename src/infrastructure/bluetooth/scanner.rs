//! Device Finder
//!
//! Runs a time-bounded device watch and resolves the first peripheral whose
//! hardware address matches the target.

use crate::domain::address::MacAddress;
use crate::domain::error::PlatformError;
use crate::infrastructure::bluetooth::platform::{
    BlePlatform, LeConnection, ScanEvent, ScanWatcher,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Default scan window
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(2);

/// Finds a single peripheral by MAC address
pub struct DeviceFinder<P: BlePlatform> {
    platform: Arc<P>,
    timeout: Duration,
}

impl<P: BlePlatform> DeviceFinder<P> {
    pub fn new(platform: Arc<P>, timeout: Duration) -> Self {
        Self { platform, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Scan for `target`.
    ///
    /// Returns `Ok(None)` when nothing matched before the timeout, and never
    /// earlier, even if the platform stops delivering events. Only
    /// failing to start the watch is an error; candidates that fail to
    /// resolve are skipped.
    pub async fn find(&self, target: &MacAddress) -> Result<Option<P::Device>, PlatformError> {
        info!(
            "Starting device scan for {} (timeout {:?})",
            target, self.timeout
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = self.platform.watch(target, tx)?;

        let found = tokio::time::timeout(self.timeout, self.first_match(&mut rx, target))
            .await
            .unwrap_or(None);

        // Dropping the receiver below discards anything that raced the stop
        if let Err(e) = watcher.stop() {
            warn!("Failed to stop device scan: {}", e);
        }
        drop(rx);

        match &found {
            Some(_) => info!("Device {} found", target),
            None => info!("Device {} not found within {:?}", target, self.timeout),
        }

        Ok(found)
    }

    /// Consume scan events until one resolves to the target address.
    /// Events are handled one at a time, so the first match wins. Never
    /// resolves without a match; the caller's timeout ends the wait.
    async fn first_match(
        &self,
        rx: &mut mpsc::UnboundedReceiver<ScanEvent<P::Device>>,
        target: &MacAddress,
    ) -> Option<P::Device> {
        while let Some(event) = rx.recv().await {
            match event {
                ScanEvent::Added(device) => {
                    if self.is_target(&device, target).await {
                        return Some(device);
                    }
                }
                ScanEvent::Updated(id) => trace!("Scan update: {}", id),
                ScanEvent::Removed(id) => trace!("Scan removal: {}", id),
                ScanEvent::EnumerationCompleted => debug!("Initial enumeration completed"),
                ScanEvent::Stopped => debug!("Device watcher stopped"),
            }
        }

        // A closed channel cannot deliver a match; wait out the window anyway
        debug!("Scan event channel closed");
        std::future::pending().await
    }

    async fn is_target(&self, device: &P::Device, target: &MacAddress) -> bool {
        let connection = match self.platform.connect(device).await {
            Ok(Some(connection)) => connection,
            Ok(None) => {
                trace!("Candidate has no LE connection handle");
                return false;
            }
            Err(e) => {
                debug!("Skipping candidate: {}", e);
                return false;
            }
        };

        match connection.bluetooth_address() {
            Ok(address) => {
                let matched = target.matches_reported(address);
                trace!("Candidate {:012X} matched: {}", address, matched);
                matched
            }
            Err(e) => {
                debug!("Skipping candidate without address: {}", e);
                false
            }
        }
    }
}
