//! Characteristic I/O
//!
//! Writes to and subscribes on characteristics already bound in the
//! catalog. Nothing here retries; callers own retry policy.

use crate::infrastructure::bluetooth::catalog::CharacteristicEntry;
use crate::infrastructure::bluetooth::platform::{GattCharacteristic, GattStatus, NotifyCallback};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};

/// Result of subscribing to a characteristic.
///
/// The callback is stored and the value handler attached even when the
/// descriptor write fails; the descriptor status is reported separately.
/// Notifications reach the callback only while `handler_active` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifySubscription {
    /// Status of the CCCD write, `None` if the request itself faulted
    pub descriptor_status: Option<GattStatus>,
    /// Whether this call attached the platform value-change handler
    pub handler_attached: bool,
    /// Whether a handler is attached after this call, by it or an earlier one
    pub handler_active: bool,
}

impl NotifySubscription {
    pub fn descriptor_enabled(&self) -> bool {
        matches!(self.descriptor_status, Some(status) if status.is_success())
    }
}

/// Write a raw payload. `true` only if the platform reports success.
pub async fn write<C: GattCharacteristic>(entry: &CharacteristicEntry<C>, data: &[u8]) -> bool {
    trace!("Writing {} bytes: {:02X?}", data.len(), data);
    match entry.handle().write_value(data).await {
        Ok(status) if status.is_success() => true,
        Ok(status) => {
            warn!("Characteristic write returned {}", status);
            false
        }
        Err(e) => {
            error!("Characteristic write failed: {}", e);
            false
        }
    }
}

/// Store `callback`, enable notifications and make sure a value-change
/// handler is attached.
///
/// The platform handler is attached once per entry and always dispatches
/// to the entry's current callback, so re-subscribing only swaps the
/// callback. The descriptor write is issued on every call.
pub async fn subscribe<C: GattCharacteristic>(
    entry: &Arc<CharacteristicEntry<C>>,
    callback: NotifyCallback,
) -> NotifySubscription {
    entry.set_callback(callback);

    let descriptor_status = match entry.handle().enable_notifications().await {
        Ok(status) => {
            if status.is_success() {
                debug!("Notifications enabled");
            } else {
                warn!("Failed to enable notifications (CCCD write returned {})", status);
            }
            Some(status)
        }
        Err(e) => {
            warn!("Failed to enable notifications: {}", e);
            None
        }
    };

    let handler_attached = if entry.claim_value_handler() {
        // Weak so the platform-held handler doesn't keep the entry alive
        let weak: Weak<CharacteristicEntry<C>> = Arc::downgrade(entry);
        let handler: NotifyCallback = Arc::new(move |payload: Vec<u8>| {
            trace!("Notification received: {:02X?}", payload);
            if let Some(entry) = weak.upgrade() {
                entry.dispatch(payload);
            }
        });

        match entry.handle().on_value_changed(handler) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to attach value-change handler: {}", e);
                entry.release_value_handler();
                false
            }
        }
    } else {
        false
    };

    NotifySubscription {
        descriptor_status,
        handler_attached,
        handler_active: entry.has_value_handler(),
    }
}
