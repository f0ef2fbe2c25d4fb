//! Platform BLE Stack Interface
//!
//! Everything the session needs from the host radio stack. The Windows
//! backend lives in [`super::winrt`]; tests run against [`super::mock`].
//!
//! Status values are thin newtypes over the platform's raw integers so an
//! unclassified status can be packed into a
//! [`ResultCode::Unknown`](crate::domain::result_code::ResultCode) unchanged.

use crate::domain::address::{CanonicalUuid, MacAddress};
use crate::domain::error::PlatformError;
use crate::domain::settings::PairingProtection;
use async_trait::async_trait;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Callback receiving the full payload of a characteristic notification
pub type NotifyCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Whether an enumeration may be served from the platform's GATT cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Cached,
    Uncached,
}

/// Device watcher notifications
#[derive(Debug, Clone)]
pub enum ScanEvent<D> {
    Added(D),
    Updated(String),
    Removed(String),
    EnumerationCompleted,
    Stopped,
}

/// Result status of a GATT request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub i32);

impl GattStatus {
    pub const SUCCESS: Self = Self(0);
    pub const UNREACHABLE: Self = Self(1);
    pub const PROTOCOL_ERROR: Self = Self(2);
    pub const ACCESS_DENIED: Self = Self(3);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SUCCESS => f.write_str("Success"),
            Self::UNREACHABLE => f.write_str("Unreachable"),
            Self::PROTOCOL_ERROR => f.write_str("ProtocolError"),
            Self::ACCESS_DENIED => f.write_str("AccessDenied"),
            Self(other) => write!(f, "Status({})", other),
        }
    }
}

/// Status of a GATT enumeration together with what it returned
#[derive(Debug, Clone)]
pub struct GattQuery<T> {
    pub status: GattStatus,
    pub items: Vec<T>,
}

impl<T> GattQuery<T> {
    pub fn success(items: Vec<T>) -> Self {
        Self {
            status: GattStatus::SUCCESS,
            items,
        }
    }

    pub fn failed(status: GattStatus) -> Self {
        Self {
            status,
            items: Vec::new(),
        }
    }
}

/// Platform pairing result status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairingStatus(pub i32);

impl PairingStatus {
    pub const PAIRED: Self = Self(0);
    pub const NOT_READY_TO_PAIR: Self = Self(1);
    pub const NOT_PAIRED: Self = Self(2);
    pub const ALREADY_PAIRED: Self = Self(3);
    pub const CONNECTION_REJECTED: Self = Self(4);
    pub const AUTHENTICATION_FAILURE: Self = Self(11);
    pub const PAIRING_CANCELED: Self = Self(14);
    pub const FAILED: Self = Self(19);
}

/// Platform unpairing result status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnpairingStatus(pub i32);

impl UnpairingStatus {
    pub const UNPAIRED: Self = Self(0);
    pub const ALREADY_UNPAIRED: Self = Self(1);
    pub const OPERATION_ALREADY_IN_PROGRESS: Self = Self(2);
    pub const ACCESS_DENIED: Self = Self(3);
    pub const FAILED: Self = Self(4);
}

/// Set of pairing ceremonies offered to the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingKinds(pub u32);

impl PairingKinds {
    pub const CONFIRM_ONLY: Self = Self(0x1);
    pub const DISPLAY_PIN: Self = Self(0x2);
    pub const PROVIDE_PIN: Self = Self(0x4);
    pub const CONFIRM_PIN_MATCH: Self = Self(0x8);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PairingKinds {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A single pairing request raised by the platform during a pairing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingKind {
    ConfirmOnly,
    DisplayPin,
    ProvidePin,
    ConfirmPinMatch,
    Other(u32),
}

impl PairingKind {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0x1 => Self::ConfirmOnly,
            0x2 => Self::DisplayPin,
            0x4 => Self::ProvidePin,
            0x8 => Self::ConfirmPinMatch,
            other => Self::Other(other),
        }
    }
}

/// How a pairing request is answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingResponse {
    Accept,
    AcceptWithPin(String),
    Decline,
}

/// Answers pairing requests. Invoked synchronously on the platform's
/// event thread.
pub trait PairingResponder: Send + Sync {
    fn respond(&self, kind: PairingKind) -> PairingResponse;
}

/// Handle on a running device watch
pub trait ScanWatcher: Send + Sync {
    /// Stop the watch. Must be safe to call more than once.
    fn stop(&self) -> Result<(), PlatformError>;
}

/// Root of the platform stack
#[async_trait]
pub trait BlePlatform: Send + Sync + 'static {
    /// Enumerated device record, cheap to clone
    type Device: Clone + Send + Sync + 'static;
    type Connection: LeConnection<Service = Self::Service>;
    type Service: GattService<Characteristic = Self::Characteristic>;
    type Characteristic: GattCharacteristic;
    type Watcher: ScanWatcher;

    /// Start a BLE device watch filtered for `target`. Events are pushed
    /// into `events` from platform threads until the watcher is stopped.
    fn watch(
        &self,
        target: &MacAddress,
        events: mpsc::UnboundedSender<ScanEvent<Self::Device>>,
    ) -> Result<Self::Watcher, PlatformError>;

    /// Resolve a device record to a live LE connection handle
    async fn connect(&self, device: &Self::Device)
        -> Result<Option<Self::Connection>, PlatformError>;

    async fn is_paired(&self, device: &Self::Device) -> Result<bool, PlatformError>;

    async fn pair(
        &self,
        device: &Self::Device,
        kinds: PairingKinds,
        protection: PairingProtection,
        responder: Arc<dyn PairingResponder>,
    ) -> Result<PairingStatus, PlatformError>;

    async fn unpair(&self, device: &Self::Device) -> Result<UnpairingStatus, PlatformError>;
}

#[async_trait]
pub trait LeConnection: Send + Sync {
    type Service;

    fn bluetooth_address(&self) -> Result<u64, PlatformError>;

    async fn gatt_services(&self, mode: CacheMode)
        -> Result<GattQuery<Self::Service>, PlatformError>;
}

#[async_trait]
pub trait GattService: Clone + Send + Sync + 'static {
    type Characteristic;

    fn uuid(&self) -> Result<CanonicalUuid, PlatformError>;

    async fn characteristics(
        &self,
        mode: CacheMode,
    ) -> Result<GattQuery<Self::Characteristic>, PlatformError>;
}

#[async_trait]
pub trait GattCharacteristic: Clone + Send + Sync + 'static {
    fn uuid(&self) -> Result<CanonicalUuid, PlatformError>;

    async fn write_value(&self, data: &[u8]) -> Result<GattStatus, PlatformError>;

    /// Write "notify" to the client characteristic configuration descriptor
    async fn enable_notifications(&self) -> Result<GattStatus, PlatformError>;

    /// Attach a value-changed handler. The handler may run on any thread.
    fn on_value_changed(&self, handler: NotifyCallback) -> Result<(), PlatformError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_kinds_combine() {
        let kinds = PairingKinds::CONFIRM_ONLY
            | PairingKinds::PROVIDE_PIN
            | PairingKinds::CONFIRM_PIN_MATCH;
        assert_eq!(kinds.bits(), 0xD);
        assert!(kinds.contains(PairingKinds::PROVIDE_PIN));
        assert!(!kinds.contains(PairingKinds::DISPLAY_PIN));
    }

    #[test]
    fn test_pairing_kind_from_raw() {
        assert_eq!(PairingKind::from_raw(4), PairingKind::ProvidePin);
        assert_eq!(PairingKind::from_raw(0x40), PairingKind::Other(0x40));
    }

    #[test]
    fn test_gatt_status_display() {
        assert_eq!(GattStatus::UNREACHABLE.to_string(), "Unreachable");
        assert_eq!(GattStatus(9).to_string(), "Status(9)");
    }
}
