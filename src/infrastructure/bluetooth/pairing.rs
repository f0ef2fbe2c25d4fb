//! Pairing Controller
//!
//! Drives the platform pairing ceremony for an already resolved device and
//! classifies the result.

use crate::domain::result_code::ResultCode;
use crate::domain::settings::{PairingProtection, SessionConfig};
use crate::infrastructure::bluetooth::platform::{
    BlePlatform, PairingKind, PairingKinds, PairingResponder, PairingResponse, PairingStatus,
    UnpairingStatus,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Ceremonies offered to the platform on every attempt
pub const OFFERED_KINDS: PairingKinds = PairingKinds(
    PairingKinds::CONFIRM_ONLY.0 | PairingKinds::PROVIDE_PIN.0 | PairingKinds::CONFIRM_PIN_MATCH.0,
);

/// Accepts every pairing request, answering PIN prompts with a configured PIN
#[derive(Debug, Clone)]
pub struct AutoAcceptPolicy {
    pin: String,
}

impl AutoAcceptPolicy {
    pub fn new(pin: impl Into<String>) -> Self {
        Self { pin: pin.into() }
    }
}

impl PairingResponder for AutoAcceptPolicy {
    fn respond(&self, kind: PairingKind) -> PairingResponse {
        let response = match kind {
            PairingKind::ProvidePin => PairingResponse::AcceptWithPin(self.pin.clone()),
            PairingKind::ConfirmOnly | PairingKind::ConfirmPinMatch => PairingResponse::Accept,
            PairingKind::DisplayPin | PairingKind::Other(_) => PairingResponse::Accept,
        };
        debug!("Pairing request {:?} answered", kind);
        response
    }
}

/// Terminal state of one pairing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingOutcome {
    DeviceNotFound,
    AlreadyPaired,
    Success,
    Failure(PairingStatus),
}

impl PairingOutcome {
    pub fn from_status(status: PairingStatus) -> Self {
        match status {
            PairingStatus::PAIRED => Self::Success,
            PairingStatus::ALREADY_PAIRED => Self::AlreadyPaired,
            other => Self::Failure(other),
        }
    }

    pub fn code(self) -> ResultCode {
        match self {
            Self::DeviceNotFound => ResultCode::DeviceNotFound,
            Self::AlreadyPaired => ResultCode::AlreadyPaired,
            Self::Success => ResultCode::PairSuccess,
            Self::Failure(status) => ResultCode::Unknown(status.0),
        }
    }
}

/// Every unpair status is packed as `Unknown | status << 3`, the code
/// existing consumers decode.
pub fn unpairing_code(status: UnpairingStatus) -> ResultCode {
    ResultCode::Unknown(status.0)
}

pub struct PairingController<P: BlePlatform> {
    platform: Arc<P>,
    responder: Arc<dyn PairingResponder>,
    protection: PairingProtection,
}

impl<P: BlePlatform> PairingController<P> {
    pub fn new(
        platform: Arc<P>,
        responder: Arc<dyn PairingResponder>,
        protection: PairingProtection,
    ) -> Self {
        Self {
            platform,
            responder,
            protection,
        }
    }

    /// Controller answering prompts with the configured PIN
    pub fn from_config(platform: Arc<P>, config: &SessionConfig) -> Self {
        Self::new(
            platform,
            Arc::new(AutoAcceptPolicy::new(config.pairing_pin.clone())),
            config.pairing_protection,
        )
    }

    /// Pair a resolved device. Already paired devices are left untouched.
    ///
    /// A device whose pairing state cannot be read counts as not found; a
    /// faulted pairing call counts as [`PairingStatus::FAILED`].
    pub async fn pair(&self, device: &P::Device) -> PairingOutcome {
        match self.platform.is_paired(device).await {
            Ok(true) => {
                info!("Device already paired, skipping pairing");
                return PairingOutcome::AlreadyPaired;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Failed to read pairing state: {}", e);
                return PairingOutcome::DeviceNotFound;
            }
        }

        info!("Device not paired, starting pairing...");
        let status = match self
            .platform
            .pair(device, OFFERED_KINDS, self.protection, self.responder.clone())
            .await
        {
            Ok(status) => status,
            Err(e) => {
                error!("Pairing call failed: {}", e);
                PairingStatus::FAILED
            }
        };

        let outcome = PairingOutcome::from_status(status);
        match outcome {
            PairingOutcome::Success => info!("Pairing successful"),
            PairingOutcome::AlreadyPaired => info!("Platform reports device already paired"),
            _ => warn!("Pairing failed with platform status {}", status.0),
        }
        outcome
    }

    /// Remove the pairing. A faulted call reports [`UnpairingStatus::FAILED`].
    pub async fn unpair(&self, device: &P::Device) -> ResultCode {
        info!("Unpairing device...");
        let status = match self.platform.unpair(device).await {
            Ok(status) => status,
            Err(e) => {
                error!("Unpairing call failed: {}", e);
                UnpairingStatus::FAILED
            }
        };
        info!("Unpairing finished with platform status {}", status.0);
        unpairing_code(status)
    }
}
