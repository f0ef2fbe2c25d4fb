//! # ble_session
//!
//! Single-peripheral Bluetooth LE session: find a device by MAC address,
//! pair or unpair it, walk its GATT table, bind characteristics, write to
//! them and receive notifications.
//!
//! ```no_run
//! # #[cfg(windows)]
//! # async fn run() -> anyhow::Result<()> {
//! use ble_session::domain::settings::SettingsService;
//! use ble_session::infrastructure::bluetooth::{winrt::WinRtPlatform, BleSession};
//! use ble_session::infrastructure::logging::init_logger;
//!
//! let settings = SettingsService::new()?;
//! let _guard = init_logger(&settings.get().log_settings)?;
//! let session = BleSession::new(WinRtPlatform::new()?, &settings.session_config());
//!
//! session.pair("AA:BB:CC:DD:EE:FF").await?;
//! session.discover().await;
//! session
//!     .init_char("{4f63756c-7573-2054-6872-65656d6f7465}", "{c8c51726-81bc-483b-a052-f7a14ea3d281}")
//!     .await;
//! session
//!     .register_notify("{c8c51726-81bc-483b-a052-f7a14ea3d281}", |data| {
//!         println!("notify, length: {}", data.len());
//!     })
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod domain;
pub mod infrastructure;

pub use domain::address::{CanonicalUuid, MacAddress};
pub use domain::error::{AddressError, PlatformError};
pub use domain::result_code::ResultCode;
pub use domain::settings::{SessionConfig, Settings, SettingsService};
pub use infrastructure::bluetooth::catalog::CharLookup;
pub use infrastructure::bluetooth::characteristic::NotifySubscription;
pub use infrastructure::bluetooth::BleSession;
