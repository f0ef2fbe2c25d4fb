//! BLE Session Module
//!
//! Owns the device handle and catalog for one peripheral and sequences the
//! finder, pairing controller, catalog and characteristic I/O.

use crate::domain::address::{CanonicalUuid, MacAddress};
use crate::domain::error::AddressError;
use crate::domain::result_code::ResultCode;
use crate::domain::settings::SessionConfig;
use crate::infrastructure::bluetooth::{
    catalog::{self, CharLookup, CharacteristicEntry, ServiceCatalog},
    characteristic::{self, NotifySubscription},
    pairing::{PairingController, PairingOutcome},
    platform::{BlePlatform, GattService, NotifyCallback},
    scanner::DeviceFinder,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info, warn};

type Catalog<P> = ServiceCatalog<<P as BlePlatform>::Service, <P as BlePlatform>::Characteristic>;

/// A session with a single BLE peripheral
///
/// Operations on one session run one at a time; concurrent calls queue on
/// an internal lock. Notification callbacks run on platform threads
/// independently of that lock.
pub struct BleSession<P: BlePlatform> {
    platform: Arc<P>,
    finder: DeviceFinder<P>,
    pairing: PairingController<P>,
    device: RwLock<Option<P::Device>>,
    catalog: Mutex<Catalog<P>>,
    op_lock: tokio::sync::Mutex<()>,
}

impl<P: BlePlatform> BleSession<P> {
    pub fn new(platform: P, config: &SessionConfig) -> Self {
        let platform = Arc::new(platform);
        Self {
            finder: DeviceFinder::new(platform.clone(), config.scan_timeout),
            pairing: PairingController::from_config(platform.clone(), config),
            platform,
            device: RwLock::new(None),
            catalog: Mutex::new(ServiceCatalog::new()),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Build from parts, e.g. to inject a custom pairing responder
    pub fn with_parts(
        platform: Arc<P>,
        finder: DeviceFinder<P>,
        pairing: PairingController<P>,
    ) -> Self {
        Self {
            platform,
            finder,
            pairing,
            device: RwLock::new(None),
            catalog: Mutex::new(ServiceCatalog::new()),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn catalog(&self) -> MutexGuard<'_, Catalog<P>> {
        self.catalog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store_device(&self, device: Option<P::Device>) {
        *self.device.write().unwrap_or_else(PoisonError::into_inner) = device;
    }

    /// The device resolved by the last pair call
    pub fn device(&self) -> Option<P::Device> {
        self.device
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Scan for `target`. A scan that cannot start finds nothing.
    async fn find(&self, target: &MacAddress) -> Option<P::Device> {
        match self.finder.find(target).await {
            Ok(device) => device,
            Err(e) => {
                warn!("Device scan could not start: {}", e);
                None
            }
        }
    }

    /// Find the device by MAC and pair it.
    ///
    /// The resolved device (or its absence) replaces the stored handle.
    /// Only a malformed MAC is an error; platform faults come back as codes.
    pub async fn pair(&self, mac: &str) -> Result<ResultCode, AddressError> {
        let target = MacAddress::parse(mac)?;
        let _op = self.op_lock.lock().await;

        let device = self.find(&target).await;
        self.store_device(device.clone());

        let Some(device) = device else {
            return Ok(PairingOutcome::DeviceNotFound.code());
        };

        Ok(self.pairing.pair(&device).await.code())
    }

    /// Find the device by MAC and remove its pairing.
    ///
    /// The stored handle from the last pair call is left as it is.
    pub async fn unpair(&self, mac: &str) -> Result<ResultCode, AddressError> {
        let target = MacAddress::parse(mac)?;
        let _op = self.op_lock.lock().await;

        let Some(device) = self.find(&target).await else {
            return Ok(ResultCode::DeviceNotFound);
        };

        Ok(self.pairing.unpair(&device).await)
    }

    /// Uncached walk of the device's GATT table
    pub async fn discover(&self) -> ResultCode {
        let _op = self.op_lock.lock().await;

        let Some(device) = self.device() else {
            warn!("Discover called without a resolved device");
            return ResultCode::DeviceNotFound;
        };

        let connection = match self.platform.connect(&device).await {
            Ok(Some(connection)) => connection,
            Ok(None) => return ResultCode::DeviceNotFound,
            Err(e) => {
                warn!("Failed to open LE connection: {}", e);
                return ResultCode::DeviceNotFound;
            }
        };

        match catalog::discover_uncached(&connection).await {
            Ok(services) => {
                self.catalog().replace_services(services);
                ResultCode::Success
            }
            Err(code) => code,
        }
    }

    /// Bind a characteristic for later writes and subscriptions.
    ///
    /// Misses leave the catalog unchanged; the returned value says why.
    pub async fn init_char(&self, service_uuid: &str, char_uuid: &str) -> CharLookup {
        let (service_uuid, char_uuid) = match (
            CanonicalUuid::parse(service_uuid),
            CanonicalUuid::parse(char_uuid),
        ) {
            (Ok(service), Ok(characteristic)) => (service, characteristic),
            (Err(e), _) | (_, Err(e)) => {
                warn!("{}", e);
                return CharLookup::InvalidUuid;
            }
        };

        let _op = self.op_lock.lock().await;

        if self.catalog().contains(&char_uuid) {
            return CharLookup::AlreadyBound;
        }

        let Some(device) = self.device() else {
            return CharLookup::DeviceUnavailable;
        };
        match self.platform.connect(&device).await {
            Ok(Some(_)) => {}
            Ok(None) => return CharLookup::DeviceUnavailable,
            Err(e) => {
                debug!("Device unavailable for characteristic lookup: {}", e);
                return CharLookup::DeviceUnavailable;
            }
        }

        let services = self.catalog().services().to_vec();
        match catalog::locate_characteristic(&services, &service_uuid, &char_uuid).await {
            Ok(handle) => {
                self.catalog().bind(char_uuid.clone(), handle);
                info!("Bound characteristic {} in service {}", char_uuid, service_uuid);
                CharLookup::Bound
            }
            Err(miss) => {
                info!(
                    "Characteristic {} in service {} not found: {:?}",
                    char_uuid, service_uuid, miss
                );
                miss
            }
        }
    }

    fn entry(&self, uuid: &str) -> Option<Arc<CharacteristicEntry<P::Characteristic>>> {
        let uuid = CanonicalUuid::parse(uuid).ok()?;
        self.catalog().entry(&uuid)
    }

    /// Write `data` to a bound characteristic. `false` if unbound or the
    /// platform reports anything but success.
    pub async fn write_char(&self, uuid: &str, data: &[u8]) -> bool {
        let _op = self.op_lock.lock().await;

        let Some(entry) = self.entry(uuid) else {
            debug!("Write to unbound characteristic {}", uuid);
            return false;
        };
        characteristic::write(&entry, data).await
    }

    /// Subscribe `callback` to notifications. `true` once the callback is
    /// stored and a value-change handler is attached; the descriptor write
    /// status does not affect the result.
    pub async fn register_notify<F>(&self, uuid: &str, callback: F) -> bool
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        self.subscribe(uuid, Arc::new(callback))
            .await
            .is_some_and(|subscription| subscription.handler_active)
    }

    /// Like [`Self::register_notify`], reporting the descriptor write status
    pub async fn subscribe(
        &self,
        uuid: &str,
        callback: NotifyCallback,
    ) -> Option<NotifySubscription> {
        let _op = self.op_lock.lock().await;

        let Some(entry) = self.entry(uuid) else {
            debug!("Subscribe on unbound characteristic {}", uuid);
            return None;
        };
        Some(characteristic::subscribe(&entry, callback).await)
    }

    /// UUIDs of the services found by the last discovery
    pub fn discovered_services(&self) -> Vec<CanonicalUuid> {
        self.catalog()
            .services()
            .iter()
            .filter_map(|service| service.uuid().ok())
            .collect()
    }

    pub fn bound_characteristics(&self) -> Vec<CanonicalUuid> {
        self.catalog().bound_uuids()
    }

    /// Bound entry for `uuid`, for inspection
    pub fn characteristic(
        &self,
        uuid: &str,
    ) -> Option<Arc<CharacteristicEntry<P::Characteristic>>> {
        self.entry(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::{
        MockCharacteristic, MockDevice, MockPlatform, MockService, PlatformFault,
    };
    use crate::infrastructure::bluetooth::platform::{
        GattStatus, PairingStatus, ScanEvent, UnpairingStatus,
    };
    use std::time::Duration;

    const MAC: &str = "AA:BB:CC:DD:EE:FF";
    const SERVICE: &str = "4f63756c-7573-2054-6872-65656d6f7465";
    const DATA: &str = "c8c51726-81bc-483b-a052-f7a14ea3d281";
    const COMMAND: &str = "c8c51726-81bc-483b-a052-f7a14ea3d282";

    struct Fixture {
        platform: MockPlatform,
        data: MockCharacteristic,
        command: MockCharacteristic,
        session: BleSession<MockPlatform>,
    }

    fn fixture() -> Fixture {
        let platform = MockPlatform::new();
        let data = MockCharacteristic::new(DATA);
        let command = MockCharacteristic::new(COMMAND);
        platform.script_scan(vec![ScanEvent::Added(MockDevice::new(
            "controller",
            0xAABB_CCDD_EEFF,
        ))]);
        platform.set_services(vec![
            MockService::new("1800", vec![MockCharacteristic::new("2a00")]),
            MockService::new(SERVICE, vec![data.clone(), command.clone()]),
        ]);

        let config = SessionConfig {
            scan_timeout: Duration::from_millis(200),
            ..SessionConfig::default()
        };
        let session = BleSession::new(platform.clone(), &config);
        Fixture {
            platform,
            data,
            command,
            session,
        }
    }

    async fn ready(f: &Fixture) {
        assert_eq!(f.session.pair(MAC).await.unwrap(), ResultCode::PairSuccess);
        assert_eq!(f.session.discover().await, ResultCode::Success);
    }

    #[tokio::test]
    async fn test_pair_end_to_end() {
        let f = fixture();

        let code = f.session.pair(MAC).await.unwrap();

        assert_eq!(code, ResultCode::PairSuccess);
        assert_eq!(code.to_raw(), 3);
        assert_eq!(
            f.session.device(),
            Some(MockDevice::new("controller", 0xAABB_CCDD_EEFF))
        );
        assert!(f.platform.watcher_stopped());
    }

    #[tokio::test]
    async fn test_pair_rejects_malformed_mac() {
        let f = fixture();
        let err = f.session.pair("AA:BB").await.unwrap_err();
        assert_eq!(err, AddressError::InvalidMac("AA:BB".into()));
        assert!(matches!(
            f.session.unpair("not a mac").await,
            Err(AddressError::InvalidMac(_))
        ));
        assert!(f.platform.watch_targets().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pair_device_not_found() {
        let f = fixture();
        let code = f.session.pair("11:22:33:44:55:66").await.unwrap();
        assert_eq!(code, ResultCode::DeviceNotFound);
        assert_eq!(f.session.device(), None);
        assert!(f.platform.pair_calls().is_empty());
    }

    #[tokio::test]
    async fn test_custom_responder() {
        use crate::domain::settings::PairingProtection;
        use crate::infrastructure::bluetooth::platform::{
            PairingKind, PairingResponder, PairingResponse,
        };

        struct DeclineAll;
        impl PairingResponder for DeclineAll {
            fn respond(&self, _: PairingKind) -> PairingResponse {
                PairingResponse::Decline
            }
        }

        let f = fixture();
        f.platform.script_pairing_requests(vec![PairingKind::ProvidePin]);
        f.platform.set_pair_status(PairingStatus::PAIRING_CANCELED);

        let platform = Arc::new(f.platform.clone());
        let session = BleSession::with_parts(
            platform.clone(),
            DeviceFinder::new(platform.clone(), Duration::from_millis(200)),
            PairingController::new(
                platform,
                Arc::new(DeclineAll),
                PairingProtection::Encryption,
            ),
        );

        let code = session.pair(MAC).await.unwrap();

        assert_eq!(code.platform_status(), Some(PairingStatus::PAIRING_CANCELED.0));
        assert_eq!(f.platform.pairing_answers(), vec![PairingResponse::Decline]);
        assert_eq!(f.platform.pair_calls()[0].1, PairingProtection::Encryption);
    }

    #[tokio::test]
    async fn test_pair_twice_reports_already_paired() {
        let f = fixture();
        assert_eq!(f.session.pair(MAC).await.unwrap(), ResultCode::PairSuccess);
        assert_eq!(f.session.pair(MAC).await.unwrap(), ResultCode::AlreadyPaired);
        assert_eq!(f.platform.pair_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_pair_failure_packs_status() {
        let f = fixture();
        f.platform.set_pair_status(PairingStatus::AUTHENTICATION_FAILURE);

        let raw = f.session.pair(MAC).await.unwrap().to_raw();

        assert_eq!(raw & 0b111, 5);
        assert_eq!(raw >> 3, PairingStatus::AUTHENTICATION_FAILURE.0);
    }

    #[tokio::test]
    async fn test_unpair() {
        let f = fixture();
        f.platform.set_paired("controller");

        let code = f.session.unpair(MAC).await.unwrap();

        assert_eq!(code, ResultCode::Unknown(0));
        assert_eq!(f.platform.unpair_calls(), 1);
        // unpair never stores a device
        assert_eq!(f.session.device(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpair_keeps_paired_device() {
        let f = fixture();
        ready(&f).await;

        let code = f.session.unpair("11:22:33:44:55:66").await.unwrap();

        assert_eq!(code, ResultCode::DeviceNotFound);
        assert_eq!(
            f.session.device(),
            Some(MockDevice::new("controller", 0xAABB_CCDD_EEFF))
        );
        assert_eq!(f.session.discover().await, ResultCode::Success);
        assert_eq!(f.session.init_char(SERVICE, DATA).await, CharLookup::Bound);
    }

    #[tokio::test]
    async fn test_unpair_of_paired_device_keeps_handle() {
        let f = fixture();
        ready(&f).await;

        assert_eq!(f.session.unpair(MAC).await.unwrap(), ResultCode::Unknown(0));
        assert!(f.session.device().is_some());
    }

    #[tokio::test]
    async fn test_scan_fault_reports_not_found() {
        let f = fixture();
        f.platform.fail(PlatformFault::Watch);

        assert_eq!(f.session.pair(MAC).await.unwrap(), ResultCode::DeviceNotFound);
        assert_eq!(f.session.device(), None);
        assert_eq!(f.session.unpair(MAC).await.unwrap(), ResultCode::DeviceNotFound);
        assert!(f.platform.pair_calls().is_empty());
        assert_eq!(f.platform.unpair_calls(), 0);
    }

    #[tokio::test]
    async fn test_pairing_state_fault_reports_not_found() {
        let f = fixture();
        f.platform.fail(PlatformFault::PairingState);

        assert_eq!(f.session.pair(MAC).await.unwrap(), ResultCode::DeviceNotFound);
        assert!(f.platform.pair_calls().is_empty());
    }

    #[tokio::test]
    async fn test_pairing_call_faults_are_packed() {
        let f = fixture();
        f.platform.fail(PlatformFault::Pair);
        f.platform.fail(PlatformFault::Unpair);

        let paired = f.session.pair(MAC).await.unwrap();
        assert_eq!(paired.platform_status(), Some(PairingStatus::FAILED.0));
        assert_eq!(paired.to_raw() >> 3, PairingStatus::FAILED.0);

        let unpaired = f.session.unpair(MAC).await.unwrap();
        assert_eq!(unpaired, ResultCode::Unknown(UnpairingStatus::FAILED.0));
    }

    #[tokio::test]
    async fn test_discover_without_device() {
        let f = fixture();
        assert_eq!(f.session.discover().await, ResultCode::DeviceNotFound);
    }

    #[tokio::test]
    async fn test_discover_unreachable_and_gatt_failure() {
        let f = fixture();
        f.session.pair(MAC).await.unwrap();

        f.platform.make_unreachable("controller");
        assert_eq!(f.session.discover().await, ResultCode::DeviceNotFound);

        f.platform.make_reachable("controller");
        f.platform.set_services_status(GattStatus::UNREACHABLE);
        assert_eq!(f.session.discover().await, ResultCode::GattFailure);
        assert!(f.session.discovered_services().is_empty());
    }

    #[tokio::test]
    async fn test_discover_records_services() {
        let f = fixture();
        ready(&f).await;

        let services: Vec<String> = f
            .session
            .discovered_services()
            .iter()
            .map(|uuid| uuid.to_string())
            .collect();
        assert_eq!(services, vec!["{1800}".to_string(), format!("{{{}}}", SERVICE)]);
    }

    #[tokio::test]
    async fn test_init_char_is_idempotent() {
        let f = fixture();
        ready(&f).await;

        assert_eq!(f.session.init_char(SERVICE, DATA).await, CharLookup::Bound);
        let first = f.session.characteristic(DATA).unwrap();

        let upper = format!("{{{}}}", DATA.to_uppercase());
        assert_eq!(
            f.session.init_char(SERVICE, &upper).await,
            CharLookup::AlreadyBound
        );

        let again = f.session.characteristic(DATA).unwrap();
        assert_eq!(f.session.bound_characteristics().len(), 1);
        assert!(Arc::ptr_eq(&first, &again));
        assert!(first.handle().same_handle(&f.data));
    }

    #[tokio::test]
    async fn test_init_char_misses_are_silent() {
        let f = fixture();
        ready(&f).await;

        assert_eq!(
            f.session.init_char("180f", DATA).await,
            CharLookup::ServiceNotFound
        );
        assert_eq!(
            f.session.init_char(SERVICE, "2a19").await,
            CharLookup::CharacteristicNotFound
        );
        assert_eq!(f.session.init_char("{}", DATA).await, CharLookup::InvalidUuid);
        assert!(f.session.bound_characteristics().is_empty());
    }

    #[tokio::test]
    async fn test_init_char_without_device() {
        let f = fixture();
        assert_eq!(
            f.session.init_char(SERVICE, DATA).await,
            CharLookup::DeviceUnavailable
        );
    }

    #[tokio::test]
    async fn test_write_char() {
        let f = fixture();
        ready(&f).await;

        // unbound: no platform call
        assert!(!f.session.write_char(COMMAND, &[0x2c, 0x06, 0x01]).await);
        assert!(f.command.writes().is_empty());

        f.session.init_char(SERVICE, COMMAND).await;
        assert!(f.session.write_char(COMMAND, &[0x2c, 0x06, 0x01]).await);
        assert_eq!(f.command.writes(), vec![vec![0x2c, 0x06, 0x01]]);

        f.command.set_write_status(GattStatus::UNREACHABLE);
        assert!(!f.session.write_char(COMMAND, &[0x00]).await);
    }

    #[tokio::test]
    async fn test_register_notify_replaces_callback() {
        let f = fixture();
        ready(&f).await;

        assert!(!f.session.register_notify(DATA, |_| {}).await);

        f.session.init_char(SERVICE, DATA).await;
        let seen = Arc::new(Mutex::new(Vec::new()));

        let old = seen.clone();
        assert!(
            f.session
                .register_notify(DATA, move |bytes: Vec<u8>| old.lock().unwrap().push(("old", bytes)))
                .await
        );
        let new = seen.clone();
        assert!(
            f.session
                .register_notify(DATA, move |bytes: Vec<u8>| new.lock().unwrap().push(("new", bytes)))
                .await
        );

        f.data.emit(&[0x01, 0x02, 0x03]);

        assert_eq!(*seen.lock().unwrap(), vec![("new", vec![0x01, 0x02, 0x03])]);
        assert_eq!(f.data.handler_count(), 1);
    }

    #[tokio::test]
    async fn test_register_notify_fails_without_handler() {
        let f = fixture();
        ready(&f).await;
        f.session.init_char(SERVICE, DATA).await;
        f.data.fail_value_handler();

        assert!(!f.session.register_notify(DATA, |_| {}).await);

        let sub = f
            .session
            .subscribe(DATA, Arc::new(|_: Vec<u8>| {}))
            .await
            .unwrap();
        assert_eq!(sub.descriptor_status, Some(GattStatus::SUCCESS));
        assert!(!sub.handler_active);
        assert_eq!(f.data.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_register_notify_survives_descriptor_failure() {
        let f = fixture();
        ready(&f).await;
        f.session.init_char(SERVICE, DATA).await;
        f.data.set_cccd_status(GattStatus::PROTOCOL_ERROR);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = f
            .session
            .subscribe(
                DATA,
                Arc::new(move |bytes: Vec<u8>| sink.lock().unwrap().push(bytes)),
            )
            .await
            .unwrap();

        assert_eq!(sub.descriptor_status, Some(GattStatus::PROTOCOL_ERROR));
        f.data.emit(&[0xFF]);
        assert_eq!(*seen.lock().unwrap(), vec![vec![0xFF]]);
    }
}
