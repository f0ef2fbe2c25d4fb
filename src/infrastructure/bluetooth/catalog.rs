//! Service/Characteristic Catalog
//!
//! Holds the services from the last uncached discovery and the
//! characteristics bound by logical UUID.

use crate::domain::address::CanonicalUuid;
use crate::domain::result_code::ResultCode;
use crate::infrastructure::bluetooth::platform::{
    CacheMode, GattCharacteristic, GattService, LeConnection, NotifyCallback,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

/// A bound characteristic and its notification callback slot
pub struct CharacteristicEntry<C> {
    handle: C,
    callback: RwLock<Option<NotifyCallback>>,
    value_handler_attached: AtomicBool,
}

impl<C: GattCharacteristic> CharacteristicEntry<C> {
    pub fn new(handle: C) -> Self {
        Self {
            handle,
            callback: RwLock::new(None),
            value_handler_attached: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> &C {
        &self.handle
    }

    /// Replace the stored callback. Last writer wins.
    pub fn set_callback(&self, callback: NotifyCallback) {
        *self
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn has_callback(&self) -> bool {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Forward a payload to the current callback, if any
    pub fn dispatch(&self, payload: Vec<u8>) {
        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(payload);
        }
    }

    /// Returns `true` exactly once, for the caller that should attach the
    /// platform value-change handler.
    pub(crate) fn claim_value_handler(&self) -> bool {
        !self.value_handler_attached.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn release_value_handler(&self) {
        self.value_handler_attached.store(false, Ordering::SeqCst);
    }

    /// Whether a platform value-change handler is attached to this entry
    pub fn has_value_handler(&self) -> bool {
        self.value_handler_attached.load(Ordering::SeqCst)
    }
}

/// Outcome of binding a characteristic. Misses are not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CharLookup {
    Bound,
    AlreadyBound,
    InvalidUuid,
    DeviceUnavailable,
    ServiceNotFound,
    CharacteristicNotFound,
}

impl CharLookup {
    pub fn is_bound(&self) -> bool {
        matches!(self, Self::Bound | Self::AlreadyBound)
    }
}

pub struct ServiceCatalog<S, C> {
    services: Vec<S>,
    characteristics: HashMap<CanonicalUuid, Arc<CharacteristicEntry<C>>>,
}

impl<S, C> Default for ServiceCatalog<S, C> {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            characteristics: HashMap::new(),
        }
    }
}

impl<S, C> ServiceCatalog<S, C>
where
    S: GattService<Characteristic = C>,
    C: GattCharacteristic,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn services(&self) -> &[S] {
        &self.services
    }

    /// Replace the service list wholesale
    pub fn replace_services(&mut self, services: Vec<S>) {
        self.services = services;
    }

    pub fn entry(&self, uuid: &CanonicalUuid) -> Option<Arc<CharacteristicEntry<C>>> {
        self.characteristics.get(uuid).cloned()
    }

    pub fn contains(&self, uuid: &CanonicalUuid) -> bool {
        self.characteristics.contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.characteristics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.characteristics.is_empty()
    }

    pub fn bound_uuids(&self) -> Vec<CanonicalUuid> {
        let mut uuids: Vec<_> = self.characteristics.keys().cloned().collect();
        uuids.sort();
        uuids
    }

    /// Insert unless the key is already bound. Returns whether it inserted.
    pub fn bind(&mut self, uuid: CanonicalUuid, handle: C) -> bool {
        if self.characteristics.contains_key(&uuid) {
            return false;
        }
        self.characteristics
            .insert(uuid, Arc::new(CharacteristicEntry::new(handle)));
        true
    }
}

/// Walk the whole GATT table without the platform cache.
///
/// Characteristic lists are fetched for every service so transport errors
/// surface here rather than at first use; they are not retained.
pub async fn discover_uncached<L>(connection: &L) -> Result<Vec<L::Service>, ResultCode>
where
    L: LeConnection,
    L::Service: GattService,
{
    let query = match connection.gatt_services(CacheMode::Uncached).await {
        Ok(query) => query,
        Err(e) => {
            error!("Failed to get GATT services: {}", e);
            return Err(ResultCode::GattFailure);
        }
    };

    if !query.status.is_success() {
        error!("Failed to get GATT services. Status: {}", query.status);
        return Err(ResultCode::GattFailure);
    }

    info!("Found {} services", query.items.len());
    for service in &query.items {
        match service.uuid() {
            Ok(uuid) => info!("Service UUID: {}", uuid),
            Err(e) => warn!("Service without readable UUID: {}", e),
        }

        match service.characteristics(CacheMode::Uncached).await {
            Ok(chars) if chars.status.is_success() => {
                debug!("  {} characteristics", chars.items.len())
            }
            Ok(chars) => warn!("  characteristic query returned {}", chars.status),
            Err(e) => warn!("  characteristic query failed: {}", e),
        }
    }

    Ok(query.items)
}

/// Find `char_uuid` inside `service_uuid` among discovered services, using
/// the platform's cached characteristic lists.
pub async fn locate_characteristic<S, C>(
    services: &[S],
    service_uuid: &CanonicalUuid,
    char_uuid: &CanonicalUuid,
) -> Result<C, CharLookup>
where
    S: GattService<Characteristic = C>,
    C: GattCharacteristic,
{
    let mut service_seen = false;

    for service in services {
        if service.uuid().ok().as_ref() != Some(service_uuid) {
            continue;
        }
        service_seen = true;

        let query = match service.characteristics(CacheMode::Cached).await {
            Ok(query) if query.status.is_success() => query,
            Ok(query) => {
                warn!(
                    "Characteristic query for {} returned {}",
                    service_uuid, query.status
                );
                continue;
            }
            Err(e) => {
                warn!("Characteristic query for {} failed: {}", service_uuid, e);
                continue;
            }
        };

        debug!(
            "Service {} has {} characteristics",
            service_uuid,
            query.items.len()
        );
        for characteristic in query.items {
            if characteristic.uuid().ok().as_ref() == Some(char_uuid) {
                return Ok(characteristic);
            }
        }
    }

    if service_seen {
        Err(CharLookup::CharacteristicNotFound)
    } else {
        Err(CharLookup::ServiceNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::{
        MockCharacteristic, MockDevice, MockPlatform, MockService,
    };
    use crate::infrastructure::bluetooth::platform::{BlePlatform, GattStatus};

    const SERVICE: &str = "4f63756c-7573-2054-6872-65656d6f7465";
    const DATA: &str = "c8c51726-81bc-483b-a052-f7a14ea3d281";

    fn uuid(s: &str) -> CanonicalUuid {
        CanonicalUuid::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_discovery_walks_every_service_uncached() {
        let battery = MockService::new("180f", vec![MockCharacteristic::new("2a19")]);
        let controller = MockService::new(SERVICE, vec![MockCharacteristic::new(DATA)]);
        let platform = MockPlatform::new();
        platform.set_services(vec![battery.clone(), controller.clone()]);

        let connection = platform
            .connect(&MockDevice::new("dev", 1))
            .await
            .unwrap()
            .unwrap();
        let services = discover_uncached(&connection).await.unwrap();

        assert_eq!(services.len(), 2);
        assert_eq!(platform.service_queries(), vec![CacheMode::Uncached]);
        assert_eq!(battery.characteristic_queries(), vec![CacheMode::Uncached]);
        assert_eq!(controller.characteristic_queries(), vec![CacheMode::Uncached]);
    }

    #[tokio::test]
    async fn test_discovery_failure_status() {
        let platform = MockPlatform::new();
        platform.set_services_status(GattStatus::UNREACHABLE);

        let connection = platform
            .connect(&MockDevice::new("dev", 1))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            discover_uncached(&connection).await.unwrap_err(),
            ResultCode::GattFailure
        );
    }

    #[tokio::test]
    async fn test_locate_uses_cached_lists() {
        let data = MockCharacteristic::new(DATA);
        let service = MockService::new(SERVICE, vec![data.clone()]);

        let found = locate_characteristic(&[service.clone()], &uuid(SERVICE), &uuid(DATA))
            .await
            .unwrap();

        assert!(found.same_handle(&data));
        assert_eq!(service.characteristic_queries(), vec![CacheMode::Cached]);
    }

    #[tokio::test]
    async fn test_locate_misses() {
        let service = MockService::new(SERVICE, vec![MockCharacteristic::new(DATA)]);
        let services = [service];

        let missing_service = locate_characteristic(&services, &uuid("180f"), &uuid(DATA)).await;
        assert_eq!(missing_service.err(), Some(CharLookup::ServiceNotFound));

        let missing_char = locate_characteristic(&services, &uuid(SERVICE), &uuid("2a19")).await;
        assert_eq!(missing_char.err(), Some(CharLookup::CharacteristicNotFound));
    }

    #[test]
    fn test_bind_never_replaces() {
        let mut catalog: ServiceCatalog<MockService, MockCharacteristic> = ServiceCatalog::new();
        let first = MockCharacteristic::new(DATA);

        assert!(catalog.bind(uuid(DATA), first.clone()));
        assert!(!catalog.bind(uuid(DATA), MockCharacteristic::new(DATA)));

        assert_eq!(catalog.len(), 1);
        assert!(catalog.entry(&uuid(DATA)).unwrap().handle().same_handle(&first));
    }

    #[test]
    fn test_entry_dispatches_to_latest_callback() {
        let entry = CharacteristicEntry::new(MockCharacteristic::new(DATA));
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let first = seen.clone();
        entry.set_callback(Arc::new(move |bytes: Vec<u8>| first.lock().unwrap().push(("old", bytes))));
        let second = seen.clone();
        entry.set_callback(Arc::new(move |bytes: Vec<u8>| second.lock().unwrap().push(("new", bytes))));

        entry.dispatch(vec![1, 2]);
        assert_eq!(*seen.lock().unwrap(), vec![("new", vec![1, 2])]);
        assert!(entry.claim_value_handler());
        assert!(!entry.claim_value_handler());
    }
}
