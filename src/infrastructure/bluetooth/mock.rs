//! Scripted in-memory BLE platform
//!
//! Every call is recorded so tests can assert on what the session asked
//! the radio to do, not only on what it returned.

use crate::domain::address::{CanonicalUuid, MacAddress};
use crate::domain::error::PlatformError;
use crate::domain::settings::PairingProtection;
use crate::infrastructure::bluetooth::platform::{
    BlePlatform, CacheMode, GattCharacteristic, GattQuery, GattService, GattStatus, LeConnection,
    NotifyCallback, PairingKind, PairingKinds, PairingResponder, PairingResponse, PairingStatus,
    ScanEvent, ScanWatcher, UnpairingStatus,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn os_fault(code: u32, message: &str) -> PlatformError {
    PlatformError::Os {
        code: code as i32,
        message: message.into(),
    }
}

/// Platform calls that can be made to fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformFault {
    Watch,
    PairingState,
    Pair,
    Unpair,
}

/// Enumerated device record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockDevice {
    pub id: String,
    pub address: u64,
}

impl MockDevice {
    pub fn new(id: impl Into<String>, address: u64) -> Self {
        Self {
            id: id.into(),
            address,
        }
    }
}

struct CharacteristicState {
    uuid: CanonicalUuid,
    write_status: Mutex<GattStatus>,
    write_fault: AtomicBool,
    handler_fault: AtomicBool,
    cccd_status: Mutex<GattStatus>,
    writes: Mutex<Vec<Vec<u8>>>,
    cccd_writes: AtomicUsize,
    handlers: Mutex<Vec<NotifyCallback>>,
}

#[derive(Clone)]
pub struct MockCharacteristic {
    inner: Arc<CharacteristicState>,
}

impl fmt::Debug for MockCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockCharacteristic")
            .field("uuid", &self.inner.uuid)
            .finish()
    }
}

impl MockCharacteristic {
    /// Panics on an invalid UUID; mock fixtures are static.
    pub fn new(uuid: &str) -> Self {
        Self {
            inner: Arc::new(CharacteristicState {
                uuid: CanonicalUuid::parse(uuid).expect("fixture uuid"),
                write_status: Mutex::new(GattStatus::SUCCESS),
                write_fault: AtomicBool::new(false),
                handler_fault: AtomicBool::new(false),
                cccd_status: Mutex::new(GattStatus::SUCCESS),
                writes: Mutex::new(Vec::new()),
                cccd_writes: AtomicUsize::new(0),
                handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_write_status(&self, status: GattStatus) {
        *lock(&self.inner.write_status) = status;
    }

    /// Make writes fail at the transport level instead of returning a status
    pub fn fail_writes(&self) {
        self.inner.write_fault.store(true, Ordering::SeqCst);
    }

    /// Make attaching a value-change handler fail
    pub fn fail_value_handler(&self) {
        self.inner.handler_fault.store(true, Ordering::SeqCst);
    }

    pub fn set_cccd_status(&self, status: GattStatus) {
        *lock(&self.inner.cccd_status) = status;
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.inner.writes).clone()
    }

    pub fn cccd_write_count(&self) -> usize {
        self.inner.cccd_writes.load(Ordering::SeqCst)
    }

    pub fn handler_count(&self) -> usize {
        lock(&self.inner.handlers).len()
    }

    /// Deliver a value-changed event to every attached handler
    pub fn emit(&self, payload: &[u8]) {
        let handlers = lock(&self.inner.handlers).clone();
        for handler in handlers {
            handler(payload.to_vec());
        }
    }

    pub fn same_handle(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[async_trait]
impl GattCharacteristic for MockCharacteristic {
    fn uuid(&self) -> Result<CanonicalUuid, PlatformError> {
        Ok(self.inner.uuid.clone())
    }

    async fn write_value(&self, data: &[u8]) -> Result<GattStatus, PlatformError> {
        if self.inner.write_fault.load(Ordering::SeqCst) {
            return Err(os_fault(0x8000_000E, "device unreachable"));
        }
        lock(&self.inner.writes).push(data.to_vec());
        Ok(*lock(&self.inner.write_status))
    }

    async fn enable_notifications(&self) -> Result<GattStatus, PlatformError> {
        self.inner.cccd_writes.fetch_add(1, Ordering::SeqCst);
        Ok(*lock(&self.inner.cccd_status))
    }

    fn on_value_changed(&self, handler: NotifyCallback) -> Result<(), PlatformError> {
        if self.inner.handler_fault.load(Ordering::SeqCst) {
            return Err(os_fault(0x8000_4005, "Unspecified error"));
        }
        lock(&self.inner.handlers).push(handler);
        Ok(())
    }
}

struct ServiceState {
    uuid: CanonicalUuid,
    characteristics: Vec<MockCharacteristic>,
    queries: Mutex<Vec<CacheMode>>,
}

#[derive(Clone)]
pub struct MockService {
    inner: Arc<ServiceState>,
}

impl fmt::Debug for MockService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockService")
            .field("uuid", &self.inner.uuid)
            .field("characteristics", &self.inner.characteristics)
            .finish()
    }
}

impl MockService {
    pub fn new(uuid: &str, characteristics: Vec<MockCharacteristic>) -> Self {
        Self {
            inner: Arc::new(ServiceState {
                uuid: CanonicalUuid::parse(uuid).expect("fixture uuid"),
                characteristics,
                queries: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Cache modes of every characteristic enumeration, in call order
    pub fn characteristic_queries(&self) -> Vec<CacheMode> {
        lock(&self.inner.queries).clone()
    }
}

#[async_trait]
impl GattService for MockService {
    type Characteristic = MockCharacteristic;

    fn uuid(&self) -> Result<CanonicalUuid, PlatformError> {
        Ok(self.inner.uuid.clone())
    }

    async fn characteristics(
        &self,
        mode: CacheMode,
    ) -> Result<GattQuery<MockCharacteristic>, PlatformError> {
        lock(&self.inner.queries).push(mode);
        Ok(GattQuery::success(self.inner.characteristics.clone()))
    }
}

struct MockState {
    scan_script: Vec<ScanEvent<MockDevice>>,
    scan_sender: Option<mpsc::UnboundedSender<ScanEvent<MockDevice>>>,
    watch_targets: Vec<MacAddress>,
    connect_calls: Vec<String>,
    connect_faults: HashSet<String>,
    faults: HashSet<PlatformFault>,
    unreachable: HashSet<String>,
    paired: HashSet<String>,
    pairing_requests: Vec<PairingKind>,
    pairing_answers: Vec<PairingResponse>,
    pair_calls: Vec<(PairingKinds, PairingProtection)>,
    pair_status: PairingStatus,
    unpair_calls: usize,
    unpair_status: UnpairingStatus,
    services: Vec<MockService>,
    services_status: GattStatus,
    service_queries: Vec<CacheMode>,
}

struct Shared {
    state: Mutex<MockState>,
    watcher_stopped: Arc<AtomicBool>,
}

/// Cloning shares the scripted state
#[derive(Clone)]
pub struct MockPlatform {
    shared: Arc<Shared>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MockState {
                    scan_script: Vec::new(),
                    scan_sender: None,
                    watch_targets: Vec::new(),
                    connect_calls: Vec::new(),
                    connect_faults: HashSet::new(),
                    faults: HashSet::new(),
                    unreachable: HashSet::new(),
                    paired: HashSet::new(),
                    pairing_requests: Vec::new(),
                    pairing_answers: Vec::new(),
                    pair_calls: Vec::new(),
                    pair_status: PairingStatus::PAIRED,
                    unpair_calls: 0,
                    unpair_status: UnpairingStatus::UNPAIRED,
                    services: Vec::new(),
                    services_status: GattStatus::SUCCESS,
                    service_queries: Vec::new(),
                }),
                watcher_stopped: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        lock(&self.shared.state)
    }

    /// Events delivered as soon as a watch starts
    pub fn script_scan(&self, events: Vec<ScanEvent<MockDevice>>) {
        self.state().scan_script = events;
    }

    /// Deliver an event into the currently running watch, if any
    pub fn emit_scan(&self, event: ScanEvent<MockDevice>) -> bool {
        match &self.state().scan_sender {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Drop the running watch's event sender, as a platform that stops
    /// reporting would
    pub fn close_scan(&self) {
        self.state().scan_sender.take();
    }

    pub fn fail_connect(&self, device_id: &str) {
        self.state().connect_faults.insert(device_id.to_string());
    }

    pub fn fail(&self, fault: PlatformFault) {
        self.state().faults.insert(fault);
    }

    pub fn make_unreachable(&self, device_id: &str) {
        self.state().unreachable.insert(device_id.to_string());
    }

    pub fn make_reachable(&self, device_id: &str) {
        self.state().unreachable.remove(device_id);
    }

    pub fn set_paired(&self, device_id: &str) {
        self.state().paired.insert(device_id.to_string());
    }

    /// Requests the platform raises during the next pairing attempt
    pub fn script_pairing_requests(&self, kinds: Vec<PairingKind>) {
        self.state().pairing_requests = kinds;
    }

    pub fn set_pair_status(&self, status: PairingStatus) {
        self.state().pair_status = status;
    }

    pub fn set_unpair_status(&self, status: UnpairingStatus) {
        self.state().unpair_status = status;
    }

    pub fn set_services(&self, services: Vec<MockService>) {
        self.state().services = services;
    }

    pub fn set_services_status(&self, status: GattStatus) {
        self.state().services_status = status;
    }

    pub fn watcher_stopped(&self) -> bool {
        self.shared.watcher_stopped.load(Ordering::SeqCst)
    }

    pub fn watch_targets(&self) -> Vec<MacAddress> {
        self.state().watch_targets.clone()
    }

    pub fn connect_calls(&self) -> Vec<String> {
        self.state().connect_calls.clone()
    }

    pub fn pair_calls(&self) -> Vec<(PairingKinds, PairingProtection)> {
        self.state().pair_calls.clone()
    }

    pub fn pairing_answers(&self) -> Vec<PairingResponse> {
        self.state().pairing_answers.clone()
    }

    pub fn unpair_calls(&self) -> usize {
        self.state().unpair_calls
    }

    pub fn service_queries(&self) -> Vec<CacheMode> {
        self.state().service_queries.clone()
    }
}

pub struct MockWatcher {
    stopped: Arc<AtomicBool>,
}

impl ScanWatcher for MockWatcher {
    fn stop(&self) -> Result<(), PlatformError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockConnection {
    address: u64,
    platform: MockPlatform,
}

#[async_trait]
impl LeConnection for MockConnection {
    type Service = MockService;

    fn bluetooth_address(&self) -> Result<u64, PlatformError> {
        Ok(self.address)
    }

    async fn gatt_services(&self, mode: CacheMode) -> Result<GattQuery<MockService>, PlatformError> {
        let mut state = self.platform.state();
        state.service_queries.push(mode);
        if !state.services_status.is_success() {
            return Ok(GattQuery::failed(state.services_status));
        }
        Ok(GattQuery::success(state.services.clone()))
    }
}

#[async_trait]
impl BlePlatform for MockPlatform {
    type Device = MockDevice;
    type Connection = MockConnection;
    type Service = MockService;
    type Characteristic = MockCharacteristic;
    type Watcher = MockWatcher;

    fn watch(
        &self,
        target: &MacAddress,
        events: mpsc::UnboundedSender<ScanEvent<MockDevice>>,
    ) -> Result<MockWatcher, PlatformError> {
        self.shared.watcher_stopped.store(false, Ordering::SeqCst);

        let mut state = self.state();
        state.watch_targets.push(target.clone());
        if state.faults.contains(&PlatformFault::Watch) {
            return Err(os_fault(0x8007_048F, "The device is not connected."));
        }
        for event in state.scan_script.clone() {
            let _ = events.send(event);
        }
        // Keep the channel open like a live watcher would
        state.scan_sender = Some(events);

        Ok(MockWatcher {
            stopped: self.shared.watcher_stopped.clone(),
        })
    }

    async fn connect(&self, device: &MockDevice) -> Result<Option<MockConnection>, PlatformError> {
        let mut state = self.state();
        state.connect_calls.push(device.id.clone());

        if state.connect_faults.contains(&device.id) {
            return Err(os_fault(0x8007_0005, "Access is denied."));
        }
        if state.unreachable.contains(&device.id) {
            return Ok(None);
        }

        Ok(Some(MockConnection {
            address: device.address,
            platform: self.clone(),
        }))
    }

    async fn is_paired(&self, device: &MockDevice) -> Result<bool, PlatformError> {
        let state = self.state();
        if state.faults.contains(&PlatformFault::PairingState) {
            return Err(PlatformError::unavailable("device information"));
        }
        Ok(state.paired.contains(&device.id))
    }

    async fn pair(
        &self,
        device: &MockDevice,
        kinds: PairingKinds,
        protection: PairingProtection,
        responder: Arc<dyn PairingResponder>,
    ) -> Result<PairingStatus, PlatformError> {
        let mut state = self.state();
        state.pair_calls.push((kinds, protection));
        if state.faults.contains(&PlatformFault::Pair) {
            return Err(os_fault(0x8000_4005, "Unspecified error"));
        }

        let requests = std::mem::take(&mut state.pairing_requests);
        for kind in requests {
            let answer = responder.respond(kind);
            state.pairing_answers.push(answer);
        }

        let status = state.pair_status;
        if status == PairingStatus::PAIRED {
            state.paired.insert(device.id.clone());
        }
        Ok(status)
    }

    async fn unpair(&self, device: &MockDevice) -> Result<UnpairingStatus, PlatformError> {
        let mut state = self.state();
        state.unpair_calls += 1;
        if state.faults.contains(&PlatformFault::Unpair) {
            return Err(os_fault(0x8000_4005, "Unspecified error"));
        }
        state.paired.remove(&device.id);
        Ok(state.unpair_status)
    }
}
