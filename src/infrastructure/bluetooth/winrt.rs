//! WinRT Backend
//!
//! Implements the platform traits on top of `Windows.Devices.Bluetooth`
//! and `Windows.Devices.Enumeration`.

use crate::domain::address::{CanonicalUuid, MacAddress};
use crate::domain::error::PlatformError;
use crate::domain::settings::PairingProtection;
use crate::infrastructure::bluetooth::platform::{
    BlePlatform, CacheMode, GattCharacteristic, GattQuery, GattService, GattStatus, LeConnection,
    NotifyCallback, PairingKind, PairingKinds, PairingResponder, PairingResponse, PairingStatus,
    ScanEvent, ScanWatcher, UnpairingStatus,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use windows::core::{IInspectable, Ref, GUID, HSTRING};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic as WinGattCharacteristic,
    GattClientCharacteristicConfigurationDescriptorValue, GattDeviceService,
    GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothCacheMode, BluetoothLEDevice};
use windows::Devices::Enumeration::{
    DeviceInformation, DeviceInformationCustomPairing, DeviceInformationKind,
    DeviceInformationUpdate, DevicePairingKinds, DevicePairingProtectionLevel,
    DevicePairingRequestedEventArgs, DeviceWatcher, DeviceWatcherStatus,
};
use windows::Foundation::Collections::IIterable;
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter};
use windows::Win32::Foundation::RPC_E_CHANGED_MODE;
use windows::Win32::System::Com::{CoInitializeEx, COINIT_MULTITHREADED};

/// Join the process-wide multithreaded apartment on the calling thread.
///
/// A thread already in a single-threaded apartment is left as it is.
pub fn init_apartment() -> Result<(), PlatformError> {
    // SAFETY: no reserved pointer is passed; balanced by process exit
    let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
    if let Err(e) = hr.ok() {
        if e.code() != RPC_E_CHANGED_MODE {
            return Err(e.into());
        }
        debug!("Thread already in a single-threaded apartment");
    }
    Ok(())
}

fn cache_mode(mode: CacheMode) -> BluetoothCacheMode {
    match mode {
        CacheMode::Cached => BluetoothCacheMode::Cached,
        CacheMode::Uncached => BluetoothCacheMode::Uncached,
    }
}

fn protection_level(protection: PairingProtection) -> DevicePairingProtectionLevel {
    match protection {
        PairingProtection::Default => DevicePairingProtectionLevel::Default,
        PairingProtection::None => DevicePairingProtectionLevel::None,
        PairingProtection::Encryption => DevicePairingProtectionLevel::Encryption,
        PairingProtection::EncryptionAndAuthentication => {
            DevicePairingProtectionLevel::EncryptionAndAuthentication
        }
    }
}

fn guid_to_uuid(guid: GUID) -> Result<CanonicalUuid, PlatformError> {
    let text = format!(
        "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        guid.data1,
        guid.data2,
        guid.data3,
        guid.data4[0],
        guid.data4[1],
        guid.data4[2],
        guid.data4[3],
        guid.data4[4],
        guid.data4[5],
        guid.data4[6],
        guid.data4[7],
    );
    CanonicalUuid::parse(&text).map_err(|e| PlatformError::unavailable(e.to_string()))
}

/// Windows BLE stack
#[derive(Debug, Clone, Default)]
pub struct WinRtPlatform;

impl WinRtPlatform {
    pub fn new() -> anyhow::Result<Self> {
        init_apartment()?;
        Ok(Self)
    }
}

pub struct WinRtWatcher {
    watcher: DeviceWatcher,
}

impl ScanWatcher for WinRtWatcher {
    fn stop(&self) -> Result<(), PlatformError> {
        let status = self.watcher.Status()?;
        if status == DeviceWatcherStatus::Started
            || status == DeviceWatcherStatus::EnumerationCompleted
        {
            info!("Stopping device watcher...");
            self.watcher.Stop()?;
        }
        Ok(())
    }
}

impl Drop for WinRtWatcher {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

pub struct WinRtConnection(BluetoothLEDevice);

#[async_trait]
impl LeConnection for WinRtConnection {
    type Service = WinRtService;

    fn bluetooth_address(&self) -> Result<u64, PlatformError> {
        Ok(self.0.BluetoothAddress()?)
    }

    async fn gatt_services(&self, mode: CacheMode) -> Result<GattQuery<WinRtService>, PlatformError> {
        let result = self
            .0
            .GetGattServicesWithCacheModeAsync(cache_mode(mode))?
            .await?;

        let status = GattStatus(result.Status()?.0);
        if !status.is_success() {
            return Ok(GattQuery::failed(status));
        }

        let services = result.Services()?;
        let mut items = Vec::with_capacity(services.Size()? as usize);
        for i in 0..services.Size()? {
            items.push(WinRtService(services.GetAt(i)?));
        }
        Ok(GattQuery::success(items))
    }
}

#[derive(Clone)]
pub struct WinRtService(GattDeviceService);

#[async_trait]
impl GattService for WinRtService {
    type Characteristic = WinRtCharacteristic;

    fn uuid(&self) -> Result<CanonicalUuid, PlatformError> {
        guid_to_uuid(self.0.Uuid()?)
    }

    async fn characteristics(
        &self,
        mode: CacheMode,
    ) -> Result<GattQuery<WinRtCharacteristic>, PlatformError> {
        let result = self
            .0
            .GetCharacteristicsWithCacheModeAsync(cache_mode(mode))?
            .await?;

        let status = GattStatus(result.Status()?.0);
        if !status.is_success() {
            return Ok(GattQuery::failed(status));
        }

        let characteristics = result.Characteristics()?;
        let mut items = Vec::with_capacity(characteristics.Size()? as usize);
        for i in 0..characteristics.Size()? {
            items.push(WinRtCharacteristic(characteristics.GetAt(i)?));
        }
        Ok(GattQuery::success(items))
    }
}

#[derive(Clone)]
pub struct WinRtCharacteristic(WinGattCharacteristic);

#[async_trait]
impl GattCharacteristic for WinRtCharacteristic {
    fn uuid(&self) -> Result<CanonicalUuid, PlatformError> {
        guid_to_uuid(self.0.Uuid()?)
    }

    async fn write_value(&self, data: &[u8]) -> Result<GattStatus, PlatformError> {
        let writer = DataWriter::new()?;
        writer.WriteBytes(data)?;
        let buffer = writer.DetachBuffer()?;

        let status = self.0.WriteValueAsync(&buffer)?.await?;
        Ok(GattStatus(status.0))
    }

    async fn enable_notifications(&self) -> Result<GattStatus, PlatformError> {
        let status = self
            .0
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )?
            .await?;
        Ok(GattStatus(status.0))
    }

    fn on_value_changed(&self, callback: NotifyCallback) -> Result<(), PlatformError> {
        let handler = TypedEventHandler::new(
            move |_: Ref<WinGattCharacteristic>, args: Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let reader = DataReader::FromBuffer(&args.CharacteristicValue()?)?;
                    let length = reader.UnconsumedBufferLength()? as usize;
                    let mut bytes = vec![0u8; length];
                    reader.ReadBytes(&mut bytes)?;
                    callback(bytes);
                }
                Ok(())
            },
        );

        // The registration lives as long as the characteristic object
        self.0.ValueChanged(&handler)?;
        Ok(())
    }
}

#[async_trait]
impl BlePlatform for WinRtPlatform {
    type Device = DeviceInformation;
    type Connection = WinRtConnection;
    type Service = WinRtService;
    type Characteristic = WinRtCharacteristic;
    type Watcher = WinRtWatcher;

    fn watch(
        &self,
        target: &MacAddress,
        events: mpsc::UnboundedSender<ScanEvent<DeviceInformation>>,
    ) -> Result<WinRtWatcher, PlatformError> {
        let selector = BluetoothLEDevice::GetDeviceSelectorFromBluetoothAddress(target.value())?;
        let watcher = DeviceInformation::CreateWatcherWithKindAqsFilterAndAdditionalProperties(
            &selector,
            None::<&IIterable<HSTRING>>,
            DeviceInformationKind::AssociationEndpoint,
        )?;

        let sender = events.clone();
        watcher.Added(&TypedEventHandler::new(
            move |_: Ref<DeviceWatcher>, info: Ref<DeviceInformation>| {
                if let Some(info) = info.as_ref() {
                    trace!("Watcher added {}", info.Id()?);
                    let _ = sender.send(ScanEvent::Added(info.clone()));
                }
                Ok(())
            },
        ))?;

        let sender = events.clone();
        watcher.Updated(&TypedEventHandler::new(
            move |_: Ref<DeviceWatcher>, update: Ref<DeviceInformationUpdate>| {
                if let Some(update) = update.as_ref() {
                    let _ = sender.send(ScanEvent::Updated(update.Id()?.to_string()));
                }
                Ok(())
            },
        ))?;

        let sender = events.clone();
        watcher.Removed(&TypedEventHandler::new(
            move |_: Ref<DeviceWatcher>, update: Ref<DeviceInformationUpdate>| {
                if let Some(update) = update.as_ref() {
                    let _ = sender.send(ScanEvent::Removed(update.Id()?.to_string()));
                }
                Ok(())
            },
        ))?;

        let sender = events.clone();
        watcher.EnumerationCompleted(&TypedEventHandler::new(
            move |_: Ref<DeviceWatcher>, _: Ref<IInspectable>| {
                let _ = sender.send(ScanEvent::EnumerationCompleted);
                Ok(())
            },
        ))?;

        let sender = events;
        watcher.Stopped(&TypedEventHandler::new(
            move |_: Ref<DeviceWatcher>, _: Ref<IInspectable>| {
                let _ = sender.send(ScanEvent::Stopped);
                Ok(())
            },
        ))?;

        watcher.Start()?;
        Ok(WinRtWatcher { watcher })
    }

    async fn connect(
        &self,
        device: &DeviceInformation,
    ) -> Result<Option<WinRtConnection>, PlatformError> {
        match BluetoothLEDevice::FromIdAsync(&device.Id()?)?.await {
            Ok(ble) => Ok(Some(WinRtConnection(ble))),
            // A null result surfaces as an error carrying a success code
            Err(e) if e.code().is_ok() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_paired(&self, device: &DeviceInformation) -> Result<bool, PlatformError> {
        Ok(device.Pairing()?.IsPaired()?)
    }

    async fn pair(
        &self,
        device: &DeviceInformation,
        kinds: PairingKinds,
        protection: PairingProtection,
        responder: Arc<dyn PairingResponder>,
    ) -> Result<PairingStatus, PlatformError> {
        let custom = device.Pairing()?.Custom()?;

        let token = custom.PairingRequested(&TypedEventHandler::new(
            move |_: Ref<DeviceInformationCustomPairing>,
                  args: Ref<DevicePairingRequestedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let kind = PairingKind::from_raw(args.PairingKind()?.0);
                    match responder.respond(kind) {
                        PairingResponse::Accept => args.Accept()?,
                        PairingResponse::AcceptWithPin(pin) => {
                            args.AcceptWithPin(&HSTRING::from(pin.as_str()))?
                        }
                        PairingResponse::Decline => warn!("Declined pairing request {:?}", kind),
                    }
                }
                Ok(())
            },
        ))?;

        let result = custom
            .PairWithProtectionLevelAsync(
                DevicePairingKinds(kinds.bits()),
                protection_level(protection),
            )?
            .await;

        if let Err(e) = custom.RemovePairingRequested(token) {
            debug!("Failed to remove pairing handler: {}", e);
        }

        Ok(PairingStatus(result?.Status()?.0))
    }

    async fn unpair(&self, device: &DeviceInformation) -> Result<UnpairingStatus, PlatformError> {
        let result = device.Pairing()?.UnpairAsync()?.await?;
        Ok(UnpairingStatus(result.Status()?.0))
    }
}
