//! Bluetooth Low Energy transport layer.
//!
//! [`Transport`] is the narrow seam between the rest of the crate and the
//! hardware link: the operation queue and polling engine only ever see this
//! trait, which keeps them testable without a radio. [`PeripheralTransport`]
//! is the btleplug-backed implementation used in production.

use async_trait::async_trait;
use btleplug::{
    api::{Characteristic, Peripheral as _, PeripheralProperties, WriteType},
    platform::Peripheral,
};
use std::collections::HashMap;
use uuid::Uuid;

use crate::{
    error::{KinetraError, Result},
    types::ScannedDevice,
    DEVICE_NAME_PREFIX, KINETRA_DIAGNOSTIC_CHAR_UUID, KINETRA_HEURISTIC_CHAR_UUID,
    KINETRA_MODE_CHAR_UUID, KINETRA_MONITOR_CHAR_UUID, KINETRA_REPS_CHAR_UUID,
    KINETRA_RX_CHAR_UUID, KINETRA_SERVICE_UUID, KINETRA_VERSION_CHAR_UUID,
    KINETRA_WRITE_CHAR_UUID, STANDARD_FIRMWARE_REVISION_UUID,
};

/// The characteristics this crate talks to, by role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicTarget {
    /// Write characteristic receiving all command frames
    Command,
    /// Dedicated monitor/sample characteristic, polled at high frequency
    Monitor,
    /// Rep-notification characteristic (no opcode prefix)
    Reps,
    /// Diagnostic/property characteristic, polled as a low-rate keep-alive
    Diagnostic,
    /// Heuristic force/phase telemetry characteristic
    Heuristic,
    /// Firmware-internal version characteristic, logging only
    Version,
    /// Device mode characteristic, logging only
    Mode,
    /// Secondary RX notification channel carrying opcode-prefixed frames
    Rx,
    /// Standard device-information firmware revision string
    Firmware,
}

impl CharacteristicTarget {
    /// The GATT UUID backing this target
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        match self {
            Self::Command => KINETRA_WRITE_CHAR_UUID,
            Self::Monitor => KINETRA_MONITOR_CHAR_UUID,
            Self::Reps => KINETRA_REPS_CHAR_UUID,
            Self::Diagnostic => KINETRA_DIAGNOSTIC_CHAR_UUID,
            Self::Heuristic => KINETRA_HEURISTIC_CHAR_UUID,
            Self::Version => KINETRA_VERSION_CHAR_UUID,
            Self::Mode => KINETRA_MODE_CHAR_UUID,
            Self::Rx => KINETRA_RX_CHAR_UUID,
            Self::Firmware => STANDARD_FIRMWARE_REVISION_UUID,
        }
    }

    /// Targets that must exist for the link to be usable
    pub const REQUIRED: [Self; 4] = [Self::Command, Self::Monitor, Self::Reps, Self::Rx];

    const ALL: [Self; 9] = [
        Self::Command,
        Self::Monitor,
        Self::Reps,
        Self::Diagnostic,
        Self::Heuristic,
        Self::Version,
        Self::Mode,
        Self::Rx,
        Self::Firmware,
    ];
}

/// Read/write access to the live link
///
/// The underlying hardware corrupts interleaved operations, so implementors
/// are NOT required to be safe for concurrent use; every call site must route
/// through the operation queue. Receiving a handle as a parameter at the
/// point of use (rather than holding one across suspension points) is the
/// crate-wide convention that keeps stale handles from outliving a
/// disconnect.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Read the current value of a characteristic
    async fn read(&self, target: CharacteristicTarget) -> Result<Vec<u8>>;

    /// Write a command frame to a characteristic
    async fn write(&self, target: CharacteristicTarget, data: &[u8]) -> Result<()>;

    /// Whether the link is still up
    async fn is_connected(&self) -> bool;

    /// Tear the link down
    async fn disconnect(&self) -> Result<()>;
}

/// Platform-specific link tuning hooks
///
/// MTU negotiation and connection-priority requests differ by OS and are not
/// part of the portable BLE surface. Implementations are injected at
/// construction; the defaults do nothing, which is correct on platforms where
/// the OS negotiates these on its own.
#[async_trait]
pub trait PlatformHooks: Send + Sync {
    /// Request a larger transport MTU, when the platform supports asking
    async fn negotiate_mtu(&self, _peripheral: &Peripheral) -> Result<()> {
        Ok(())
    }

    /// Request a high-priority connection interval
    async fn request_connection_priority(&self, _peripheral: &Peripheral) -> Result<()> {
        Ok(())
    }
}

/// The no-op default hooks
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPlatformHooks;

#[async_trait]
impl PlatformHooks for DefaultPlatformHooks {}

/// btleplug-backed [`Transport`] over a connected peripheral
pub struct PeripheralTransport {
    peripheral: Peripheral,
    characteristics: HashMap<CharacteristicTarget, Characteristic>,
}

impl PeripheralTransport {
    /// Resolve characteristics on an already-connected peripheral
    ///
    /// Service discovery must have completed. Optional characteristics
    /// (diagnostic, heuristic, version, mode, firmware) may be absent on
    /// older firmware; the corresponding poll loops shut themselves down on
    /// first read instead.
    ///
    /// # Errors
    ///
    /// Returns [`KinetraError::CharacteristicNotFound`] when any required
    /// characteristic is missing.
    pub fn resolve(peripheral: Peripheral) -> Result<Self> {
        let discovered = peripheral.characteristics();
        let mut characteristics = HashMap::new();

        for target in CharacteristicTarget::ALL {
            if let Some(c) = discovered.iter().find(|c| c.uuid == target.uuid()) {
                characteristics.insert(target, c.clone());
            }
        }

        for target in CharacteristicTarget::REQUIRED {
            if !characteristics.contains_key(&target) {
                return Err(KinetraError::CharacteristicNotFound(format!(
                    "{target:?} ({})",
                    target.uuid()
                )));
            }
        }

        Ok(Self {
            peripheral,
            characteristics,
        })
    }

    /// The underlying peripheral handle
    #[must_use]
    pub const fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    fn characteristic(&self, target: CharacteristicTarget) -> Result<&Characteristic> {
        self.characteristics
            .get(&target)
            .ok_or_else(|| KinetraError::CharacteristicNotFound(format!("{target:?}")))
    }

    /// Subscribe to notifications on a characteristic
    ///
    /// # Errors
    ///
    /// Returns [`KinetraError::CharacteristicNotFound`] if the characteristic
    /// is absent, or [`KinetraError::Ble`] if the subscription fails.
    pub async fn subscribe(&self, target: CharacteristicTarget) -> Result<()> {
        let characteristic = self.characteristic(target)?;
        self.peripheral.subscribe(characteristic).await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for PeripheralTransport {
    async fn read(&self, target: CharacteristicTarget) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(target)?;
        Ok(self.peripheral.read(characteristic).await?)
    }

    async fn write(&self, target: CharacteristicTarget, data: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(target)?;
        self.peripheral
            .write(characteristic, data, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

/// Check whether an advertisement looks like a Kinetra trainer
#[must_use]
pub(crate) fn advertisement_matches(properties: &PeripheralProperties) -> bool {
    if let Some(name) = &properties.local_name {
        if name.starts_with(DEVICE_NAME_PREFIX) {
            return true;
        }
    }

    properties.services.contains(&KINETRA_SERVICE_UUID)
        || properties.service_data.contains_key(&KINETRA_SERVICE_UUID)
}

/// Build a [`ScannedDevice`] from advertisement properties
///
/// Only names carrying the known prefix count as real names; anything else is
/// a placeholder entry identified by address alone.
#[must_use]
pub(crate) fn scanned_device_from(
    address: String,
    properties: &PeripheralProperties,
) -> ScannedDevice {
    let name = properties
        .local_name
        .clone()
        .filter(|n| n.starts_with(DEVICE_NAME_PREFIX));

    ScannedDevice {
        name,
        address,
        rssi: properties.rssi.unwrap_or(0),
    }
}

/// Merge a discovery result into the live scanned-device list
///
/// Entries are keyed by address. A named entry supersedes a placeholder with
/// the same physical identity; a placeholder never erases a known name. The
/// list stays ordered by descending signal strength.
pub(crate) fn merge_scanned_device(devices: &mut Vec<ScannedDevice>, device: ScannedDevice) {
    if let Some(existing) = devices.iter_mut().find(|d| d.address == device.address) {
        if device.is_named() {
            existing.name = device.name;
        }
        existing.rssi = device.rssi;
    } else {
        devices.push(device);
    }

    devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: Option<&str>, address: &str, rssi: i16) -> ScannedDevice {
        ScannedDevice {
            name: name.map(String::from),
            address: address.to_string(),
            rssi,
        }
    }

    #[test]
    fn test_target_uuids_unique() {
        let mut seen = std::collections::HashSet::new();
        for target in CharacteristicTarget::ALL {
            assert!(seen.insert(target.uuid()), "duplicate UUID for {target:?}");
        }
    }

    #[test]
    fn test_named_device_supersedes_placeholder() {
        let mut devices = Vec::new();
        merge_scanned_device(&mut devices, device(None, "AA:BB", -70));
        merge_scanned_device(&mut devices, device(Some("Kinetra-A1B2"), "AA:BB", -65));

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name.as_deref(), Some("Kinetra-A1B2"));
        assert_eq!(devices[0].rssi, -65);
    }

    #[test]
    fn test_placeholder_never_erases_name() {
        let mut devices = Vec::new();
        merge_scanned_device(&mut devices, device(Some("Kinetra-A1B2"), "AA:BB", -65));
        merge_scanned_device(&mut devices, device(None, "AA:BB", -60));

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name.as_deref(), Some("Kinetra-A1B2"));
        assert_eq!(devices[0].rssi, -60);
    }

    #[test]
    fn test_list_ordered_by_signal_strength() {
        let mut devices = Vec::new();
        merge_scanned_device(&mut devices, device(Some("Kinetra-1"), "AA:01", -80));
        merge_scanned_device(&mut devices, device(Some("Kinetra-2"), "AA:02", -50));
        merge_scanned_device(&mut devices, device(Some("Kinetra-3"), "AA:03", -65));

        let order: Vec<i16> = devices.iter().map(|d| d.rssi).collect();
        assert_eq!(order, vec![-50, -65, -80]);
    }
}
