use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

use crate::{
    transport::{ConnectionHandle, Transport},
    types::DeviceIdentity,
};

/// Model Number String (0x2A24)
pub const MODEL_NUMBER_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2a24_0000_1000_8000_0080_5f9b_34fb);
/// Serial Number String (0x2A25)
pub const SERIAL_NUMBER_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2a25_0000_1000_8000_0080_5f9b_34fb);
/// Firmware Revision String (0x2A26)
pub const FIRMWARE_REVISION_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2a26_0000_1000_8000_0080_5f9b_34fb);
/// Hardware Revision String (0x2A27)
pub const HARDWARE_REVISION_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2a27_0000_1000_8000_0080_5f9b_34fb);
/// Software Revision String (0x2A28)
pub const SOFTWARE_REVISION_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2a28_0000_1000_8000_0080_5f9b_34fb);
/// Manufacturer Name String (0x2A29)
pub const MANUFACTURER_NAME_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2a29_0000_1000_8000_0080_5f9b_34fb);

/// [`DeviceIdentity`] field filled by one identity characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityField {
    /// Model number
    ModelNumber,
    /// Serial number
    SerialNumber,
    /// Firmware revision
    FirmwareRevision,
    /// Hardware revision
    HardwareRevision,
    /// Software revision
    SoftwareRevision,
    /// Manufacturer name
    ManufacturerName,
}

impl IdentityField {
    /// Field name as it appears on [`DeviceIdentity`]
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ModelNumber => "model_number",
            Self::SerialNumber => "serial_number",
            Self::FirmwareRevision => "firmware_revision",
            Self::HardwareRevision => "hardware_revision",
            Self::SoftwareRevision => "software_revision",
            Self::ManufacturerName => "manufacturer_name",
        }
    }

    fn slot(self, identity: &mut DeviceIdentity) -> &mut Option<String> {
        match self {
            Self::ModelNumber => &mut identity.model_number,
            Self::SerialNumber => &mut identity.serial_number,
            Self::FirmwareRevision => &mut identity.firmware_revision,
            Self::HardwareRevision => &mut identity.hardware_revision,
            Self::SoftwareRevision => &mut identity.software_revision,
            Self::ManufacturerName => &mut identity.manufacturer_name,
        }
    }
}

/// Identity characteristics in read order, with the field each one fills
pub const IDENTITY_CHARACTERISTICS: [(Uuid, IdentityField); 6] = [
    (MODEL_NUMBER_CHAR_UUID, IdentityField::ModelNumber),
    (SERIAL_NUMBER_CHAR_UUID, IdentityField::SerialNumber),
    (FIRMWARE_REVISION_CHAR_UUID, IdentityField::FirmwareRevision),
    (HARDWARE_REVISION_CHAR_UUID, IdentityField::HardwareRevision),
    (SOFTWARE_REVISION_CHAR_UUID, IdentityField::SoftwareRevision),
    (MANUFACTURER_NAME_CHAR_UUID, IdentityField::ManufacturerName),
];

/// Read whatever identity strings the locomotive exposes
///
/// `available` holds the characteristics discovered under the Device
/// Information Service. Characteristics that are absent, unreadable or empty
/// leave their field unset; this never fails.
pub async fn read_identity(
    transport: &dyn Transport,
    handle: ConnectionHandle,
    available: &HashSet<Uuid>,
) -> DeviceIdentity {
    let mut identity = DeviceIdentity::default();

    for (uuid, field) in IDENTITY_CHARACTERISTICS {
        if !available.contains(&uuid) {
            continue;
        }

        let value = match transport.read_characteristic(handle, uuid).await {
            Ok(raw) => decode_string(&raw),
            Err(e) => {
                debug!("Could not read {}: {e}", field.name());
                None
            }
        };

        *field.slot(&mut identity) = value;
    }

    debug!("Device identity: {identity:?}");
    identity
}

/// Lossy UTF-8 with surrounding whitespace and NUL padding removed
fn decode_string(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
