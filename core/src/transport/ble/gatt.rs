/// GATT service definition for BLE messaging
///
/// Both roles must agree on the service and characteristic identifiers, otherwise
/// discovery fails silently: the central never sees the peripheral, or never
/// matches its characteristic.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::MessagingError;

/// Messaging service UUID advertised by the peripheral
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xE20A39F4_73F5_4BC4_A12F_17D1AD07A961);

/// Message characteristic UUID (notify + write-without-response)
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x08590F7E_DB05_467E_8757_72F6FAEB13D4);

/// Client Characteristic Configuration Descriptor, needed by platforms that
/// enable notifications through an explicit descriptor write.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805F9B34FB);

/// Bluetooth SIG base UUID used to expand 16/32-bit short identifiers
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805F9B34FB);

/// The service/characteristic pair shared by both roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// Primary service carrying the message characteristic
    pub service: Uuid,
    /// The single characteristic used for every chunk in both directions
    pub characteristic: Uuid,
}

impl Default for ServiceIdentity {
    fn default() -> Self {
        Self {
            service: SERVICE_UUID,
            characteristic: CHARACTERISTIC_UUID,
        }
    }
}

impl ServiceIdentity {
    /// Create an identity from explicit identifiers
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }

    /// Same characteristic, different service
    pub fn with_service(self, service: Uuid) -> Self {
        Self { service, ..self }
    }
}

/// Characteristic properties as reported by discovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub notify: bool,
    pub write_without_response: bool,
    pub write: bool,
    pub read: bool,
}

impl CharacteristicProperties {
    /// Properties of the message characteristic published by the peripheral
    pub fn messaging() -> Self {
        Self {
            notify: true,
            write_without_response: true,
            write: false,
            read: false,
        }
    }
}

/// A characteristic found on a remote service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// Parse a caller-supplied service UUID.
///
/// Accepts the canonical 128-bit form (with or without hyphens, braces or a
/// `urn:uuid:` prefix) and 16/32-bit short forms, which are expanded onto the
/// Bluetooth base UUID.
pub fn parse_service_uuid(input: &str) -> Result<Uuid, MessagingError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(MessagingError::InvalidUuid(input.to_string()));
    }

    if let Ok(uuid) = Uuid::parse_str(trimmed) {
        return Ok(uuid);
    }

    let short = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if matches!(short.len(), 4 | 8) && short.chars().all(|c| c.is_ascii_hexdigit()) {
        let value = u32::from_str_radix(short, 16)
            .map_err(|_| MessagingError::InvalidUuid(input.to_string()))?;
        return Ok(expand_short_uuid(value));
    }

    Err(MessagingError::InvalidUuid(input.to_string()))
}

/// Expand a 16/32-bit assigned number onto the Bluetooth base UUID
pub fn expand_short_uuid(value: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((value as u128) << 96))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_identifiers() {
        assert_eq!(
            SERVICE_UUID.to_string().to_uppercase(),
            "E20A39F4-73F5-4BC4-A12F-17D1AD07A961"
        );
        assert_eq!(
            CHARACTERISTIC_UUID.to_string().to_uppercase(),
            "08590F7E-DB05-467E-8757-72F6FAEB13D4"
        );
        let identity = ServiceIdentity::default();
        assert_eq!(identity.service, SERVICE_UUID);
        assert_eq!(identity.characteristic, CHARACTERISTIC_UUID);
    }

    #[test]
    fn test_parse_full_uuid() {
        let parsed = parse_service_uuid("e20a39f4-73f5-4bc4-a12f-17d1ad07a961").expect("valid");
        assert_eq!(parsed, SERVICE_UUID);

        let simple = parse_service_uuid("E20A39F473F54BC4A12F17D1AD07A961").expect("valid");
        assert_eq!(simple, SERVICE_UUID);
    }

    #[test]
    fn test_parse_short_uuid() {
        let parsed = parse_service_uuid("180D").expect("valid short form");
        assert_eq!(
            parsed.to_string().to_uppercase(),
            "0000180D-0000-1000-8000-00805F9B34FB"
        );

        let with_prefix = parse_service_uuid("0x2902").expect("valid short form");
        assert_eq!(with_prefix, CCCD_UUID);

        let thirty_two = parse_service_uuid("1234ABCD").expect("valid 32-bit form");
        assert_eq!(
            thirty_two.to_string().to_uppercase(),
            "1234ABCD-0000-1000-8000-00805F9B34FB"
        );
    }

    #[test]
    fn test_parse_invalid_uuid() {
        for input in ["", "   ", "not-a-uuid", "12345", "GGGG", "E20A39F4-73F5"] {
            let result = parse_service_uuid(input);
            assert!(
                matches!(result, Err(MessagingError::InvalidUuid(_))),
                "{input:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_identity_with_service() {
        let custom = expand_short_uuid(0xFEED);
        let identity = ServiceIdentity::default().with_service(custom);
        assert_eq!(identity.service, custom);
        assert_eq!(identity.characteristic, CHARACTERISTIC_UUID);
    }
}
