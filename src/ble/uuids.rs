//! BLE Service, Characteristic and Descriptor UUIDs.
//!
//! Contains the UUID constants used by the GATT sensor family and the
//! helpers for comparing 16-bit short UUIDs against full 128-bit UUIDs.

use uuid::Uuid;

use crate::error::{Error, Result};

/// Bluetooth SIG base UUID (`0000xxxx-0000-1000-8000-00805f9b34fb`).
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

/// Sensor data service short UUID.
pub const SENSOR_SERVICE_SHORT: u16 = 0xFFE0;
/// Sensor data characteristic short UUID (Notify).
pub const SENSOR_CHARACTERISTIC_SHORT: u16 = 0xFFE1;
/// Client Characteristic Configuration descriptor short UUID.
pub const CCCD_SHORT: u16 = 0x2902;

/// Sensor data service UUID.
pub const SENSOR_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_ffe0_0000_1000_8000_00805f9b34fb);
/// Sensor data characteristic UUID.
pub const SENSOR_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_ffe1_0000_1000_8000_00805f9b34fb);
/// Client Characteristic Configuration descriptor UUID.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// Value written to the CCCD to enable notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Expand a 16-bit short UUID onto the Bluetooth base UUID.
pub const fn from_short(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Extract the 16-bit short form of a UUID.
///
/// This is the value of hex digits 5-8 of the canonical string form
/// (`0000FFE0-...` yields `0xFFE0`), regardless of the base UUID.
pub fn short_of(uuid: &Uuid) -> u16 {
    (uuid.as_u128() >> 96) as u16
}

/// Check whether a full UUID carries the given short UUID.
pub fn matches_short(uuid: &Uuid, short: u16) -> bool {
    short_of(uuid) == short
}

/// Parse a short UUID given as hex text (`"FFE0"`, `"ffe0"`, `"0xFFE0"`).
pub fn parse_short(text: &str) -> Result<u16> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.is_empty() || digits.len() > 4 {
        return Err(Error::InvalidParameter {
            name: "short_uuid".to_string(),
            value: text.to_string(),
        });
    }

    u16::from_str_radix(digits, 16).map_err(|_| Error::InvalidParameter {
        name: "short_uuid".to_string(),
        value: text.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        let service = SENSOR_SERVICE_UUID.to_string();
        assert_eq!(service, "0000ffe0-0000-1000-8000-00805f9b34fb");

        let cccd = CCCD_UUID.to_string();
        assert!(cccd.contains("2902"));
    }

    #[test]
    fn test_from_short_matches_constants() {
        assert_eq!(from_short(SENSOR_SERVICE_SHORT), SENSOR_SERVICE_UUID);
        assert_eq!(from_short(SENSOR_CHARACTERISTIC_SHORT), SENSOR_CHARACTERISTIC_UUID);
        assert_eq!(from_short(CCCD_SHORT), CCCD_UUID);
    }

    #[test]
    fn test_short_of_ignores_base() {
        let custom_base = Uuid::parse_str("0000FFE0-AAAA-BBBB-CCCC-DDDDEEEEFFFF").unwrap();
        assert_eq!(short_of(&custom_base), 0xFFE0);
        assert!(matches_short(&custom_base, SENSOR_SERVICE_SHORT));
        assert!(!matches_short(&CCCD_UUID, SENSOR_SERVICE_SHORT));
    }

    #[test]
    fn test_short_of_uses_middle_digits_only() {
        // Leading digits differ, digits 5-8 still match.
        let uuid = Uuid::parse_str("1234ffe0-0000-1000-8000-00805f9b34fb").unwrap();
        assert_eq!(short_of(&uuid), 0xFFE0);
    }

    #[test]
    fn test_parse_short() {
        assert_eq!(parse_short("FFE0").unwrap(), 0xFFE0);
        assert_eq!(parse_short("ffe1").unwrap(), 0xFFE1);
        assert_eq!(parse_short("0x2902").unwrap(), 0x2902);
        assert!(parse_short("").is_err());
        assert!(parse_short("FFE00").is_err());
        assert!(parse_short("zzzz").is_err());
    }
}
