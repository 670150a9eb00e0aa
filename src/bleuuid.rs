//! Utilities for dealing with BLE UUIDs, converting to and from their short
//! formats and normalizing the forms clients put on the wire.

use uuid::Uuid;

use crate::{Error, Result};

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BLUETOOTH_BASE_MASK: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;
const BLUETOOTH_BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

/// Convert a 32-bit BLE short UUID to a full 128-bit UUID by filling in the
/// standard Bluetooth Base UUID.
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Convert a 16-bit BLE short UUID to a full 128-bit UUID by filling in the
/// standard Bluetooth Base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// Normalize a UUID from the wire to the canonical full 128-bit form used
/// for every comparison in the bridge.
///
/// Recognized forms, all case-insensitive:
///
/// * a 4-hex-char short form (`"9800"`), expanded over the Bluetooth Base
///   UUID;
/// * a 32-hex-char full form without dashes;
/// * the dashed full form.
pub fn normalize_uuid(raw: &str) -> Result<Uuid> {
    let trimmed = raw.trim();
    let hex: String = trimmed.chars().filter(|c| *c != '-').collect();
    match hex.len() {
        4 => {
            let short = u16::from_str_radix(&hex, 16)
                .map_err(|_| Error::InvalidUuid(raw.to_string()))?;
            Ok(uuid_from_u16(short))
        }
        32 => Uuid::try_parse(&hex).map_err(|_| Error::InvalidUuid(raw.to_string())),
        _ => Err(Error::InvalidUuid(raw.to_string())),
    }
}

/// An extension trait for `Uuid` which provides BLE-specific methods.
pub trait BleUuid {
    /// If the UUID is a valid BLE short UUID then return its short form,
    /// otherwise return `None`.
    fn to_ble_u32(&self) -> Option<u32>;

    /// If the UUID is a valid 16-bit BLE short UUID then return its short
    /// form, otherwise return `None`.
    fn to_ble_u16(&self) -> Option<u16>;

    /// Convert the UUID to a string, using short format if applicable.
    fn to_short_string(&self) -> String;
}

impl BleUuid for Uuid {
    fn to_ble_u32(&self) -> Option<u32> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u32)
        } else {
            None
        }
    }

    fn to_ble_u16(&self) -> Option<u16> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_16 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u16)
        } else {
            None
        }
    }

    fn to_short_string(&self) -> String {
        if let Some(uuid16) = self.to_ble_u16() {
            format!("{:#04x}", uuid16)
        } else if let Some(uuid32) = self.to_ble_u32() {
            format!("{:#06x}", uuid32)
        } else {
            self.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_from_u16_test() {
        assert_eq!(
            uuid_from_u16(0x1122),
            Uuid::parse_str("00001122-0000-1000-8000-00805f9b34fb").unwrap()
        );
    }

    #[test]
    fn normalize_short_form() {
        assert_eq!(
            normalize_uuid("9800").unwrap(),
            Uuid::parse_str("00009800-0000-1000-8000-00805f9b34fb").unwrap()
        );
    }

    #[test]
    fn normalize_full_form_without_dashes() {
        assert_eq!(
            normalize_uuid("0000980000001000800000805f9b34fb").unwrap(),
            normalize_uuid("00009800-0000-1000-8000-00805f9b34fb").unwrap()
        );
    }

    #[test]
    fn normalize_is_case_insensitive() {
        assert_eq!(
            normalize_uuid("9A0B").unwrap(),
            normalize_uuid("9a0b").unwrap()
        );
        assert_eq!(
            normalize_uuid("00009800-0000-1000-8000-00805F9B34FB").unwrap(),
            normalize_uuid("00009800-0000-1000-8000-00805f9b34fb").unwrap()
        );
    }

    #[test]
    fn normalize_is_idempotent_over_its_own_rendering() {
        for raw in ["9800", "9901", "00009800-0000-1000-8000-00805f9b34fb"] {
            let once = normalize_uuid(raw).unwrap();
            let dashed = once.to_string();
            let plain = once.simple().to_string();
            assert_eq!(normalize_uuid(&dashed).unwrap(), once);
            assert_eq!(normalize_uuid(&plain).unwrap(), once);
        }
    }

    #[test]
    fn normalize_rejects_junk() {
        assert!(normalize_uuid("").is_err());
        assert!(normalize_uuid("98").is_err());
        assert!(normalize_uuid("980g").is_err());
        assert!(normalize_uuid("not-a-uuid").is_err());
        assert!(normalize_uuid("00009800-0000-1000-8000").is_err());
    }

    #[test]
    fn short_round_trip() {
        let uuid = uuid_from_u16(0x9800);
        assert_eq!(uuid.to_ble_u16(), Some(0x9800));
        assert_eq!(uuid.to_short_string(), "0x9800");
    }

    #[test]
    fn non_base_uuid_has_no_short_form() {
        let uuid = Uuid::parse_str("12345678-9000-1000-8000-00805f9b34fb").unwrap();
        assert_eq!(uuid.to_ble_u16(), None);
        assert_eq!(uuid.to_short_string(), uuid.to_string());
    }
}
