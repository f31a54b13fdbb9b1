//! Device identity and ASCII payload helpers

use serde::{Deserialize, Serialize};
use std::fmt;

/// TSC vendor id
pub const DEFAULT_VENDOR_ID: u16 = 0x1203;
/// TSC TTP-class printer product id
pub const DEFAULT_PRODUCT_ID: u16 = 0x0172;

/// Vendor/product pair used to locate the printer on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceIdentity {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self::new(DEFAULT_VENDOR_ID, DEFAULT_PRODUCT_ID)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Encode text as 7-bit ASCII
///
/// Characters outside the ASCII range are replaced with `?`.
pub fn encode_ascii(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect()
}

/// Decode bytes as 7-bit ASCII
///
/// Bytes with the high bit set become U+FFFD.
pub fn decode_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii() {
                b as char
            } else {
                char::REPLACEMENT_CHARACTER
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_identity_is_tsc_printer() {
        let identity = DeviceIdentity::default();
        assert_eq!(identity.vendor_id, 0x1203);
        assert_eq!(identity.product_id, 0x0172);
        assert_eq!(identity.to_string(), "1203:0172");
    }

    #[test]
    fn test_encode_ascii_replaces_non_ascii() {
        assert_eq!(encode_ascii("CLS\r\n"), b"CLS\r\n".to_vec());
        assert_eq!(encode_ascii("TEXT \"é\""), b"TEXT \"?\"".to_vec());
    }

    #[test]
    fn test_decode_ascii_replaces_high_bytes() {
        assert_eq!(decode_ascii(b"OK"), "OK");
        assert_eq!(decode_ascii(&[0x41, 0xC3, 0x42]), "A\u{FFFD}B");
    }
}
