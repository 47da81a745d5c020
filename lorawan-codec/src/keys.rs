//! Identifiers and key material as owned fixed-width values.
//!
//! Everything on the external surface is hex, most significant byte first,
//! exactly as a network server console displays it. Wire order differs:
//! EUIs and the DevAddr travel little-endian, so the conversion happens at
//! frame assembly, not at parse time.

use core::str::FromStr;

/// Error returned when a hex credential string does not decode to the
/// expected width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseError;

/// A 128-bit AES key.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AesKey(pub [u8; 16]);

impl AesKey {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// An all-zero key marks an absent credential.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl From<[u8; 16]> for AesKey {
    fn from(bytes: [u8; 16]) -> Self {
        AesKey(bytes)
    }
}

impl FromStr for AesKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        let mut key = [0u8; 16];
        hex::decode_to_slice(s, &mut key).map_err(|_| ParseError)?;
        Ok(AesKey(key))
    }
}

/// The OTAA root key.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AppKey(pub AesKey);

impl AppKey {
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<[u8; 16]> for AppKey {
    fn from(bytes: [u8; 16]) -> Self {
        AppKey(AesKey(bytes))
    }
}

impl FromStr for AppKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        s.parse().map(AppKey)
    }
}

/// Network session key, derived at join or preloaded for ABP.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NwkSKey(pub AesKey);

impl NwkSKey {
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<[u8; 16]> for NwkSKey {
    fn from(bytes: [u8; 16]) -> Self {
        NwkSKey(AesKey(bytes))
    }
}

impl FromStr for NwkSKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        s.parse().map(NwkSKey)
    }
}

/// Application session key, derived at join or preloaded for ABP.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AppSKey(pub AesKey);

impl AppSKey {
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<[u8; 16]> for AppSKey {
    fn from(bytes: [u8; 16]) -> Self {
        AppSKey(AesKey(bytes))
    }
}

impl FromStr for AppSKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        s.parse().map(AppSKey)
    }
}

/// A 64-bit EUI, stored most significant byte first.
///
/// Used for both the DevEUI and the AppEUI/JoinEUI.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Eui(pub [u8; 8]);

impl Eui {
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// The little-endian form that goes into a join request.
    pub fn to_wire(&self) -> [u8; 8] {
        let mut wire = self.0;
        wire.reverse();
        wire
    }
}

impl From<[u8; 8]> for Eui {
    fn from(bytes: [u8; 8]) -> Self {
        Eui(bytes)
    }
}

impl FromStr for Eui {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        let mut eui = [0u8; 8];
        hex::decode_to_slice(s, &mut eui).map_err(|_| ParseError)?;
        Ok(Eui(eui))
    }
}

/// The 32-bit device address, stored in wire (LSB-first) order because every
/// cryptographic block consumes it that way.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DevAddr(pub [u8; 4]);

impl DevAddr {
    /// Builds from the four on-air bytes.
    pub fn from_wire(bytes: &[u8]) -> Self {
        let mut addr = [0u8; 4];
        addr.copy_from_slice(&bytes[..4]);
        DevAddr(addr)
    }

    /// Builds from the display (MSB-first) byte order.
    pub fn from_msb(bytes: [u8; 4]) -> Self {
        let mut addr = bytes;
        addr.reverse();
        DevAddr(addr)
    }

    /// The display (MSB-first) byte order.
    pub fn to_msb(&self) -> [u8; 4] {
        let mut addr = self.0;
        addr.reverse();
        addr
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// A zero address marks an unjoined device.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl From<[u8; 4]> for DevAddr {
    fn from(wire: [u8; 4]) -> Self {
        DevAddr(wire)
    }
}

impl FromStr for DevAddr {
    type Err = ParseError;

    /// Parses the display form, e.g. `"26011BDA"`.
    fn from_str(s: &str) -> Result<Self, ParseError> {
        let mut addr = [0u8; 4];
        hex::decode_to_slice(s, &mut addr).map_err(|_| ParseError)?;
        Ok(DevAddr::from_msb(addr))
    }
}

/// The 4-byte message integrity code.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Mic(pub [u8; 4]);

impl Mic {
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl From<[u8; 4]> for Mic {
    fn from(bytes: [u8; 4]) -> Self {
        Mic(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_parse_msb_first() {
        let key: AesKey = "8D7F3B4C5A6B7C8D9E0F1A2B3C4D5E6F".parse().unwrap();
        assert_eq!(key.0[0], 0x8d);
        assert_eq!(key.0[15], 0x6f);
        assert!("8D7F".parse::<AesKey>().is_err());
        assert!("zz7F3B4C5A6B7C8D9E0F1A2B3C4D5E6F".parse::<AesKey>().is_err());
    }

    #[test]
    fn eui_wire_order_is_reversed() {
        let eui: Eui = "70B3D57ED00201A6".parse().unwrap();
        assert_eq!(eui.0[0], 0x70);
        assert_eq!(eui.to_wire(), [0xa6, 0x01, 0x02, 0xd0, 0x7e, 0xd5, 0xb3, 0x70]);
    }

    #[test]
    fn dev_addr_round_trips_byte_order() {
        let addr: DevAddr = "26011BDA".parse().unwrap();
        assert_eq!(addr.0, [0xda, 0x1b, 0x01, 0x26]);
        assert_eq!(addr.to_msb(), [0x26, 0x01, 0x1b, 0xda]);
        assert_eq!(DevAddr::from_msb(addr.to_msb()), addr);
        assert!(!addr.is_zero());
        assert!(DevAddr::default().is_zero());
    }
}
