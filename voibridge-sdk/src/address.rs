//! Account addresses.
//!
//! An address is a 32-byte ed25519 public key. Its text form is the unpadded
//! base32 encoding of the key followed by the last four bytes of the key's
//! SHA-512/256 digest, 58 characters in total.

use std::fmt;
use std::str::FromStr;

use fast32::base32::RFC4648_NOPAD as BASE32;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length in bytes of the public key behind an address.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Length of the checksummed text form.
pub const ADDRESS_TEXT_LEN: usize = 58;

const CHECKSUM_LEN: usize = 4;

/// Errors produced when parsing an address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address must be {ADDRESS_TEXT_LEN} characters, got {0}")]
    InvalidLength(usize),
    #[error("address is not valid base32")]
    InvalidEncoding,
    #[error("address checksum mismatch")]
    ChecksumMismatch,
    #[error("public key must be {PUBLIC_KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
}

/// A 32-byte account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; PUBLIC_KEY_LEN]);

impl Address {
    /// The all-zero address. Valid syntactically, but no one holds its key.
    pub const ZERO: Address = Address([0u8; PUBLIC_KEY_LEN]);

    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Build an address from a raw public key slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AddressError> {
        <[u8; PUBLIC_KEY_LEN]>::try_from(bytes)
            .map(Self)
            .map_err(|_| AddressError::InvalidKeyLength(bytes.len()))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; PUBLIC_KEY_LEN]
    }

    fn checksum(&self) -> [u8; CHECKSUM_LEN] {
        let digest = ring::digest::digest(&ring::digest::SHA512_256, &self.0);
        let digest = digest.as_ref();
        let mut checksum = [0u8; CHECKSUM_LEN];
        checksum.copy_from_slice(&digest[digest.len() - CHECKSUM_LEN..]);
        checksum
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [0u8; PUBLIC_KEY_LEN + CHECKSUM_LEN];
        buf[..PUBLIC_KEY_LEN].copy_from_slice(&self.0);
        buf[PUBLIC_KEY_LEN..].copy_from_slice(&self.checksum());
        f.write_str(&BASE32.encode(&buf))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ADDRESS_TEXT_LEN {
            return Err(AddressError::InvalidLength(s.len()));
        }
        let decoded = BASE32
            .decode_str(s)
            .map_err(|_| AddressError::InvalidEncoding)?;
        if decoded.len() != PUBLIC_KEY_LEN + CHECKSUM_LEN {
            return Err(AddressError::InvalidEncoding);
        }
        let address = Self::from_slice(&decoded[..PUBLIC_KEY_LEN])?;
        if decoded[PUBLIC_KEY_LEN..] != address.checksum() {
            return Err(AddressError::ChecksumMismatch);
        }
        Ok(address)
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZERO_TEXT: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAY5HFKQ";

    #[test]
    fn test_zero_address_text_form() {
        assert_eq!(Address::ZERO.to_string(), ZERO_TEXT);
        let parsed: Address = ZERO_TEXT.parse().unwrap();
        assert!(parsed.is_zero());
    }

    #[test]
    fn test_roundtrip_and_checksum() {
        let address = Address::from_bytes([42u8; PUBLIC_KEY_LEN]);
        let text = address.to_string();
        assert_eq!(text.len(), ADDRESS_TEXT_LEN);
        assert_eq!(text.parse::<Address>().unwrap(), address);

        // Changing the first character alters the key but not the checksum.
        let first = if text.starts_with('A') { "B" } else { "A" };
        let tampered = format!("{first}{}", &text[1..]);
        assert_eq!(
            tampered.parse::<Address>(),
            Err(AddressError::ChecksumMismatch)
        );
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert_eq!(
            "ABC".parse::<Address>(),
            Err(AddressError::InvalidLength(3))
        );
        assert_eq!(
            Address::from_slice(&[1u8; 31]),
            Err(AddressError::InvalidKeyLength(31))
        );
    }

    #[test]
    fn test_serde_uses_text_form() {
        let json = serde_json::to_string(&Address::ZERO).unwrap();
        assert_eq!(json, format!("\"{ZERO_TEXT}\""));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Address::ZERO);
    }
}
