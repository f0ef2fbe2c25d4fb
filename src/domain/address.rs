//! Bluetooth address and GATT identifier normalization
//!
//! Users type MAC addresses and UUIDs in whatever shape their OS tools
//! print them. Everything the session compares or uses as a map key goes
//! through the two canonical forms defined here.

use crate::domain::error::AddressError;
use std::fmt;
use std::str::FromStr;

/// Number of hex digits in a 48-bit Bluetooth address
const MAC_HEX_DIGITS: usize = 12;

/// A normalized 48-bit Bluetooth device address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MacAddress {
    value: u64,
    canonical: String,
}

impl MacAddress {
    /// Parse a MAC address such as `AA:BB:CC:DD:EE:FF`, `aabbccddeeff` or
    /// `AaBbCcDdEeFf`.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let canonical = normalize_mac(input);

        if canonical.len() != MAC_HEX_DIGITS || !canonical.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(AddressError::InvalidMac(input.to_string()));
        }

        let value = u64::from_str_radix(&canonical, 16)
            .map_err(|_| AddressError::InvalidMac(input.to_string()))?;

        Ok(Self { value, canonical })
    }

    /// The 48-bit integer form, as used by platform address selectors
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Canonical 12-digit uppercase hex, no separators
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Compare against an address reported by the platform for a resolved
    /// device.
    ///
    /// Suffix match: some stacks report the address with an extra type
    /// prefix in the upper bits.
    pub fn matches_reported(&self, reported: u64) -> bool {
        format!("{:012X}", reported).ends_with(&self.canonical)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for MacAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Strip separators and upper-case. Does not validate.
pub fn normalize_mac(input: &str) -> String {
    input
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Canonical textual form of a service or characteristic UUID:
/// brace-wrapped and lower-case, e.g. `{abcd-1234}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalUuid(String);

impl CanonicalUuid {
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        let inner = trimmed
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .unwrap_or(trimmed);

        if inner.is_empty() || !inner.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return Err(AddressError::InvalidUuid(input.to_string()));
        }

        Ok(Self(format!("{{{}}}", inner.to_ascii_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CanonicalUuid {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_forms_normalize_to_same_address() {
        for input in ["AA:BB:CC:DD:EE:FF", "aabbccddeeff", "AaBbCcDdEeFf"] {
            let mac = MacAddress::parse(input).unwrap();
            assert_eq!(mac.as_str(), "AABBCCDDEEFF");
            assert_eq!(mac.value(), 0xAABB_CCDD_EEFF);
        }
    }

    #[test]
    fn test_mac_normalization_is_idempotent() {
        let once = MacAddress::parse("a1:b2:c3:d4:e5:f6").unwrap();
        let twice = MacAddress::parse(once.as_str()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_mac_rejects_wrong_length() {
        assert!(matches!(
            MacAddress::parse("AA:BB"),
            Err(AddressError::InvalidMac(_))
        ));
        assert!(MacAddress::parse("AA:BB:CC:DD:EE:FF:00").is_err());
        assert!(MacAddress::parse("").is_err());
    }

    #[test]
    fn test_mac_rejects_non_hex() {
        assert!(MacAddress::parse("GG:BB:CC:DD:EE:FF").is_err());
        // twelve characters, but one of them is a sign
        assert!(MacAddress::parse("+ABBCCDDEEFF").is_err());
    }

    #[test]
    fn test_reported_address_suffix_match() {
        let mac = MacAddress::parse("0A:BB:CC:DD:EE:FF").unwrap();
        assert!(mac.matches_reported(0x0ABB_CCDD_EEFF));
        assert!(mac.matches_reported(0x01_0ABB_CCDD_EEFF));
        assert!(!mac.matches_reported(0x0ABB_CCDD_EEFE));
    }

    #[test]
    fn test_uuid_forms_normalize_to_same_key() {
        for input in ["ABCD-1234", "{abcd-1234}", "{ABCD-1234}"] {
            assert_eq!(CanonicalUuid::parse(input).unwrap().as_str(), "{abcd-1234}");
        }
    }

    #[test]
    fn test_uuid_normalization_is_idempotent() {
        let once = CanonicalUuid::parse("C8C51726-81BC-483B-A052-F7A14EA3D281").unwrap();
        let twice = CanonicalUuid::parse(once.as_str()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_uuid_rejects_garbage() {
        assert!(CanonicalUuid::parse("{}").is_err());
        assert!(CanonicalUuid::parse("").is_err());
        assert!(CanonicalUuid::parse("not a uuid").is_err());
    }
}
