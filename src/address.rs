//! EIP-55 address validation (C3).

use crate::crypto::keccak256;
use crate::error::AddressError;
use alloy_primitives::Address;

/// Parses and validates a 40-hex-digit address string, optionally
/// `0x`-prefixed. All-lowercase and all-uppercase input is accepted without
/// a checksum check (bare hex); anything mixed-case must match the EIP-55
/// checksum exactly.
pub fn validate_address(input: &str) -> Result<Address, AddressError> {
    let hex_part = input.strip_prefix("0x").unwrap_or(input);
    if hex_part.len() != 40 {
        return Err(AddressError::Length);
    }
    if !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AddressError::Hex);
    }

    let is_all_lower = hex_part.chars().all(|c| !c.is_ascii_uppercase());
    let is_all_upper = hex_part.chars().all(|c| !c.is_ascii_lowercase());

    if !is_all_lower && !is_all_upper && !matches_checksum(hex_part) {
        return Err(AddressError::Checksum);
    }

    let lower = hex_part.to_ascii_lowercase();
    let mut bytes = [0u8; 20];
    hex::decode_to_slice(&lower, &mut bytes).map_err(|_| AddressError::Hex)?;
    Ok(Address::from(bytes))
}

/// Checks nibble-by-nibble whether `hex_part` (already confirmed to be 40
/// hex digits) matches its own EIP-55 checksum casing.
fn matches_checksum(hex_part: &str) -> bool {
    to_checksum(&hex_part.to_ascii_lowercase()) == hex_part
}

/// Renders the EIP-55 mixed-case checksum string for a lowercase hex
/// address body (no `0x` prefix).
fn to_checksum(lower_hex: &str) -> String {
    let hash = keccak256(lower_hex.as_bytes());
    lower_hex
        .chars()
        .enumerate()
        .map(|(i, c)| {
            if c.is_ascii_alphabetic() {
                let nibble = if i % 2 == 0 { hash[i / 2] >> 4 } else { hash[i / 2] & 0x0f };
                if nibble >= 8 {
                    c.to_ascii_uppercase()
                } else {
                    c
                }
            } else {
                c
            }
        })
        .collect()
}

/// Renders an address as its EIP-55 checksummed hex string, `0x`-prefixed.
pub fn to_eip55_string(address: &Address) -> String {
    let lower = hex::encode(address.0);
    format!("0x{}", to_checksum(&lower))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_checksummed_address() {
        assert!(validate_address("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").is_ok());
    }

    #[test]
    fn rejects_bad_checksum() {
        let err = validate_address("0x5AAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").unwrap_err();
        assert_eq!(err, AddressError::Checksum);
    }

    #[test]
    fn accepts_all_lowercase() {
        assert!(validate_address("5aaeb6053f3e94c9b9a09f33669435e7ef1beaed").is_ok());
    }

    #[test]
    fn accepts_all_uppercase() {
        assert!(validate_address("0x5AAEB6053F3E94C9B9A09F33669435E7EF1BEAED").is_ok());
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(validate_address("0x1234").unwrap_err(), AddressError::Length);
    }

    #[test]
    fn rejects_non_hex() {
        let bad = "0xZZZZb6053F3E94C9b9A09f33669435E7Ef1BeAed";
        assert_eq!(validate_address(bad).unwrap_err(), AddressError::Hex);
    }

    #[test]
    fn round_trips_through_checksum_rendering() {
        let address = validate_address("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").unwrap();
        assert_eq!(to_eip55_string(&address), "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed");
    }
}
