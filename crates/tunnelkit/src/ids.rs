//! Random identifiers for instances and profiles.

use crate::error::{Result, TunnelkitError};

/// Number of random bytes in an identifier (hex-encoded to 32 chars).
const ID_BYTES: usize = 16;

/// Generate a new random identifier.
pub fn new_id() -> Result<String> {
    let mut bytes = [0u8; ID_BYTES];
    getrandom::fill(&mut bytes)
        .map_err(|e| TunnelkitError::Io(std::io::Error::other(format!("RNG failure: {}", e))))?;
    Ok(hex_encode(&bytes))
}

/// Hex-encode bytes without pulling in an extra crate.
fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
        s
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_format() {
        let id = new_id().unwrap();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_new_id_unique() {
        assert_ne!(new_id().unwrap(), new_id().unwrap());
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[0x00, 0xab, 0xff]), "00abff");
    }
}
