//! Standard internal addresses as map keys
//!
//! Parsing and the user-friendly form are `TonAddress`'s; this type adds `Copy`,
//! ordering and the raw `wc:hex` display used in logs, metrics labels and config.

use super::{parser_error, TonCellError};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tonlib_core::TonAddress;

/// Workchain id plus 256-bit account id
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    pub workchain: i32,
    pub hash: [u8; 32],
}

impl Address {
    pub fn new(workchain: i32, hash: [u8; 32]) -> Self {
        Self { workchain, hash }
    }

    pub fn to_ton(&self) -> TonAddress {
        TonAddress {
            workchain: self.workchain,
            hash_part: self.hash,
        }
    }

    /// `None` for the null address `addr_none` decodes to
    pub fn from_ton(address: &TonAddress) -> Option<Self> {
        let null = address.workchain == 0 && address.hash_part.iter().all(|b| *b == 0);
        (!null).then(|| Self::new(address.workchain, address.hash_part))
    }

    /// Raw form, `0:abcd...`
    pub fn to_raw(&self) -> String {
        self.to_ton().to_hex()
    }

    /// User-friendly base64url form
    pub fn to_friendly(&self, bounceable: bool, testnet: bool) -> String {
        self.to_ton().to_base64_url_flags(!bounceable, testnet)
    }
}

impl FromStr for Address {
    type Err = TonCellError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = s
            .parse::<TonAddress>()
            .map_err(|e| parser_error(format!("invalid address {}: {}", s, e)))?;
        Ok(Self::new(parsed.workchain, parsed.hash_part))
    }
}

impl TryFrom<String> for Address {
    type Error = TonCellError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(a: Address) -> Self {
        a.to_raw()
    }
}

impl From<Address> for TonAddress {
    fn from(a: Address) -> Self {
        a.to_ton()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_raw())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{BuilderExt, CellBuilder, ParserExt};

    #[test]
    fn test_friendly_and_raw_forms_parse_back() {
        let addr = Address::new(0, [0x42; 32]);
        let friendly = addr.to_friendly(true, false);
        assert_eq!(friendly.len(), 48);
        assert_eq!(friendly.parse::<Address>().unwrap(), addr);
        assert_eq!(addr.to_raw().parse::<Address>().unwrap(), addr);
        assert_eq!(addr.to_raw(), format!("0:{}", "42".repeat(32)));

        let master = Address::new(-1, [0x01; 32]);
        assert_eq!(master.to_friendly(false, true).parse::<Address>().unwrap(), master);
    }

    #[test]
    fn test_rejects_bad_checksum() {
        let addr = Address::new(0, [7; 32]);
        let mut friendly = addr.to_friendly(true, false).into_bytes();
        friendly[10] = if friendly[10] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(friendly).unwrap();
        assert!(tampered.parse::<Address>().is_err());
        assert!("0:1234".parse::<Address>().is_err());
    }

    #[test]
    fn test_cell_layout_is_267_bits() {
        let addr = Address::new(0, [9; 32]);
        let mut b = CellBuilder::new();
        b.store_std_address(Some(&addr)).unwrap();
        let cell = b.build().unwrap();
        assert_eq!(cell.bit_len(), 267);
        assert_eq!(cell.parser().load_std_address().unwrap(), Some(addr));
    }

    #[test]
    fn test_serde_uses_raw_form() {
        let addr = Address::new(0, [0xab; 32]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"0:{}\"", "ab".repeat(32)));
        assert_eq!(serde_json::from_str::<Address>(&json).unwrap(), addr);
    }
}
