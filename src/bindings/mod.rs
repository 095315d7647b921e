//! Cell layouts of the contracts this service talks to
//!
//! Handles:
//! - Counter test contract storage, messages and event records
//! - CCIP commit/execute report records and onramp payloads
//! - Snake packing of CCIP lists
//! - CRC32 schema opcodes

pub mod ccip;
pub mod counter;
pub mod snake;

const CRC32_IEEE: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// CRC32-IEEE of a TL-B schema string with parentheses removed
pub fn schema_crc32(schema: &str) -> u32 {
    let cleaned: String = schema.chars().filter(|c| *c != '(' && *c != ')').collect();
    CRC32_IEEE.checksum(cleaned.as_bytes())
}

/// Big-endian 256-bit value from a `u128`
pub fn u256_from_u128(value: u128) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[16..].copy_from_slice(&value.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_topics() {
        assert_eq!(schema_crc32("CounterIncreased"), 0x0e5f2827);
        assert_eq!(schema_crc32("CounterReset"), 0x9bc5e2cd);
        assert_eq!(schema_crc32("CCIPMessageSent"), 0xa45d293c);
        assert_eq!(schema_crc32("(CounterReset)"), schema_crc32("CounterReset"));
    }

    #[test]
    fn test_u256_from_u128() {
        let v = u256_from_u128(0x0102);
        assert_eq!(v[30..], [0x01, 0x02]);
        assert!(v[..30].iter().all(|b| *b == 0));
    }
}
