//! Counter test contract

use super::schema_crc32;
use crate::cell::{parser_error, Cell, CellBuilder, CellCodec, CellParser, ParserExt, TonCellError};

pub const OP_SET_COUNT: u32 = 0x0000_0004;
pub const OP_INCREASE: u32 = 0x7e87_64ef;
pub const OP_RESET: u32 = 0x3dc2_af2d;

/// Persistent data: `id:uint32 value:uint32`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterStorage {
    pub id: u32,
    pub value: u32,
}

impl CellCodec for CounterStorage {
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        b.store_u32(32, self.id)?
            .store_u32(32, self.value)?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        Ok(Self {
            id: p.load_u32(32)?,
            value: p.load_u32(32)?,
        })
    }
}

/// `set_count#00000004 query_id:uint64 value:uint32`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetCount {
    pub query_id: u64,
    pub value: u32,
}

impl CellCodec for SetCount {
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        b.store_u32(32, OP_SET_COUNT)?
            .store_u64(64, self.query_id)?
            .store_u32(32, self.value)?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        p.expect_prefix(OP_SET_COUNT as u64, 32)?;
        Ok(Self {
            query_id: p.load_u64(64)?,
            value: p.load_u32(32)?,
        })
    }
}

/// `increase#7e8764ef query_id:uint64 increase_by:uint32`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Increase {
    pub query_id: u64,
    pub increase_by: u32,
}

impl CellCodec for Increase {
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        b.store_u32(32, OP_INCREASE)?
            .store_u64(64, self.query_id)?
            .store_u32(32, self.increase_by)?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        p.expect_prefix(OP_INCREASE as u64, 32)?;
        Ok(Self {
            query_id: p.load_u64(64)?,
            increase_by: p.load_u32(32)?,
        })
    }
}

/// `reset#3dc2af2d query_id:uint64`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reset {
    pub query_id: u64,
}

impl CellCodec for Reset {
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        b.store_u32(32, OP_RESET)?.store_u64(64, self.query_id)?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        p.expect_prefix(OP_RESET as u64, 32)?;
        Ok(Self {
            query_id: p.load_u64(64)?,
        })
    }
}

/// Any inbound counter message, dispatched on its opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterMessage {
    SetCount(SetCount),
    Increase(Increase),
    Reset(Reset),
}

impl CounterMessage {
    pub fn parse(cell: &Cell) -> Result<Self, TonCellError> {
        match cell.parser().load_u32(32)? {
            OP_SET_COUNT => SetCount::from_cell(cell).map(Self::SetCount),
            OP_INCREASE => Increase::from_cell(cell).map(Self::Increase),
            OP_RESET => Reset::from_cell(cell).map(Self::Reset),
            other => Err(parser_error(format!("unknown counter opcode {:#010x}", other))),
        }
    }

    /// Counter value after applying this message to `current`
    pub fn apply(&self, current: u32) -> u32 {
        match self {
            CounterMessage::SetCount(m) => m.value,
            CounterMessage::Increase(m) => current.wrapping_add(m.increase_by),
            CounterMessage::Reset(_) => 0,
        }
    }
}

/// Event record emitted on increase: `id:uint64 counter:uint64`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterIncreased {
    pub id: u64,
    pub counter: u64,
}

impl CounterIncreased {
    pub fn topic() -> u32 {
        schema_crc32("CounterIncreased")
    }
}

impl CellCodec for CounterIncreased {
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        b.store_u64(64, self.id)?.store_u64(64, self.counter)?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        Ok(Self {
            id: p.load_u64(64)?,
            counter: p.load_u64(64)?,
        })
    }
}

/// Event record emitted on reset: `id:uint64`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterReset {
    pub id: u64,
}

impl CounterReset {
    pub fn topic() -> u32 {
        schema_crc32("CounterReset")
    }
}

impl CellCodec for CounterReset {
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        b.store_u64(64, self.id)?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        Ok(Self {
            id: p.load_u64(64)?,
        })
    }
}

/// Tact-era counter with opcode-only increments
pub mod legacy {
    use crate::cell::{CellBuilder, CellCodec, CellParser, ParserExt, TonCellError};

    pub const OP_INCREMENT: u32 = 4;
    pub const OP_INCREMENT_MULT: u32 = 5;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Increment {
        pub query_id: u64,
    }

    impl CellCodec for Increment {
        fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
            b.store_u32(32, OP_INCREMENT)?
                .store_u64(64, self.query_id)?;
            Ok(())
        }

        fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
            p.expect_prefix(OP_INCREMENT as u64, 32)?;
            Ok(Self {
                query_id: p.load_u64(64)?,
            })
        }
    }

    /// Adds `a * b` to the counter
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IncrementMult {
        pub query_id: u64,
        pub a: u32,
        pub b: u32,
    }

    impl CellCodec for IncrementMult {
        fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
            b.store_u32(32, OP_INCREMENT_MULT)?
                .store_u64(64, self.query_id)?
                .store_u32(32, self.a)?
                .store_u32(32, self.b)?;
            Ok(())
        }

        fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
            p.expect_prefix(OP_INCREMENT_MULT as u64, 32)?;
            Ok(Self {
                query_id: p.load_u64(64)?,
                a: p.load_u32(32)?,
                b: p.load_u32(32)?,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_and_messages_decode_what_they_encode() {
        let storage = CounterStorage { id: 7, value: 1364 };
        assert_eq!(
            CounterStorage::from_cell(&storage.to_cell().unwrap()).unwrap(),
            storage
        );

        let set = SetCount {
            query_id: 99,
            value: 20,
        };
        let cell = set.to_cell().unwrap();
        assert_eq!(cell.bit_len(), 128);
        assert_eq!(&cell.data()[..4], &[0, 0, 0, 4]);
        assert_eq!(SetCount::from_cell(&cell).unwrap(), set);

        let mult = legacy::IncrementMult {
            query_id: 1,
            a: 3,
            b: 5,
        };
        assert_eq!(
            legacy::IncrementMult::from_cell(&mult.to_cell().unwrap()).unwrap(),
            mult
        );
    }

    #[test]
    fn test_wrong_opcode_is_rejected() {
        let cell = Reset { query_id: 1 }.to_cell().unwrap();
        assert!(SetCount::from_cell(&cell).is_err());
        let unknown = legacy::IncrementMult {
            query_id: 1,
            a: 2,
            b: 3,
        }
        .to_cell()
        .unwrap();
        assert!(CounterMessage::parse(&unknown).is_err());
        let parsed = CounterMessage::parse(&cell).unwrap();
        assert_eq!(parsed, CounterMessage::Reset(Reset { query_id: 1 }));
    }

    #[test]
    fn test_interleaved_sequence_reaches_expected_value() {
        let mut value = 0u32;
        for _ in 0..5 {
            value = CounterMessage::Increase(Increase {
                query_id: 0,
                increase_by: 1,
            })
            .apply(value);
            value = CounterMessage::SetCount(SetCount {
                query_id: 0,
                value: value * 4,
            })
            .apply(value);
        }
        assert_eq!(value, 1364);
    }

    #[test]
    fn test_event_records() {
        let ev = CounterIncreased { id: 1, counter: 2 };
        assert_eq!(CounterIncreased::from_cell(&ev.to_cell().unwrap()).unwrap(), ev);
        assert_eq!(CounterIncreased::topic(), 0x0e5f2827);
        assert_eq!(CounterReset::topic(), 0x9bc5e2cd);
    }
}
