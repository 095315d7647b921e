//! Cell glue over `tonlib-core`
//!
//! Handles:
//! - Re-exports of the cell, parser and bag-of-cells types
//! - Hash, depth and BOC helpers on `Cell`
//! - `u128` coins and optional `addr_std` on builders and parsers
//! - The `CellCodec` trait implemented by every contract binding

mod address;

pub use address::Address;
pub use tonlib_core::cell::{ArcCell, BagOfCells, Cell, CellBuilder, CellParser, TonCellError};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use num_bigint::BigUint;
use std::collections::HashSet;
use std::sync::Arc;

/// Maximum number of data bits in a cell
pub const MAX_BITS: usize = 1023;
/// Maximum number of child references in a cell
pub const MAX_REFS: usize = 4;
/// Representation hash of the empty cell, hex
pub const EMPTY_CELL_HASH: &str = "96a296d224f285c67bee93c30f8a309157f0daa35dc5b87e410b78630a09cfc7";

pub(crate) fn parser_error(message: impl Into<String>) -> TonCellError {
    TonCellError::CellParserError(message.into())
}

pub(crate) fn builder_error(message: impl Into<String>) -> TonCellError {
    TonCellError::CellBuilderError(message.into())
}

/// Cell with no bits and no refs
pub fn empty_cell() -> Result<Cell, TonCellError> {
    CellBuilder::new().build()
}

pub fn empty_arc() -> Result<ArcCell, TonCellError> {
    empty_cell().map(Arc::new)
}

pub fn from_boc(bytes: &[u8]) -> Result<ArcCell, TonCellError> {
    BagOfCells::parse(bytes)?.single_root().cloned()
}

pub fn from_boc_hex(s: &str) -> Result<ArcCell, TonCellError> {
    let bytes = hex::decode(s.trim())
        .map_err(|e| TonCellError::BagOfCellsDeserializationError(e.to_string()))?;
    from_boc(&bytes)
}

pub fn from_boc_base64(s: &str) -> Result<ArcCell, TonCellError> {
    let bytes = STANDARD
        .decode(s.trim())
        .map_err(|e| TonCellError::BagOfCellsDeserializationError(e.to_string()))?;
    from_boc(&bytes)
}

/// Helpers every cell in this crate needs
pub trait CellExt {
    /// Representation hash
    fn repr_hash(&self) -> [u8; 32];

    fn hash_hex(&self) -> String {
        hex::encode(self.repr_hash())
    }

    /// Single-root BOC with CRC32C
    fn to_boc(&self) -> Result<Vec<u8>, TonCellError>;

    fn to_boc_base64(&self) -> Result<String, TonCellError> {
        Ok(STANDARD.encode(self.to_boc()?))
    }

    /// Distinct cells reachable from this one, itself included
    fn count_cells(&self) -> usize;

    /// Longest ref path below this cell
    fn tree_depth(&self) -> usize;
}

impl CellExt for Cell {
    fn repr_hash(&self) -> [u8; 32] {
        self.cell_hash()
    }

    fn to_boc(&self) -> Result<Vec<u8>, TonCellError> {
        BagOfCells::from_root(self.clone()).serialize(true)
    }

    fn count_cells(&self) -> usize {
        let mut seen = HashSet::new();
        let mut stack = vec![self];
        while let Some(cell) = stack.pop() {
            if seen.insert(cell.repr_hash()) {
                stack.extend(cell.references().iter().map(|r| r.as_ref()));
            }
        }
        seen.len()
    }

    fn tree_depth(&self) -> usize {
        self.references()
            .iter()
            .map(|r| r.tree_depth() + 1)
            .max()
            .unwrap_or(0)
    }
}

/// `u128` amounts and optional standard addresses
pub trait BuilderExt {
    /// `VarUInteger 16` amount
    fn store_coins_u128(&mut self, amount: u128) -> Result<&mut Self, TonCellError>;

    /// `addr_std`, or `addr_none$00` for `None`
    fn store_std_address(&mut self, address: Option<&Address>) -> Result<&mut Self, TonCellError>;

    fn store_u256(&mut self, value: &[u8; 32]) -> Result<&mut Self, TonCellError>;
}

impl BuilderExt for CellBuilder {
    fn store_coins_u128(&mut self, amount: u128) -> Result<&mut Self, TonCellError> {
        self.store_coins(&BigUint::from(amount))
    }

    fn store_std_address(&mut self, address: Option<&Address>) -> Result<&mut Self, TonCellError> {
        match address {
            Some(address) => self.store_address(&address.to_ton()),
            None => self.store_u8(2, 0),
        }
    }

    fn store_u256(&mut self, value: &[u8; 32]) -> Result<&mut Self, TonCellError> {
        self.store_slice(value)
    }
}

pub trait ParserExt {
    fn load_coins_u128(&mut self) -> Result<u128, TonCellError>;

    /// `None` for `addr_none`
    fn load_std_address(&mut self) -> Result<Option<Address>, TonCellError>;

    fn load_array<const N: usize>(&mut self) -> Result<[u8; N], TonCellError>;

    /// Consume `bits` bits and fail unless they equal `expected`
    fn expect_prefix(&mut self, expected: u64, bits: usize) -> Result<(), TonCellError>;
}

impl ParserExt for CellParser<'_> {
    fn load_coins_u128(&mut self) -> Result<u128, TonCellError> {
        let amount = self.load_coins()?;
        u128::try_from(&amount).map_err(|_| parser_error(format!("coins {} exceed u128", amount)))
    }

    fn load_std_address(&mut self) -> Result<Option<Address>, TonCellError> {
        Ok(Address::from_ton(&self.load_address()?))
    }

    fn load_array<const N: usize>(&mut self) -> Result<[u8; N], TonCellError> {
        let bytes = self.load_bytes(N)?;
        bytes
            .try_into()
            .map_err(|_| parser_error(format!("expected {} bytes", N)))
    }

    fn expect_prefix(&mut self, expected: u64, bits: usize) -> Result<(), TonCellError> {
        let got = self.load_u64(bits)?;
        if got != expected {
            return Err(parser_error(format!(
                "unexpected prefix: expected {:#x}, got {:#x}",
                expected, got
            )));
        }
        Ok(())
    }
}

/// A value with a fixed cell layout
pub trait CellCodec: Sized {
    fn store(&self, builder: &mut CellBuilder) -> Result<(), TonCellError>;

    fn load(parser: &mut CellParser<'_>) -> Result<Self, TonCellError>;

    fn to_cell(&self) -> Result<Cell, TonCellError> {
        let mut builder = CellBuilder::new();
        self.store(&mut builder)?;
        builder.build()
    }

    fn to_arc(&self) -> Result<ArcCell, TonCellError> {
        self.to_cell().map(Arc::new)
    }

    fn from_cell(cell: &Cell) -> Result<Self, TonCellError> {
        let mut parser = cell.parser();
        Self::load(&mut parser)
    }
}
