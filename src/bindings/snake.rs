//! Snake layouts for CCIP lists that do not fit into a single cell
//!
//! - Ref chains: items stored as refs, three per cell, the fourth ref links onwards
//! - Static data: fixed-shape items stored inline, cells linked through ref 0
//! - Bytes: payload spread over cells linked through ref 0, optionally length-prefixed per item

use crate::cell::{
    builder_error, empty_cell, parser_error, ArcCell, Cell, CellBuilder, CellCodec, TonCellError,
    MAX_BITS, MAX_REFS,
};

use std::sync::Arc;

/// Ref index used as the continuation pointer of a ref chain
const CHAIN_REF: usize = 3;

/// Contents of one cell of a chain before it is linked
#[derive(Default)]
struct Segment {
    bits: Vec<(usize, Vec<u8>)>,
    used_bits: usize,
    refs: Vec<ArcCell>,
}

impl Segment {
    fn bits_left(&self) -> usize {
        MAX_BITS - self.used_bits
    }

    fn push_bits(&mut self, bit_len: usize, data: Vec<u8>) {
        self.used_bits += bit_len;
        self.bits.push((bit_len, data));
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.push_bits(bytes.len() * 8, bytes.to_vec());
    }
}

/// Build the chain back to front; the link to the next cell follows a segment's own refs
fn link(segments: Vec<Segment>) -> Result<Cell, TonCellError> {
    let mut tail: Option<ArcCell> = None;
    for segment in segments.into_iter().rev() {
        let mut b = CellBuilder::new();
        for (bit_len, data) in &segment.bits {
            b.store_bits(*bit_len, data)?;
        }
        for r in segment.refs.iter().chain(tail.as_ref()) {
            b.store_reference(r)?;
        }
        tail = Some(Arc::new(b.build()?));
    }
    match tail {
        Some(head) => Ok(Arc::try_unwrap(head).unwrap_or_else(|shared| (*shared).clone())),
        None => empty_cell(),
    }
}

/// Pack cells as refs; a cell is closed once only one ref slot is left
pub fn pack_ref_chain(items: &[ArcCell]) -> Result<Cell, TonCellError> {
    let mut segments = vec![Segment::default()];
    for item in items {
        if segments.last().map_or(true, |s| s.refs.len() == CHAIN_REF) {
            segments.push(Segment::default());
        }
        if let Some(current) = segments.last_mut() {
            current.refs.push(item.clone());
        }
    }
    link(segments)
}

/// Inverse of [`pack_ref_chain`]
pub fn unpack_ref_chain(cell: &Cell) -> Result<Vec<ArcCell>, TonCellError> {
    let mut out = Vec::new();
    let mut current = cell.clone();
    loop {
        let refs = current.references().to_vec();
        if refs.len() == MAX_REFS {
            out.extend_from_slice(&refs[..CHAIN_REF]);
            current = (*refs[CHAIN_REF]).clone();
        } else {
            out.extend(refs);
            return Ok(out);
        }
    }
}

/// Encode each item with its codec and pack the results as a ref chain
pub fn pack_list<T: CellCodec>(items: &[T]) -> Result<Cell, TonCellError> {
    let cells = items
        .iter()
        .map(CellCodec::to_arc)
        .collect::<Result<Vec<_>, _>>()?;
    pack_ref_chain(&cells)
}

pub fn unpack_list<T: CellCodec>(cell: &Cell) -> Result<Vec<T>, TonCellError> {
    unpack_ref_chain(cell)?
        .iter()
        .map(|c| T::from_cell(c))
        .collect()
}

/// Pack ref-free items inline, starting a new cell when the next one does not fit
pub fn pack_static<T: CellCodec>(items: &[T]) -> Result<Cell, TonCellError> {
    let mut segments = vec![Segment::default()];
    for item in items {
        let encoded = item.to_cell()?;
        if !encoded.references().is_empty() {
            return Err(builder_error("static packing of items with refs"));
        }
        if segments.last().map_or(true, |s| s.bits_left() < encoded.bit_len()) {
            segments.push(Segment::default());
        }
        if let Some(current) = segments.last_mut() {
            current.push_bits(encoded.bit_len(), encoded.data().to_vec());
        }
    }
    link(segments)
}

pub fn unpack_static<T: CellCodec>(cell: &Cell) -> Result<Vec<T>, TonCellError> {
    let mut out = Vec::new();
    for current in follow_chain(cell) {
        let mut parser = current.parser();
        while parser.remaining_bits() > 0 {
            out.push(T::load(&mut parser)?);
        }
    }
    Ok(out)
}

/// Raw bytes filling each cell, continued through ref 0
pub fn pack_bytes(bytes: &[u8]) -> Result<Cell, TonCellError> {
    let mut segments = vec![Segment::default()];
    append_bytes(&mut segments, bytes);
    link(segments)
}

fn append_bytes(segments: &mut Vec<Segment>, bytes: &[u8]) {
    let mut rest = bytes;
    while !rest.is_empty() {
        let fit = segments.last().map_or(0, |s| s.bits_left() / 8);
        if fit == 0 {
            segments.push(Segment::default());
            continue;
        }
        let take = fit.min(rest.len());
        if let Some(current) = segments.last_mut() {
            current.push_bytes(&rest[..take]);
        }
        rest = &rest[take..];
    }
}

pub fn unpack_bytes(cell: &Cell) -> Result<Vec<u8>, TonCellError> {
    let mut out = Vec::new();
    for current in follow_chain(cell) {
        let mut parser = current.parser();
        let bytes = parser.remaining_bits() / 8;
        out.extend(parser.load_bytes(bytes)?);
    }
    Ok(out)
}

/// Byte strings, each with a 16-bit length prefix, streamed across cells linked through ref 0
pub fn pack_bytes_2d(items: &[Vec<u8>]) -> Result<Cell, TonCellError> {
    let mut segments = vec![Segment::default()];
    for item in items {
        let len = u16::try_from(item.len()).map_err(|_| {
            builder_error(format!("{}-byte item exceeds a 16-bit length", item.len()))
        })?;
        if segments.last().map_or(true, |s| s.bits_left() < 16) {
            segments.push(Segment::default());
        }
        if let Some(current) = segments.last_mut() {
            current.push_bytes(&len.to_be_bytes());
        }
        append_bytes(&mut segments, item);
    }
    link(segments)
}

pub fn unpack_bytes_2d(cell: &Cell) -> Result<Vec<Vec<u8>>, TonCellError> {
    // Every field is byte aligned, so each cell reduces to its data bytes
    let chain: Vec<Vec<u8>> = follow_chain(cell)
        .iter()
        .map(|c| c.data()[..c.bit_len() / 8].to_vec())
        .collect();
    let mut out = Vec::new();
    let (mut idx, mut pos) = (0usize, 0usize);
    while idx < chain.len() {
        if chain[idx].len() - pos < 2 {
            idx += 1;
            pos = 0;
            continue;
        }
        let len = u16::from_be_bytes([chain[idx][pos], chain[idx][pos + 1]]) as usize;
        pos += 2;

        let mut item = Vec::with_capacity(len);
        while item.len() < len {
            let current = chain
                .get(idx)
                .ok_or_else(|| parser_error(format!("{} bytes missing", len - item.len())))?;
            if pos == current.len() {
                idx += 1;
                pos = 0;
                continue;
            }
            let take = (current.len() - pos).min(len - item.len());
            item.extend_from_slice(&current[pos..pos + take]);
            pos += take;
        }
        out.push(item);
    }
    Ok(out)
}

/// Cells reachable by repeatedly following ref 0
fn follow_chain(cell: &Cell) -> Vec<Cell> {
    let mut chain = vec![cell.clone()];
    while let Some(next) = chain.last().and_then(|c| c.references().first().cloned()) {
        chain.push((*next).clone());
    }
    chain
}
