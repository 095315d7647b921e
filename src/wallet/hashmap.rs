//! `HashmapE 16` of highload v2 bodies
//!
//! Only the shape the wallet reads: 16-bit keys, values stored inline in the leaf.

use crate::cell::{parser_error, ArcCell, Cell, CellBuilder, CellParser, TonCellError};

use std::collections::BTreeMap;
use std::sync::Arc;

const KEY_BITS: usize = 16;

fn key_bits(key: u16) -> Vec<bool> {
    (0..KEY_BITS).rev().map(|i| (key >> i) & 1 == 1).collect()
}

/// Bits needed to encode a length in `0..=max`
fn len_bits(max: usize) -> usize {
    (usize::BITS - max.leading_zeros()) as usize
}

fn store_label(b: &mut CellBuilder, label: &[bool], max: usize) -> Result<(), TonCellError> {
    let n = label.len();
    let k = len_bits(max);
    let short = 2 * n + 2;
    let long = 2 + k + n;
    let same = if n > 0 && label.iter().all(|bit| *bit == label[0]) {
        Some(3 + k)
    } else {
        None
    };

    if short <= long && same.map_or(true, |s| short <= s) {
        // hml_short$0 len:(Unary ~n) s:(n * Bit)
        b.store_bit(false)?;
        for _ in 0..n {
            b.store_bit(true)?;
        }
        b.store_bit(false)?;
        for bit in label {
            b.store_bit(*bit)?;
        }
    } else if same.map_or(true, |s| long <= s) {
        // hml_long$10 n:(#<= m) s:(n * Bit)
        b.store_u8(2, 0b10)?.store_u32(k, n as u32)?;
        for bit in label {
            b.store_bit(*bit)?;
        }
    } else {
        // hml_same$11 v:Bit n:(#<= m)
        b.store_u8(2, 0b11)?
            .store_bit(label[0])?
            .store_u32(k, n as u32)?;
    }
    Ok(())
}

fn build_node(entries: &[(Vec<bool>, &Cell)], max: usize) -> Result<Cell, TonCellError> {
    let first = &entries[0].0;
    let prefix = if entries.len() == 1 {
        max
    } else {
        (0..max)
            .take_while(|i| entries.iter().all(|(k, _)| k[*i] == first[*i]))
            .count()
    };

    let mut b = CellBuilder::new();
    store_label(&mut b, &first[..prefix], max)?;
    if prefix == max {
        b.store_cell(entries[0].1)?;
        return b.build();
    }

    let mut left = Vec::new();
    let mut right = Vec::new();
    for (key, value) in entries {
        let entry = (key[prefix + 1..].to_vec(), *value);
        if key[prefix] {
            right.push(entry);
        } else {
            left.push(entry);
        }
    }
    let remaining = max - prefix - 1;
    b.store_reference(&Arc::new(build_node(&left, remaining)?))?
        .store_reference(&Arc::new(build_node(&right, remaining)?))?;
    b.build()
}

/// Root of the dictionary, `None` for an empty map
pub(crate) fn build(entries: &BTreeMap<u16, Cell>) -> Result<Option<ArcCell>, TonCellError> {
    if entries.is_empty() {
        return Ok(None);
    }
    let keyed: Vec<(Vec<bool>, &Cell)> = entries.iter().map(|(k, v)| (key_bits(*k), v)).collect();
    build_node(&keyed, KEY_BITS).map(|c| Some(Arc::new(c)))
}

fn load_label(p: &mut CellParser<'_>, max: usize) -> Result<Vec<bool>, TonCellError> {
    if !p.load_bit()? {
        let mut n = 0;
        while p.load_bit()? {
            n += 1;
        }
        (0..n).map(|_| p.load_bit()).collect()
    } else if !p.load_bit()? {
        let n = p.load_u32(len_bits(max))? as usize;
        (0..n).map(|_| p.load_bit()).collect()
    } else {
        let v = p.load_bit()?;
        let n = p.load_u32(len_bits(max))? as usize;
        Ok(vec![v; n])
    }
}

fn parse_node(
    cell: &Cell,
    mut prefix: Vec<bool>,
    max: usize,
    out: &mut BTreeMap<u16, Cell>,
) -> Result<(), TonCellError> {
    let mut p = cell.parser();
    let label = load_label(&mut p, max)?;
    if label.len() > max {
        return Err(parser_error("dictionary label too long"));
    }
    prefix.extend_from_slice(&label);
    if label.len() == max {
        let key = prefix.iter().fold(0u16, |acc, bit| (acc << 1) | *bit as u16);
        out.insert(key, p.load_remaining()?);
        return Ok(());
    }
    let remaining = max - label.len() - 1;
    let left = p.next_reference()?;
    let right = p.next_reference()?;
    let mut left_prefix = prefix.clone();
    left_prefix.push(false);
    parse_node(&left, left_prefix, remaining, out)?;
    prefix.push(true);
    parse_node(&right, prefix, remaining, out)
}

/// Entries under a root, empty for `None`
pub(crate) fn parse(root: Option<&Cell>) -> Result<BTreeMap<u16, Cell>, TonCellError> {
    let mut out = BTreeMap::new();
    if let Some(root) = root {
        parse_node(root, Vec::new(), KEY_BITS, &mut out)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellExt;

    fn value(v: u8) -> Cell {
        let mut b = CellBuilder::new();
        b.store_u8(8, v).unwrap();
        b.build().unwrap()
    }

    #[test]
    fn test_entries_survive_build_and_parse() {
        let entries: BTreeMap<u16, Cell> = [0u16, 1, 2, 7, 200, 65535]
            .into_iter()
            .map(|k| (k, value((k % 251) as u8)))
            .collect();
        let root = build(&entries).unwrap().unwrap();
        let parsed = parse(Some(&root)).unwrap();
        let hashes = |m: &BTreeMap<u16, Cell>| {
            m.iter().map(|(k, v)| (*k, v.repr_hash())).collect::<Vec<_>>()
        };
        assert_eq!(hashes(&parsed), hashes(&entries));
    }

    #[test]
    fn test_single_entry_and_empty() {
        assert!(build(&BTreeMap::new()).unwrap().is_none());
        assert!(parse(None).unwrap().is_empty());

        let entries: BTreeMap<u16, Cell> = [(3, value(9))].into_iter().collect();
        let root = build(&entries).unwrap().unwrap();
        assert!(root.references().is_empty());
        // hml_long label of all 16 key bits, then the value
        assert_eq!(root.bit_len(), 2 + 5 + 16 + 8);
        assert_eq!(parse(Some(&root)).unwrap().len(), 1);
    }
}
