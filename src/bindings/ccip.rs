//! CCIP report and onramp records
//!
//! 256-bit integers are carried as big-endian `[u8; 32]`.

use super::schema_crc32;
use super::snake::{
    pack_bytes, pack_list, pack_ref_chain, pack_static, unpack_bytes, unpack_list,
    unpack_ref_chain, unpack_static,
};
use crate::cell::{
    parser_error, Address, ArcCell, BuilderExt, CellBuilder, CellCodec, CellParser, ParserExt,
    TonCellError,
};

use std::sync::Arc;

/// `bytes4(keccak256("CCIP EVMExtraArgsV2"))`
pub const GENERIC_EXTRA_ARGS_V2_TAG: u32 = 0x181d_cf10;
/// `bytes4(keccak256("CCIP SVMExtraArgsV1"))`
pub const SVM_EXTRA_ARGS_V1_TAG: u32 = 0x1f3b_3aba;

fn required_address(p: &mut CellParser<'_>) -> Result<Address, TonCellError> {
    p.load_std_address()?
        .ok_or_else(|| parser_error("addr_none where an address is required"))
}

/// 512-bit signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl CellCodec for Signature {
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        b.store_slice(&self.0)?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        Ok(Self(p.load_array::<64>()?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RampMessageHeader {
    pub message_id: [u8; 32],
    pub source_chain_selector: u64,
    pub dest_chain_selector: u64,
    pub sequence_number: u64,
    pub nonce: u64,
}

impl CellCodec for RampMessageHeader {
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        b.store_slice(&self.message_id)?
            .store_u64(64, self.source_chain_selector)?
            .store_u64(64, self.dest_chain_selector)?
            .store_u64(64, self.sequence_number)?
            .store_u64(64, self.nonce)?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        Ok(Self {
            message_id: p.load_array::<32>()?,
            source_chain_selector: p.load_u64(64)?,
            dest_chain_selector: p.load_u64(64)?,
            sequence_number: p.load_u64(64)?,
            nonce: p.load_u64(64)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleRoot {
    pub source_chain_selector: u64,
    /// Onramp address, left padded to 64 bytes
    pub on_ramp_address: [u8; 64],
    pub min_seq_nr: u64,
    pub max_seq_nr: u64,
    pub merkle_root: [u8; 32],
}

impl CellCodec for MerkleRoot {
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        b.store_u64(64, self.source_chain_selector)?
            .store_slice(&self.on_ramp_address)?
            .store_u64(64, self.min_seq_nr)?
            .store_u64(64, self.max_seq_nr)?
            .store_slice(&self.merkle_root)?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        Ok(Self {
            source_chain_selector: p.load_u64(64)?,
            on_ramp_address: p.load_array::<64>()?,
            min_seq_nr: p.load_u64(64)?,
            max_seq_nr: p.load_u64(64)?,
            merkle_root: p.load_array::<32>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPriceUpdate {
    pub source_token: Address,
    pub usd_per_token: [u8; 32],
}

impl CellCodec for TokenPriceUpdate {
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        b.store_std_address(Some(&self.source_token))?;
        b.store_u256(&self.usd_per_token)?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        Ok(Self {
            source_token: required_address(p)?,
            usd_per_token: p.load_array::<32>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasPriceUpdate {
    pub dest_chain_selector: u64,
    pub usd_per_unit_gas: [u8; 32],
}

impl CellCodec for GasPriceUpdate {
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        b.store_u64(64, self.dest_chain_selector)?;
        b.store_u256(&self.usd_per_unit_gas)?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        Ok(Self {
            dest_chain_selector: p.load_u64(64)?,
            usd_per_unit_gas: p.load_array::<32>()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceUpdates {
    pub token_price_updates: Vec<TokenPriceUpdate>,
    pub gas_price_updates: Vec<GasPriceUpdate>,
}

impl CellCodec for PriceUpdates {
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        b.store_reference(&Arc::new(pack_static(&self.token_price_updates)?))?
            .store_reference(&Arc::new(pack_static(&self.gas_price_updates)?))?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        Ok(Self {
            token_price_updates: unpack_static(&*p.next_reference()?)?,
            gas_price_updates: unpack_static(&*p.next_reference()?)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MerkleRoots {
    pub blessed: Vec<MerkleRoot>,
    pub unblessed: Vec<MerkleRoot>,
}

impl CellCodec for MerkleRoots {
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        b.store_reference(&Arc::new(pack_static(&self.blessed)?))?
            .store_reference(&Arc::new(pack_static(&self.unblessed)?))?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        Ok(Self {
            blessed: unpack_static(&*p.next_reference()?)?,
            unblessed: unpack_static(&*p.next_reference()?)?,
        })
    }
}

/// Report submitted to the offramp `commit` entrypoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub price_updates: PriceUpdates,
    pub merkle_roots: MerkleRoots,
    pub rmn_signatures: Vec<Signature>,
}

impl CellCodec for CommitReport {
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        b.store_reference(&Arc::new(self.price_updates.to_cell()?))?
            .store_reference(&Arc::new(self.merkle_roots.to_cell()?))?
            .store_reference(&Arc::new(pack_static(&self.rmn_signatures)?))?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        Ok(Self {
            price_updates: PriceUpdates::from_cell(&*p.next_reference()?)?,
            merkle_roots: MerkleRoots::from_cell(&*p.next_reference()?)?,
            rmn_signatures: unpack_static(&*p.next_reference()?)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Any2TonTokenTransfer {
    pub source_pool_address: ArcCell,
    pub dest_pool_address: Address,
    pub dest_gas_amount: u32,
    pub extra_data: ArcCell,
    pub amount: [u8; 32],
}

impl CellCodec for Any2TonTokenTransfer {
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        b.store_reference(&self.source_pool_address)?
            .store_std_address(Some(&self.dest_pool_address))?
            .store_u32(32, self.dest_gas_amount)?
            .store_reference(&self.extra_data)?;
        b.store_u256(&self.amount)?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        Ok(Self {
            source_pool_address: p.next_reference()?,
            dest_pool_address: required_address(p)?,
            dest_gas_amount: p.load_u32(32)?,
            extra_data: p.next_reference()?,
            amount: p.load_array::<32>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Any2TonRampMessage {
    pub header: RampMessageHeader,
    pub sender: ArcCell,
    pub data: ArcCell,
    pub receiver: Address,
    pub gas_limit: u128,
    pub token_amounts: Vec<Any2TonTokenTransfer>,
}

impl CellCodec for Any2TonRampMessage {
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        self.header.store(b)?;
        b.store_reference(&self.sender)?
            .store_reference(&self.data)?
            .store_std_address(Some(&self.receiver))?
            .store_coins_u128(self.gas_limit)?
            .store_reference(&Arc::new(pack_list(&self.token_amounts)?))?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        let header = RampMessageHeader::load(p)?;
        let sender = p.next_reference()?;
        let data = p.next_reference()?;
        let receiver = required_address(p)?;
        let gas_limit = p.load_coins_u128()?;
        let token_amounts = unpack_list(&*p.next_reference()?)?;
        Ok(Self {
            header,
            sender,
            data,
            receiver,
            gas_limit,
            token_amounts,
        })
    }
}

/// Report submitted to the offramp `execute` entrypoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteReport {
    pub source_chain_selector: u64,
    pub messages: Vec<Any2TonRampMessage>,
    pub off_chain_token_data: ArcCell,
    pub proofs: Vec<Signature>,
    pub proof_flag_bits: [u8; 32],
}

impl CellCodec for ExecuteReport {
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        b.store_u64(64, self.source_chain_selector)?
            .store_reference(&Arc::new(pack_list(&self.messages)?))?
            .store_reference(&self.off_chain_token_data)?
            .store_reference(&Arc::new(pack_static(&self.proofs)?))?;
        b.store_u256(&self.proof_flag_bits)?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        Ok(Self {
            source_chain_selector: p.load_u64(64)?,
            messages: unpack_list(&*p.next_reference()?)?,
            off_chain_token_data: p.next_reference()?,
            proofs: unpack_static(&*p.next_reference()?)?,
            proof_flag_bits: p.load_array::<32>()?,
        })
    }
}

/// EVM-destination extra args, tagged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericExtraArgsV2 {
    pub gas_limit: [u8; 32],
    pub allow_out_of_order_execution: bool,
}

impl CellCodec for GenericExtraArgsV2 {
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        b.store_u32(32, GENERIC_EXTRA_ARGS_V2_TAG)?;
        b.store_u256(&self.gas_limit)?;
        b.store_bit(self.allow_out_of_order_execution)?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        p.expect_prefix(GENERIC_EXTRA_ARGS_V2_TAG as u64, 32)?;
        Ok(Self {
            gas_limit: p.load_array::<32>()?,
            allow_out_of_order_execution: p.load_bit()?,
        })
    }
}

/// SVM-destination extra args, tagged; accounts are a ref chain of byte strings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvmExtraArgsV1 {
    pub compute_units: u32,
    pub account_is_writable_bitmap: u64,
    pub allow_out_of_order_execution: bool,
    pub token_receiver: [u8; 32],
    pub accounts: Vec<Vec<u8>>,
}

impl CellCodec for SvmExtraArgsV1 {
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        let accounts = self
            .accounts
            .iter()
            .map(|a| pack_bytes(a).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        b.store_u32(32, SVM_EXTRA_ARGS_V1_TAG)?
            .store_u32(32, self.compute_units)?
            .store_u64(64, self.account_is_writable_bitmap)?
            .store_bit(self.allow_out_of_order_execution)?
            .store_slice(&self.token_receiver)?
            .store_reference(&Arc::new(pack_ref_chain(&accounts)?))?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        p.expect_prefix(SVM_EXTRA_ARGS_V1_TAG as u64, 32)?;
        let compute_units = p.load_u32(32)?;
        let account_is_writable_bitmap = p.load_u64(64)?;
        let allow_out_of_order_execution = p.load_bit()?;
        let token_receiver = p.load_array::<32>()?;
        let accounts = unpack_ref_chain(&*p.next_reference()?)?
            .iter()
            .map(|c| unpack_bytes(c))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            compute_units,
            account_is_writable_bitmap,
            allow_out_of_order_execution,
            token_receiver,
            accounts,
        })
    }
}

/// Onramp event record; the router message is kept as an opaque cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcipMessageSent {
    pub dest_chain_selector: u64,
    pub sequence_number: u64,
    pub message: ArcCell,
}

impl CcipMessageSent {
    pub fn topic() -> u32 {
        schema_crc32("CCIPMessageSent")
    }
}

impl CellCodec for CcipMessageSent {
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        b.store_u64(64, self.dest_chain_selector)?
            .store_u64(64, self.sequence_number)?
            .store_reference(&self.message)?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        Ok(Self {
            dest_chain_selector: p.load_u64(64)?,
            sequence_number: p.load_u64(64)?,
            message: p.next_reference()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::u256_from_u128;
    use crate::cell::{empty_arc, from_boc, CellExt};
    use sha3::{Digest, Keccak256};

    fn merkle_root(i: u64) -> MerkleRoot {
        MerkleRoot {
            source_chain_selector: 5009297550715157269,
            on_ramp_address: [i as u8; 64],
            min_seq_nr: i * 10,
            max_seq_nr: i * 10 + 9,
            merkle_root: [0xab; 32],
        }
    }

    fn blob(tag: u32) -> ArcCell {
        let mut b = CellBuilder::new();
        b.store_u32(32, tag).unwrap();
        Arc::new(b.build().unwrap())
    }

    #[test]
    fn test_extra_args_tags_match_keccak() {
        let evm = Keccak256::digest(b"CCIP EVMExtraArgsV2");
        assert_eq!(u32::from_be_bytes([evm[0], evm[1], evm[2], evm[3]]), GENERIC_EXTRA_ARGS_V2_TAG);
        let svm = Keccak256::digest(b"CCIP SVMExtraArgsV1");
        assert_eq!(u32::from_be_bytes([svm[0], svm[1], svm[2], svm[3]]), SVM_EXTRA_ARGS_V1_TAG);
    }

    #[test]
    fn test_commit_report_with_many_roots() {
        let report = CommitReport {
            price_updates: PriceUpdates {
                token_price_updates: vec![TokenPriceUpdate {
                    source_token: Address::new(0, [3; 32]),
                    usd_per_token: u256_from_u128(1_500_000_000_000_000_000),
                }],
                gas_price_updates: (0..6)
                    .map(|i| GasPriceUpdate {
                        dest_chain_selector: i,
                        usd_per_unit_gas: u256_from_u128(i as u128 * 1000),
                    })
                    .collect(),
            },
            merkle_roots: MerkleRoots {
                blessed: (0..3).map(merkle_root).collect(),
                unblessed: Vec::new(),
            },
            rmn_signatures: vec![Signature([1; 64]), Signature([2; 64])],
        };
        let cell = report.to_cell().unwrap();
        assert_eq!(cell.bit_len(), 0);
        assert_eq!(cell.references().len(), 3);

        let parsed = from_boc(&cell.to_boc().unwrap()).unwrap();
        assert_eq!(CommitReport::from_cell(&parsed).unwrap(), report);
    }

    #[test]
    fn test_execute_report_with_token_transfers() {
        let message = Any2TonRampMessage {
            header: RampMessageHeader {
                message_id: [9; 32],
                source_chain_selector: 1,
                dest_chain_selector: 2,
                sequence_number: 42,
                nonce: 0,
            },
            sender: blob(1),
            data: blob(2),
            receiver: Address::new(0, [4; 32]),
            gas_limit: 100_000,
            token_amounts: (0..5)
                .map(|i| Any2TonTokenTransfer {
                    source_pool_address: blob(10 + i),
                    dest_pool_address: Address::new(0, [i as u8 + 1; 32]),
                    dest_gas_amount: 1000,
                    extra_data: blob(20 + i),
                    amount: u256_from_u128(i as u128),
                })
                .collect(),
        };
        let report = ExecuteReport {
            source_chain_selector: 1,
            messages: vec![message.clone(), message],
            off_chain_token_data: empty_arc().unwrap(),
            proofs: vec![Signature([7; 64])],
            proof_flag_bits: u256_from_u128(0b101),
        };
        let cell = report.to_cell().unwrap();
        assert_eq!(ExecuteReport::from_cell(&cell).unwrap(), report);
    }

    #[test]
    fn test_extra_args_layouts() {
        let evm = GenericExtraArgsV2 {
            gas_limit: u256_from_u128(300_000),
            allow_out_of_order_execution: true,
        };
        let cell = evm.to_cell().unwrap();
        assert_eq!(cell.bit_len(), 32 + 256 + 1);
        assert_eq!(&cell.data()[..4], &GENERIC_EXTRA_ARGS_V2_TAG.to_be_bytes());
        assert_eq!(GenericExtraArgsV2::from_cell(&cell).unwrap(), evm);

        let svm = SvmExtraArgsV1 {
            compute_units: 200,
            account_is_writable_bitmap: 0b11,
            allow_out_of_order_execution: false,
            token_receiver: [5; 32],
            accounts: vec![vec![1; 32], vec![2; 32], vec![3; 32], vec![4; 32]],
        };
        let cell = svm.to_cell().unwrap();
        assert_eq!(SvmExtraArgsV1::from_cell(&cell).unwrap(), svm);
        assert!(GenericExtraArgsV2::from_cell(&cell).is_err());
    }

    #[test]
    fn test_message_sent_event() {
        let ev = CcipMessageSent {
            dest_chain_selector: 16015286601757825753,
            sequence_number: 1,
            message: blob(99),
        };
        assert_eq!(CcipMessageSent::from_cell(&ev.to_cell().unwrap()).unwrap(), ev);
        assert_eq!(CcipMessageSent::topic(), 0xa45d293c);
    }
}
