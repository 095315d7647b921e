//! Message cells and wallet signing payloads

use super::hashmap;
use super::WalletVersion;
use crate::cell::{
    builder_error, empty_arc, parser_error, Address, ArcCell, BuilderExt, Cell, CellBuilder,
    CellExt, CellParser, ParserExt, TonCellError,
};

use std::collections::BTreeMap;
use std::sync::Arc;

/// Sender pays forward fees on top of the value
pub const SEND_MODE_PAY_FEES_SEPARATELY: u8 = 1;
/// A failing action does not abort the rest of the action list
pub const SEND_MODE_IGNORE_ERRORS: u8 = 2;

const OP_HIGHLOAD_V3_INTERNAL_TRANSFER: u32 = 0xae42_e5a4;
const ACTION_SEND_MSG: u32 = 0x0ec3_c86d;

/// Value attached to the highload v3 self-transfer; it returns to the wallet
fn highload_carrier_value(actions: usize) -> u128 {
    50_000_000 + 10_000_000 * actions as u128
}

fn required_address(p: &mut CellParser<'_>) -> Result<Address, TonCellError> {
    p.load_std_address()?
        .ok_or_else(|| parser_error("destination is addr_none"))
}

/// Code and data of a contract to deploy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateInit {
    pub code: ArcCell,
    pub data: ArcCell,
}

impl StateInit {
    pub fn new(code: ArcCell, data: ArcCell) -> Self {
        Self { code, data }
    }

    /// `split_depth:0 special:0 code:1 data:1 library:0`
    pub fn to_cell(&self) -> Result<Cell, TonCellError> {
        let mut b = CellBuilder::new();
        b.store_bit(false)?
            .store_bit(false)?
            .store_maybe_cell_ref(&Some(self.code.clone()))?
            .store_maybe_cell_ref(&Some(self.data.clone()))?
            .store_bit(false)?;
        b.build()
    }

    pub fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        if p.load_bit()? || p.load_bit()? {
            return Err(parser_error("split_depth or special in state init"));
        }
        let code = p
            .load_maybe_cell_ref()?
            .ok_or_else(|| parser_error("state init without code"))?;
        let data = p
            .load_maybe_cell_ref()?
            .ok_or_else(|| parser_error("state init without data"))?;
        if p.load_bit()? {
            return Err(parser_error("libraries in state init"));
        }
        Ok(Self { code, data })
    }

    /// Address the contract will have once deployed
    pub fn address(&self, workchain: i32) -> Result<Address, TonCellError> {
        Ok(Address::new(workchain, self.to_cell()?.repr_hash()))
    }
}

fn store_init_and_body(
    b: &mut CellBuilder,
    init: Option<&StateInit>,
    body: Option<&ArcCell>,
) -> Result<(), TonCellError> {
    match init {
        Some(init) => {
            b.store_bit(true)?
                .store_bit(true)?
                .store_reference(&Arc::new(init.to_cell()?))?;
        }
        None => {
            b.store_bit(false)?;
        }
    }
    match body {
        Some(body) => {
            b.store_bit(true)?.store_reference(body)?;
        }
        None => {
            b.store_bit(false)?;
        }
    }
    Ok(())
}

fn load_init_and_body(
    p: &mut CellParser<'_>,
) -> Result<(Option<StateInit>, Option<ArcCell>), TonCellError> {
    let init = if p.load_bit()? {
        if p.load_bit()? {
            let cell = p.next_reference()?;
            Some(StateInit::load(&mut cell.parser())?)
        } else {
            Some(StateInit::load(p)?)
        }
    } else {
        None
    };
    let body = if p.load_bit()? {
        Some(p.next_reference()?)
    } else {
        let rest = p.load_remaining()?;
        if rest.bit_len() == 0 && rest.references().is_empty() {
            None
        } else {
            Some(Arc::new(rest))
        }
    };
    Ok((init, body))
}

/// `int_msg_info$0` message; `src` is `addr_none` when built by a wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalMessage {
    pub src: Option<Address>,
    pub dst: Address,
    pub value: u128,
    pub bounce: bool,
    pub bounced: bool,
    pub fwd_fee: u128,
    pub created_lt: u64,
    pub created_at: u32,
    pub state_init: Option<StateInit>,
    pub body: Option<ArcCell>,
}

impl InternalMessage {
    pub fn new(dst: Address, value: u128, bounce: bool) -> Self {
        Self {
            src: None,
            dst,
            value,
            bounce,
            bounced: false,
            fwd_fee: 0,
            created_lt: 0,
            created_at: 0,
            state_init: None,
            body: None,
        }
    }

    pub fn with_body(mut self, body: ArcCell) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_state_init(mut self, init: StateInit) -> Self {
        self.state_init = Some(init);
        self
    }

    pub fn to_cell(&self) -> Result<Cell, TonCellError> {
        let mut b = CellBuilder::new();
        b.store_bit(false)?
            .store_bit(true)?
            .store_bit(self.bounce)?
            .store_bit(self.bounced)?
            .store_std_address(self.src.as_ref())?
            .store_std_address(Some(&self.dst))?
            .store_coins_u128(self.value)?
            .store_bit(false)?
            .store_coins_u128(0)?
            .store_coins_u128(self.fwd_fee)?
            .store_u64(64, self.created_lt)?
            .store_u32(32, self.created_at)?;
        store_init_and_body(&mut b, self.state_init.as_ref(), self.body.as_ref())?;
        b.build()
    }

    pub fn from_cell(cell: &Cell) -> Result<Self, TonCellError> {
        let mut p = cell.parser();
        p.expect_prefix(0, 1)?;
        let _ihr_disabled = p.load_bit()?;
        let bounce = p.load_bit()?;
        let bounced = p.load_bit()?;
        let src = p.load_std_address()?;
        let dst = required_address(&mut p)?;
        let value = p.load_coins_u128()?;
        let _extra_currencies = p.load_maybe_cell_ref()?;
        let _ihr_fee = p.load_coins_u128()?;
        let fwd_fee = p.load_coins_u128()?;
        let created_lt = p.load_u64(64)?;
        let created_at = p.load_u32(32)?;
        let (state_init, body) = load_init_and_body(&mut p)?;
        Ok(Self {
            src,
            dst,
            value,
            bounce,
            bounced,
            fwd_fee,
            created_lt,
            created_at,
            state_init,
            body,
        })
    }
}

/// One send action of a wallet: mode plus the message cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutAction {
    pub mode: u8,
    pub message: ArcCell,
}

impl OutAction {
    pub fn new(mode: u8, message: &InternalMessage) -> Result<Self, TonCellError> {
        Ok(Self {
            mode,
            message: Arc::new(message.to_cell()?),
        })
    }

    /// `mode:uint8 ^Message`, the layout wallets read
    fn store(&self, b: &mut CellBuilder) -> Result<(), TonCellError> {
        b.store_u8(8, self.mode)?.store_reference(&self.message)?;
        Ok(())
    }

    fn load(p: &mut CellParser<'_>) -> Result<Self, TonCellError> {
        Ok(Self {
            mode: p.load_u8(8)?,
            message: p.next_reference()?,
        })
    }
}

/// `ext_in_msg_info$10` envelope carrying a signed wallet body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalMessage {
    pub dst: Address,
    pub state_init: Option<StateInit>,
    pub body: ArcCell,
}

impl ExternalMessage {
    pub fn to_cell(&self) -> Result<Cell, TonCellError> {
        let mut b = CellBuilder::new();
        b.store_u8(2, 0b10)?
            .store_std_address(None)?
            .store_std_address(Some(&self.dst))?
            .store_coins_u128(0)?;
        store_init_and_body(&mut b, self.state_init.as_ref(), Some(&self.body))?;
        b.build()
    }

    pub fn from_cell(cell: &Cell) -> Result<Self, TonCellError> {
        let mut p = cell.parser();
        p.expect_prefix(0b10, 2)?;
        if p.load_std_address()?.is_some() {
            return Err(parser_error("external message with a source address"));
        }
        let dst = required_address(&mut p)?;
        let _import_fee = p.load_coins_u128()?;
        let (state_init, body) = load_init_and_body(&mut p)?;
        let body = match body {
            Some(body) => body,
            None => empty_arc()?,
        };
        Ok(Self {
            dst,
            state_init,
            body,
        })
    }
}

/// Unsigned wallet body for one batch
#[derive(Debug, Clone)]
pub struct WalletBody {
    version: WalletVersion,
    /// Cell whose hash is signed
    pub payload: Cell,
    pub valid_until: u32,
    /// Query id for highload wallets
    pub query_id: Option<u64>,
}

impl WalletBody {
    /// Build the payload for `seq` at wall-clock `now`
    pub fn new(
        version: &WalletVersion,
        wallet: &Address,
        seq: u64,
        now: u64,
        actions: &[OutAction],
    ) -> Result<Self, TonCellError> {
        if actions.is_empty() || actions.len() > version.max_messages() {
            return Err(builder_error(format!(
                "{} actions for a {} wallet",
                actions.len(),
                version
            )));
        }
        let mut b = CellBuilder::new();
        let (valid_until, query_id) = match version {
            WalletVersion::V3R2 {
                subwallet_id,
                message_ttl_secs,
            }
            | WalletVersion::V4R2 {
                subwallet_id,
                message_ttl_secs,
            } => {
                let valid_until = (now + message_ttl_secs) as u32;
                let seqno = u32::try_from(seq)
                    .map_err(|_| builder_error(format!("seqno {} exceeds 32 bits", seq)))?;
                b.store_u32(32, *subwallet_id)?
                    .store_u32(32, valid_until)?
                    .store_u32(32, seqno)?;
                if matches!(version, WalletVersion::V4R2 { .. }) {
                    b.store_u8(8, 0)?;
                }
                for action in actions {
                    action.store(&mut b)?;
                }
                (valid_until, None)
            }
            WalletVersion::HighloadV2 {
                subwallet_id,
                message_ttl_secs,
            } => {
                let valid_until = (now + message_ttl_secs) as u32;
                let query_id = version.query_id(seq, valid_until);
                let mut entries = BTreeMap::new();
                for (i, action) in actions.iter().enumerate() {
                    let mut entry = CellBuilder::new();
                    action.store(&mut entry)?;
                    entries.insert(i as u16, entry.build()?);
                }
                b.store_u32(32, *subwallet_id)?
                    .store_u64(64, query_id)?
                    .store_maybe_cell_ref(&hashmap::build(&entries)?)?;
                (valid_until, Some(query_id))
            }
            WalletVersion::HighloadV3 {
                subwallet_id,
                timeout_secs,
                created_at_offset_secs,
            } => {
                let created_at = now.saturating_sub(*created_at_offset_secs);
                let valid_until = (created_at + *timeout_secs as u64) as u32;
                let query_id = version.query_id(seq, valid_until);
                let (mode, message) = if actions.len() == 1 {
                    (actions[0].mode, actions[0].message.clone())
                } else {
                    let transfer = highload_v3_transfer_body(query_id, actions)?;
                    let carrier =
                        InternalMessage::new(*wallet, highload_carrier_value(actions.len()), false)
                            .with_body(Arc::new(transfer));
                    (
                        SEND_MODE_PAY_FEES_SEPARATELY | SEND_MODE_IGNORE_ERRORS,
                        Arc::new(carrier.to_cell()?),
                    )
                };
                b.store_u32(32, *subwallet_id)?
                    .store_reference(&message)?
                    .store_u8(8, mode)?
                    .store_u64(13, query_id >> 10)?
                    .store_u64(10, query_id & 0x3ff)?
                    .store_u64(64, created_at)?
                    .store_u32(22, *timeout_secs)?;
                (valid_until, Some(query_id))
            }
        };
        Ok(Self {
            version: version.clone(),
            payload: b.build()?,
            valid_until,
            query_id,
        })
    }

    pub fn digest(&self) -> [u8; 32] {
        self.payload.repr_hash()
    }

    /// Attach a 64-byte signature to produce the external message body
    pub fn sign_with(&self, signature: &[u8]) -> Result<Cell, TonCellError> {
        if signature.len() != 64 {
            return Err(builder_error(format!("{}-byte signature", signature.len())));
        }
        let mut b = CellBuilder::new();
        b.store_slice(signature)?;
        match self.version {
            WalletVersion::HighloadV3 { .. } => {
                b.store_reference(&Arc::new(self.payload.clone()))?;
            }
            _ => {
                b.store_cell(&self.payload)?;
            }
        }
        b.build()
    }
}

/// `internal_transfer#ae42e5a4 query_id:uint64 actions:^OutList`
fn highload_v3_transfer_body(query_id: u64, actions: &[OutAction]) -> Result<Cell, TonCellError> {
    let mut list = empty_arc()?;
    for action in actions {
        let mut b = CellBuilder::new();
        b.store_reference(&list)?.store_u32(32, ACTION_SEND_MSG)?;
        action.store(&mut b)?;
        list = Arc::new(b.build()?);
    }
    let mut b = CellBuilder::new();
    b.store_u32(32, OP_HIGHLOAD_V3_INTERNAL_TRANSFER)?
        .store_u64(64, query_id)?
        .store_reference(&list)?;
    b.build()
}

fn unpack_out_list(list: &Cell) -> Result<Vec<OutAction>, TonCellError> {
    let mut actions = Vec::new();
    let mut current = list.clone();
    while current.bit_len() > 0 || !current.references().is_empty() {
        let mut p = current.parser();
        let prev = p.next_reference()?;
        p.expect_prefix(ACTION_SEND_MSG as u64, 32)?;
        actions.push(OutAction::load(&mut p)?);
        current = (*prev).clone();
    }
    actions.reverse();
    Ok(actions)
}

/// A signed wallet body as the wallet contract sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedWalletBody {
    pub signature: [u8; 64],
    pub signed_hash: [u8; 32],
    pub subwallet_id: u32,
    pub valid_until: u32,
    /// Standard wallets only
    pub seqno: Option<u32>,
    /// Highload wallets only
    pub query_id: Option<u64>,
    pub actions: Vec<OutAction>,
}

impl ParsedWalletBody {
    pub fn parse(
        version: &WalletVersion,
        wallet: &Address,
        body: &Cell,
    ) -> Result<Self, TonCellError> {
        let mut s = body.parser();
        let signature = s.load_array::<64>()?;
        match version {
            WalletVersion::V3R2 { .. } | WalletVersion::V4R2 { .. } => {
                let payload = s.load_remaining()?;
                let mut p = payload.parser();
                let subwallet_id = p.load_u32(32)?;
                let valid_until = p.load_u32(32)?;
                let seqno = p.load_u32(32)?;
                if matches!(version, WalletVersion::V4R2 { .. }) {
                    p.expect_prefix(0, 8)?;
                }
                // One action per reference
                let actions = (0..payload.references().len())
                    .map(|_| OutAction::load(&mut p))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self {
                    signature,
                    signed_hash: payload.repr_hash(),
                    subwallet_id,
                    valid_until,
                    seqno: Some(seqno),
                    query_id: None,
                    actions,
                })
            }
            WalletVersion::HighloadV2 { .. } => {
                let payload = s.load_remaining()?;
                let mut p = payload.parser();
                let subwallet_id = p.load_u32(32)?;
                let query_id = p.load_u64(64)?;
                let root = p.load_maybe_cell_ref()?;
                let actions = hashmap::parse(root.as_deref())?
                    .values()
                    .map(|entry| OutAction::load(&mut entry.parser()))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self {
                    signature,
                    signed_hash: payload.repr_hash(),
                    subwallet_id,
                    valid_until: (query_id >> 32) as u32,
                    seqno: None,
                    query_id: Some(query_id),
                    actions,
                })
            }
            WalletVersion::HighloadV3 { .. } => {
                let inner = s.next_reference()?;
                let mut p = inner.parser();
                let subwallet_id = p.load_u32(32)?;
                let message = p.next_reference()?;
                let mode = p.load_u8(8)?;
                let shift = p.load_u64(13)?;
                let bit_number = p.load_u64(10)?;
                let created_at = p.load_u64(64)?;
                let timeout = p.load_u64(22)?;

                let carried = InternalMessage::from_cell(&message)?;
                let is_transfer = carried.dst == *wallet
                    && carried.body.as_ref().map_or(false, |b| {
                        b.parser().load_u32(32).ok() == Some(OP_HIGHLOAD_V3_INTERNAL_TRANSFER)
                    });
                let actions = match (&carried.body, is_transfer) {
                    (Some(transfer), true) => {
                        let mut t = transfer.parser();
                        t.skip_bits(32 + 64)?;
                        unpack_out_list(&*t.next_reference()?)?
                    }
                    _ => vec![OutAction { mode, message }],
                };
                Ok(Self {
                    signature,
                    signed_hash: inner.repr_hash(),
                    subwallet_id,
                    valid_until: (created_at + timeout) as u32,
                    seqno: None,
                    query_id: Some((shift << 10) | bit_number),
                    actions,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{empty_cell, CellCodec};
    use crate::bindings::counter::CounterStorage;

    fn wallet() -> Address {
        Address::new(0, [0xaa; 32])
    }

    fn cell_of(value: u32) -> ArcCell {
        CounterStorage { id: value, value }.to_arc().unwrap()
    }

    fn actions(n: usize) -> Vec<OutAction> {
        (0..n)
            .map(|i| {
                let dst = Address::new(0, [i as u8 + 1; 32]);
                let msg = InternalMessage::new(dst, 1_000 + i as u128, true).with_body(cell_of(i as u32));
                OutAction::new(SEND_MODE_PAY_FEES_SEPARATELY, &msg).unwrap()
            })
            .collect()
    }

    fn check_version(version: WalletVersion, n: usize) {
        let acts = actions(n);
        let body = WalletBody::new(&version, &wallet(), 7, 1_700_000_000, &acts).unwrap();
        let signed = body.sign_with(&[3u8; 64]).unwrap();
        let parsed = ParsedWalletBody::parse(&version, &wallet(), &signed).unwrap();
        assert_eq!(parsed.signature, [3u8; 64]);
        assert_eq!(parsed.signed_hash, body.digest());
        assert_eq!(parsed.actions, acts, "{}", version);
        assert_eq!(parsed.valid_until, body.valid_until);
        assert_eq!(parsed.query_id, body.query_id);
        assert_eq!(parsed.subwallet_id, version.subwallet_id());
    }

    #[test]
    fn test_every_version_parses_what_it_builds() {
        check_version(WalletVersion::v3r2(), 4);
        check_version(
            WalletVersion::V4R2 {
                subwallet_id: 1,
                message_ttl_secs: 10,
            },
            1,
        );
        check_version(
            WalletVersion::HighloadV2 {
                subwallet_id: 2,
                message_ttl_secs: 60,
            },
            20,
        );
        check_version(WalletVersion::highload_v3(), 1);
        check_version(WalletVersion::highload_v3(), 254);
    }

    #[test]
    fn test_standard_wallet_layout() {
        let body = WalletBody::new(&WalletVersion::v3r2(), &wallet(), 5, 1000, &actions(2)).unwrap();
        let mut p = body.payload.parser();
        assert_eq!(p.load_u32(32).unwrap(), 698_983_191);
        assert_eq!(p.load_u32(32).unwrap(), 1060);
        assert_eq!(p.load_u32(32).unwrap(), 5);
        assert_eq!(body.payload.bit_len(), 96 + 16);
        assert_eq!(body.payload.references().len(), 2);
        assert!(WalletBody::new(&WalletVersion::v3r2(), &wallet(), 5, 1000, &actions(5)).is_err());
        assert!(WalletBody::new(&WalletVersion::v3r2(), &wallet(), 5, 1000, &[]).is_err());
        assert!(WalletBody::new(&WalletVersion::v3r2(), &wallet(), 1 << 32, 1000, &actions(1)).is_err());
    }

    #[test]
    fn test_highload_v3_created_at_offset() {
        let body =
            WalletBody::new(&WalletVersion::highload_v3(), &wallet(), 2047, 1000, &actions(1)).unwrap();
        assert_eq!(body.valid_until, 1000 - 30 + 120);
        assert_eq!(body.query_id, Some((2 << 10) | 1));
    }

    #[test]
    fn test_external_envelope() {
        let init = StateInit::new(cell_of(1), cell_of(2));
        let ext = ExternalMessage {
            dst: init.address(0).unwrap(),
            state_init: Some(init.clone()),
            body: Arc::new(empty_cell().unwrap()),
        };
        let cell = ext.to_cell().unwrap();
        let parsed = ExternalMessage::from_cell(&cell).unwrap();
        assert_eq!(parsed, ext);
        assert_eq!(parsed.dst, init.address(0).unwrap());

        let msg = InternalMessage::new(wallet(), 5, false).with_state_init(init);
        assert_eq!(InternalMessage::from_cell(&msg.to_cell().unwrap()).unwrap(), msg);
        let empty = InternalMessage::new(wallet(), 0, true);
        assert_eq!(InternalMessage::from_cell(&empty.to_cell().unwrap()).unwrap(), empty);
    }
}
