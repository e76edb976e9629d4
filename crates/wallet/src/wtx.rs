//! In-wallet transaction records and accounting entries.

use std::collections::BTreeMap;

use vaultd_consensus::{Amount, Hash256, ZERO_HASH};
use vaultd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use vaultd_primitives::transaction::Transaction;

/// Sentinel block hash marking an abandoned transaction. Kept for
/// wire compatibility with records written by earlier clients.
pub const ABANDON_HASH: Hash256 = {
    let mut hash = [0u8; 32];
    hash[0] = 1;
    hash
};

/// Where a wallet transaction currently stands relative to the chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxState {
    Unconfirmed,
    Abandoned,
    /// Mined in `block` at transaction position `index`.
    InBlock { block: Hash256, index: i32 },
    /// A competing spend was mined in `block`.
    Conflicted { block: Hash256 },
}

impl TxState {
    fn wire_parts(&self) -> (Hash256, i32) {
        match self {
            TxState::Unconfirmed => (ZERO_HASH, -1),
            TxState::Abandoned => (ABANDON_HASH, -1),
            TxState::InBlock { block, index } => (*block, *index),
            TxState::Conflicted { block } => (*block, -1),
        }
    }

    fn from_wire(block: Hash256, index: i32) -> Self {
        if block == ZERO_HASH {
            TxState::Unconfirmed
        } else if block == ABANDON_HASH {
            TxState::Abandoned
        } else if index < 0 {
            TxState::Conflicted { block }
        } else {
            TxState::InBlock { block, index }
        }
    }
}

/// Which key classes a balance question is asked about.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IsMineFilter(pub u8);

pub const ISMINE_NO: IsMineFilter = IsMineFilter(0);
pub const ISMINE_SPENDABLE: IsMineFilter = IsMineFilter(1);
pub const ISMINE_WATCH_ONLY: IsMineFilter = IsMineFilter(2);
pub const ISMINE_ALL: IsMineFilter = IsMineFilter(3);

impl IsMineFilter {
    pub fn matches(self, mine: IsMineFilter) -> bool {
        self.0 & mine.0 != 0
    }

    fn cache_slot(self) -> Option<usize> {
        match self.0 {
            1 | 2 | 3 => Some((self.0 - 1) as usize),
            _ => None,
        }
    }
}

/// Memoized balance amounts per filter. Derivable at any time; never
/// a source of truth.
#[derive(Clone, Debug, Default)]
pub struct CachedAmounts {
    debit: [Option<Amount>; 3],
    credit: [Option<Amount>; 3],
    available: [Option<Amount>; 3],
    immature: [Option<Amount>; 3],
    change: Option<Amount>,
}

impl CachedAmounts {
    pub fn clear(&mut self) {
        *self = CachedAmounts::default();
    }

    pub fn debit(&self, filter: IsMineFilter) -> Option<Amount> {
        filter.cache_slot().and_then(|slot| self.debit[slot])
    }

    pub fn set_debit(&mut self, filter: IsMineFilter, value: Amount) {
        if let Some(slot) = filter.cache_slot() {
            self.debit[slot] = Some(value);
        }
    }

    pub fn credit(&self, filter: IsMineFilter) -> Option<Amount> {
        filter.cache_slot().and_then(|slot| self.credit[slot])
    }

    pub fn set_credit(&mut self, filter: IsMineFilter, value: Amount) {
        if let Some(slot) = filter.cache_slot() {
            self.credit[slot] = Some(value);
        }
    }

    pub fn available(&self, filter: IsMineFilter) -> Option<Amount> {
        filter.cache_slot().and_then(|slot| self.available[slot])
    }

    pub fn set_available(&mut self, filter: IsMineFilter, value: Amount) {
        if let Some(slot) = filter.cache_slot() {
            self.available[slot] = Some(value);
        }
    }

    pub fn immature(&self, filter: IsMineFilter) -> Option<Amount> {
        filter.cache_slot().and_then(|slot| self.immature[slot])
    }

    pub fn set_immature(&mut self, filter: IsMineFilter, value: Amount) {
        if let Some(slot) = filter.cache_slot() {
            self.immature[slot] = Some(value);
        }
    }

    pub fn change(&self) -> Option<Amount> {
        self.change
    }

    pub fn set_change(&mut self, value: Amount) {
        self.change = Some(value);
    }
}

#[derive(Clone, Debug)]
pub struct WalletTx {
    pub tx: Transaction,
    pub state: TxState,
    pub time_received: u64,
    /// Stable ordering timestamp chosen at insertion; monotone with
    /// `order_pos` even when the local clock jitters.
    pub time_smart: u64,
    pub time_received_is_tx_time: bool,
    pub from_me: bool,
    pub from_account: String,
    pub map_value: BTreeMap<String, String>,
    pub order_form: Vec<(String, String)>,
    pub order_pos: i64,
    /// Mempool presence; runtime state, never persisted.
    pub in_mempool: bool,
    pub(crate) cached: CachedAmounts,
}

impl WalletTx {
    pub fn new(tx: Transaction) -> Self {
        Self {
            tx,
            state: TxState::Unconfirmed,
            time_received: 0,
            time_smart: 0,
            time_received_is_tx_time: false,
            from_me: false,
            from_account: String::new(),
            map_value: BTreeMap::new(),
            order_form: Vec::new(),
            order_pos: -1,
            in_mempool: false,
            cached: CachedAmounts::default(),
        }
    }

    pub fn txid(&self) -> Hash256 {
        self.tx.txid()
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(self.state, TxState::Abandoned)
    }

    pub fn is_coinbase(&self) -> bool {
        self.tx.is_coinbase()
    }

    /// Forgets every cached amount and the mempool flag.
    pub fn mark_dirty(&mut self) {
        self.cached.clear();
        self.in_mempool = false;
    }
}

impl Encodable for WalletTx {
    fn encode(&self, encoder: &mut Encoder) {
        self.tx.encode(encoder);
        let (block, index) = self.state.wire_parts();
        encoder.write_hash(&block);
        // Legacy merkle branch, always empty.
        encoder.write_compact_size(0);
        encoder.write_i32_le(index);
        // Legacy vtxPrev, always empty.
        encoder.write_compact_size(0);

        let mut values = self.map_value.clone();
        if !self.from_account.is_empty() {
            values.insert("fromaccount".to_string(), self.from_account.clone());
        }
        if self.order_pos >= 0 {
            values.insert("n".to_string(), self.order_pos.to_string());
        }
        if self.time_smart != 0 {
            values.insert("timesmart".to_string(), self.time_smart.to_string());
        }
        encoder.write_compact_size(values.len() as u64);
        for (key, value) in &values {
            encoder.write_var_str(key);
            encoder.write_var_str(value);
        }

        encoder.write_compact_size(self.order_form.len() as u64);
        for (key, value) in &self.order_form {
            encoder.write_var_str(key);
            encoder.write_var_str(value);
        }

        encoder.write_u32_le(u32::from(self.time_received_is_tx_time));
        encoder.write_u32_le(self.time_received as u32);
        encoder.write_u8(u8::from(self.from_me));
        // Legacy fSpent byte, written as zero and ignored on read.
        encoder.write_u8(0);
    }
}

impl Decodable for WalletTx {
    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let tx = Transaction::decode(decoder)?;
        let block = decoder.read_hash()?;
        let merkle_len = decoder.read_compact_size()?;
        for _ in 0..merkle_len {
            decoder.read_hash()?;
        }
        let index = decoder.read_i32_le()?;
        let prev_len = decoder.read_compact_size()?;
        for _ in 0..prev_len {
            Transaction::decode(decoder)?;
        }

        let value_count = decoder.read_compact_size()?;
        let mut map_value = BTreeMap::new();
        for _ in 0..value_count {
            let key = decoder.read_var_str()?;
            let value = decoder.read_var_str()?;
            map_value.insert(key, value);
        }

        let form_count = decoder.read_compact_size()?;
        let mut order_form = Vec::with_capacity(form_count.min(64) as usize);
        for _ in 0..form_count {
            let key = decoder.read_var_str()?;
            let value = decoder.read_var_str()?;
            order_form.push((key, value));
        }

        let time_received_is_tx_time = decoder.read_u32_le()? != 0;
        let time_received = u64::from(decoder.read_u32_le()?);
        let from_me = decoder.read_u8()? != 0;
        let _spent = decoder.read_u8()?;

        let from_account = map_value.remove("fromaccount").unwrap_or_default();
        let order_pos = map_value
            .remove("n")
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(-1);
        let time_smart = map_value
            .remove("timesmart")
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(0);

        Ok(Self {
            tx,
            state: TxState::from_wire(block, index),
            time_received,
            time_smart,
            time_received_is_tx_time,
            from_me,
            from_account,
            map_value,
            order_form,
            order_pos,
            in_mempool: false,
            cached: CachedAmounts::default(),
        })
    }
}

/// Internal transfer bookkeeping entry. The account name lives in the
/// database key, not the value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountingEntry {
    pub account: String,
    pub credit_debit: Amount,
    pub time: i64,
    pub other_account: String,
    pub comment: String,
    pub map_value: BTreeMap<String, String>,
    pub order_pos: i64,
}

const MAX_ACCOUNTING_COMMENT_BYTES: usize = 65_536;

impl Encodable for AccountingEntry {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.credit_debit);
        encoder.write_i64_le(self.time);
        encoder.write_var_str(&self.other_account);

        // The comment carries a NUL-separated forward-compatible
        // sub-stream with the value map and ordering position.
        let mut comment = self.comment.as_bytes().to_vec();
        comment.truncate(MAX_ACCOUNTING_COMMENT_BYTES);
        comment.push(0);
        let mut extra = Encoder::new();
        extra.write_compact_size(self.map_value.len() as u64);
        for (key, value) in &self.map_value {
            extra.write_var_str(key);
            extra.write_var_str(value);
        }
        extra.write_i64_le(self.order_pos);
        comment.extend_from_slice(&extra.into_inner());
        encoder.write_var_bytes(&comment);
    }
}

impl Decodable for AccountingEntry {
    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let credit_debit = decoder.read_i64_le()?;
        let time = decoder.read_i64_le()?;
        let other_account = decoder.read_var_str()?;
        let raw_comment = decoder.read_var_bytes()?;

        let mut map_value = BTreeMap::new();
        let mut order_pos = -1;
        let comment = match raw_comment.iter().position(|byte| *byte == 0) {
            Some(nul) => {
                let text = String::from_utf8(raw_comment[..nul].to_vec())
                    .map_err(|_| DecodeError::InvalidData("invalid comment encoding"))?;
                let mut extra = Decoder::new(&raw_comment[nul + 1..]);
                let count = extra.read_compact_size()?;
                for _ in 0..count {
                    let key = extra.read_var_str()?;
                    let value = extra.read_var_str()?;
                    map_value.insert(key, value);
                }
                order_pos = extra.read_i64_le()?;
                text
            }
            None => String::from_utf8(raw_comment)
                .map_err(|_| DecodeError::InvalidData("invalid comment encoding"))?,
        };

        Ok(Self {
            account: String::new(),
            credit_debit,
            time,
            other_account,
            comment,
            map_value,
            order_pos,
        })
    }
}
