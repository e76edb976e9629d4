//! Balance derivation: mine/watch-only classification, per-record
//! credit and debit, trust, and the wallet-level sums. Every amount
//! is memoized on its record and recomputed after `mark_dirty`.

use std::collections::BTreeSet;

use vaultd_consensus::{Amount, Hash256};
use vaultd_primitives::outpoint::OutPoint;
use vaultd_script::{
    classify_script_pubkey, p2sh_hash_from_script_pubkey, parse_multisig,
    pubkey_from_script_pubkey, pubkey_hash_from_script_pubkey, ScriptType,
};
use vaultd_storage::KeyValueStore;

use crate::chain::ChainView;
use crate::coinselect::OutputCandidate;
use crate::wallet::WalletCore;
use crate::wtx::{IsMineFilter, ISMINE_ALL, ISMINE_NO, ISMINE_SPENDABLE, ISMINE_WATCH_ONLY};

/// Serialized size of one signed P2PKH input.
pub(crate) const P2PKH_INPUT_BYTES: usize = 148;

impl<S: KeyValueStore> WalletCore<S> {
    /// Classifies a script against the key store.
    pub fn is_mine_output(&self, script_pubkey: &[u8]) -> IsMineFilter {
        if self.keystore.is_watched(script_pubkey) {
            return ISMINE_WATCH_ONLY;
        }
        let spendable = match classify_script_pubkey(script_pubkey) {
            ScriptType::P2Pkh => pubkey_hash_from_script_pubkey(script_pubkey)
                .map(|key_id| self.keystore.have_key(&key_id))
                .unwrap_or(false),
            ScriptType::P2Pk => pubkey_from_script_pubkey(script_pubkey)
                .map(|pubkey| self.keystore.have_key(&vaultd_primitives::hash::hash160(&pubkey.serialize())))
                .unwrap_or(false),
            ScriptType::P2Sh => p2sh_hash_from_script_pubkey(script_pubkey)
                .and_then(|script_id| self.keystore.redeem_script(&script_id))
                .map(|redeem| self.can_spend_redeem_script(redeem))
                .unwrap_or(false),
            ScriptType::Multisig => self
                .can_spend_redeem_script(script_pubkey),
            ScriptType::Unknown => false,
        };
        if spendable {
            ISMINE_SPENDABLE
        } else {
            ISMINE_NO
        }
    }

    fn can_spend_redeem_script(&self, redeem_script: &[u8]) -> bool {
        if let Some((required, keys)) = parse_multisig(redeem_script) {
            let held = keys
                .iter()
                .filter(|key| {
                    self.keystore
                        .have_key(&vaultd_primitives::hash::hash160(&key.serialize()))
                })
                .count();
            return held >= required;
        }
        match classify_script_pubkey(redeem_script) {
            ScriptType::P2Pkh => pubkey_hash_from_script_pubkey(redeem_script)
                .map(|key_id| self.keystore.have_key(&key_id))
                .unwrap_or(false),
            ScriptType::P2Pk => pubkey_from_script_pubkey(redeem_script)
                .map(|pubkey| {
                    self.keystore
                        .have_key(&vaultd_primitives::hash::hash160(&pubkey.serialize()))
                })
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Change heuristic: ours, paid to an internal-chain key, and not
    /// deliberately recorded in the address book.
    pub fn is_change_output(&self, script_pubkey: &[u8]) -> bool {
        if !self.is_mine_output(script_pubkey).matches(ISMINE_ALL) {
            return false;
        }
        if self.address_book.contains_key(script_pubkey) {
            return false;
        }
        pubkey_hash_from_script_pubkey(script_pubkey)
            .map(|key_id| self.internal_key_ids.contains(&key_id))
            .unwrap_or(false)
    }

    /// Value of a specific previous output if it is ours under `filter`.
    fn credit_of_prevout(&self, outpoint: &OutPoint, filter: IsMineFilter) -> Amount {
        let Some(parent) = self.txs.get(&outpoint.txid) else {
            return 0;
        };
        let Some(out) = parent.tx.outputs.get(outpoint.vout as usize) else {
            return 0;
        };
        if self.is_mine_output(&out.script_pubkey).matches(filter) {
            out.value
        } else {
            0
        }
    }

    /// Σ over inputs of our prior outputs consumed by this tx.
    pub fn tx_debit(&mut self, txid: &Hash256, filter: IsMineFilter) -> Amount {
        if let Some(cached) = self.txs.get(txid).and_then(|wtx| wtx.cached.debit(filter)) {
            return cached;
        }
        let prevouts: Vec<OutPoint> = match self.txs.get(txid) {
            Some(wtx) if !wtx.is_coinbase() => {
                wtx.tx.inputs.iter().map(|input| input.prevout).collect()
            }
            _ => Vec::new(),
        };
        let debit = prevouts
            .iter()
            .fold(0, |sum, prevout| sum + self.credit_of_prevout(prevout, filter));
        if let Some(wtx) = self.txs.get_mut(txid) {
            wtx.cached.set_debit(filter, debit);
        }
        debit
    }

    /// Σ over outputs that are ours under `filter`.
    pub fn tx_credit(&mut self, txid: &Hash256, filter: IsMineFilter) -> Amount {
        if let Some(cached) = self.txs.get(txid).and_then(|wtx| wtx.cached.credit(filter)) {
            return cached;
        }
        let outputs: Vec<(Amount, Vec<u8>)> = match self.txs.get(txid) {
            Some(wtx) => wtx
                .tx
                .outputs
                .iter()
                .map(|out| (out.value, out.script_pubkey.clone()))
                .collect(),
            None => return 0,
        };
        let credit = outputs.iter().fold(0, |sum, (value, script)| {
            if self.is_mine_output(script).matches(filter) {
                sum + value
            } else {
                sum
            }
        });
        if let Some(wtx) = self.txs.get_mut(txid) {
            wtx.cached.set_credit(filter, credit);
        }
        credit
    }

    /// Σ over outputs classified as change.
    pub fn tx_change(&mut self, txid: &Hash256) -> Amount {
        if let Some(cached) = self.txs.get(txid).and_then(|wtx| wtx.cached.change()) {
            return cached;
        }
        let outputs: Vec<(Amount, Vec<u8>)> = match self.txs.get(txid) {
            Some(wtx) => wtx
                .tx
                .outputs
                .iter()
                .map(|out| (out.value, out.script_pubkey.clone()))
                .collect(),
            None => return 0,
        };
        let change = outputs.iter().fold(0, |sum, (value, script)| {
            if self.is_change_output(script) {
                sum + value
            } else {
                sum
            }
        });
        if let Some(wtx) = self.txs.get_mut(txid) {
            wtx.cached.set_change(change);
        }
        change
    }

    fn is_immature_coinbase(&self, txid: &Hash256, chain: &dyn ChainView) -> bool {
        let Some(wtx) = self.txs.get(txid) else {
            return false;
        };
        if !wtx.is_coinbase() {
            return false;
        }
        let depth = self.tx_depth(txid, chain);
        depth >= 0 && depth < chain.coinbase_maturity()
    }

    /// Credit from our still-unspent, mature outputs of this tx.
    pub fn tx_available_credit(
        &mut self,
        txid: &Hash256,
        chain: &dyn ChainView,
        filter: IsMineFilter,
    ) -> Amount {
        if self.is_immature_coinbase(txid, chain) {
            return 0;
        }
        if let Some(cached) = self.txs.get(txid).and_then(|wtx| wtx.cached.available(filter)) {
            return cached;
        }
        let outputs: Vec<(u32, Amount, Vec<u8>)> = match self.txs.get(txid) {
            Some(wtx) => wtx
                .tx
                .outputs
                .iter()
                .enumerate()
                .map(|(vout, out)| (vout as u32, out.value, out.script_pubkey.clone()))
                .collect(),
            None => return 0,
        };
        let mut credit = 0;
        for (vout, value, script) in outputs {
            let outpoint = OutPoint::new(*txid, vout);
            if self.is_spent(&outpoint, chain) {
                continue;
            }
            if self.is_mine_output(&script).matches(filter) {
                credit += value;
            }
        }
        if let Some(wtx) = self.txs.get_mut(txid) {
            wtx.cached.set_available(filter, credit);
        }
        credit
    }

    /// Credit locked up in a coinbase that has not matured yet.
    pub fn tx_immature_credit(
        &mut self,
        txid: &Hash256,
        chain: &dyn ChainView,
        filter: IsMineFilter,
    ) -> Amount {
        if !self.is_immature_coinbase(txid, chain) {
            return 0;
        }
        if let Some(cached) = self.txs.get(txid).and_then(|wtx| wtx.cached.immature(filter)) {
            return cached;
        }
        let credit = self.tx_credit(txid, filter);
        if let Some(wtx) = self.txs.get_mut(txid) {
            wtx.cached.set_immature(filter, credit);
        }
        credit
    }

    /// Safe to count toward the spendable balance: confirmed, or a
    /// fully self-originated pending transaction whose inputs are all
    /// trusted in turn.
    pub fn is_trusted(&mut self, txid: &Hash256, chain: &dyn ChainView) -> bool {
        let mut visited = BTreeSet::new();
        self.is_trusted_inner(txid, chain, &mut visited)
    }

    fn is_trusted_inner(
        &mut self,
        txid: &Hash256,
        chain: &dyn ChainView,
        visited: &mut BTreeSet<Hash256>,
    ) -> bool {
        if !visited.insert(*txid) {
            return false;
        }
        let depth = self.tx_depth(txid, chain);
        if depth >= 1 {
            return true;
        }
        if depth < 0 {
            return false;
        }
        let (from_me, in_mempool, abandoned) = match self.txs.get(txid) {
            Some(wtx) => (wtx.from_me, wtx.in_mempool, wtx.is_abandoned()),
            None => return false,
        };
        if !from_me || abandoned || !in_mempool {
            return false;
        }
        let prevouts: Vec<OutPoint> = match self.txs.get(txid) {
            Some(wtx) => wtx.tx.inputs.iter().map(|input| input.prevout).collect(),
            None => return false,
        };
        for prevout in prevouts {
            let Some(parent) = self.txs.get(&prevout.txid) else {
                return false;
            };
            let Some(out) = parent.tx.outputs.get(prevout.vout as usize) else {
                return false;
            };
            let script = out.script_pubkey.clone();
            if !self.is_mine_output(&script).matches(ISMINE_SPENDABLE) {
                return false;
            }
            if !self.is_trusted_inner(&prevout.txid, chain, visited) {
                return false;
            }
        }
        true
    }

    /// Spendable balance: Σ available credit over trusted txs.
    pub fn balance(&mut self, chain: &dyn ChainView) -> Amount {
        self.balance_with_filter(chain, ISMINE_SPENDABLE)
    }

    pub fn balance_with_filter(&mut self, chain: &dyn ChainView, filter: IsMineFilter) -> Amount {
        let txids: Vec<Hash256> = self.txs.keys().copied().collect();
        let mut total = 0;
        for txid in txids {
            if self.is_trusted(&txid, chain) {
                total += self.tx_available_credit(&txid, chain, filter);
            }
        }
        total
    }

    /// Pending incoming value: untrusted zero-depth mempool txs.
    pub fn unconfirmed_balance(&mut self, chain: &dyn ChainView) -> Amount {
        let txids: Vec<Hash256> = self.txs.keys().copied().collect();
        let mut total = 0;
        for txid in txids {
            let in_mempool = self
                .txs
                .get(&txid)
                .map(|wtx| wtx.in_mempool)
                .unwrap_or(false);
            if !in_mempool || self.tx_depth(&txid, chain) != 0 {
                continue;
            }
            if !self.is_trusted(&txid, chain) {
                total += self.tx_available_credit(&txid, chain, ISMINE_SPENDABLE);
            }
        }
        total
    }

    pub fn immature_balance(&mut self, chain: &dyn ChainView) -> Amount {
        let txids: Vec<Hash256> = self.txs.keys().copied().collect();
        let mut total = 0;
        for txid in txids {
            total += self.tx_immature_credit(&txid, chain, ISMINE_SPENDABLE);
        }
        total
    }

    /// Unspent outputs usable by the selector, annotated with depth,
    /// safety, and spend cost.
    pub fn available_coins(&mut self, chain: &dyn ChainView) -> Vec<OutputCandidate> {
        let txids: Vec<Hash256> = self.txs.keys().copied().collect();
        let mut coins = Vec::new();
        for txid in txids {
            let depth = self.tx_depth(&txid, chain);
            if depth < 0 {
                continue;
            }
            let (abandoned, in_mempool, from_me) = match self.txs.get(&txid) {
                Some(wtx) => (wtx.is_abandoned(), wtx.in_mempool, wtx.from_me),
                None => continue,
            };
            if abandoned {
                continue;
            }
            // Unconfirmed and not in the mempool is in limbo; skip.
            if depth == 0 && !in_mempool {
                continue;
            }
            if self.is_immature_coinbase(&txid, chain) {
                continue;
            }
            let trusted = self.is_trusted(&txid, chain);
            let outputs: Vec<(u32, Amount, Vec<u8>)> = match self.txs.get(&txid) {
                Some(wtx) => wtx
                    .tx
                    .outputs
                    .iter()
                    .enumerate()
                    .map(|(vout, out)| (vout as u32, out.value, out.script_pubkey.clone()))
                    .collect(),
                None => continue,
            };
            for (vout, value, script) in outputs {
                if value <= 0 {
                    continue;
                }
                let outpoint = OutPoint::new(txid, vout);
                if self.is_spent(&outpoint, chain) {
                    continue;
                }
                if self.locked_outpoints.contains(&outpoint) {
                    continue;
                }
                let mine = self.is_mine_output(&script);
                if !mine.matches(ISMINE_ALL) {
                    continue;
                }
                let spendable = mine.matches(ISMINE_SPENDABLE);
                coins.push(OutputCandidate {
                    outpoint,
                    txout: vaultd_primitives::transaction::TxOut {
                        value,
                        script_pubkey: script,
                    },
                    depth,
                    spendable,
                    solvable: spendable,
                    safe: trusted || depth >= 1,
                    from_me,
                    ancestors: if depth == 0 { 1 } else { 0 },
                    input_bytes: P2PKH_INPUT_BYTES,
                });
            }
        }
        coins
    }
}
