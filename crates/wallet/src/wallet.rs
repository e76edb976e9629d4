//! The wallet core: key ownership, transaction table, spend index,
//! and the coarse lock wrapper the chain client talks to.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use secp256k1::{PublicKey, SecretKey};
use vaultd_consensus::{chain_params, Hash256, Network};
use vaultd_log::{log_info, log_warn};
use vaultd_primitives::address::{script_pubkey_to_address, wif_to_secret_key};
use vaultd_primitives::hash::hash160;
use vaultd_primitives::outpoint::OutPoint;
use vaultd_script::p2pkh_script;
use vaultd_storage::KeyValueStore;

use crate::chain::{BlockLocation, ChainView};
use crate::config::WalletConfig;
use crate::db::{DbBatch, LoadedWallet, WalletDb, MIN_SUPPORTED_VERSION, WALLET_VERSION};
use crate::error::WalletError;
use crate::hdchain::{derive_child_key, HdChain, KeyPool, KeyPoolEntry, HD_CHAIN_VERSION};
use crate::keystore::{pubkey_for_secret, KeyId, KeyMetadata, KeyStore};
use crate::wtx::{AccountingEntry, TxState, WalletTx};

/// Address book row for one destination script.
#[derive(Clone, Debug, Default)]
pub struct AddressBookEntry {
    pub label: String,
    pub purpose: String,
    pub dest_data: BTreeMap<String, Vec<u8>>,
}

/// A pool key handed out but not yet consumed. `keep` once the
/// enclosing transaction is persisted, `return_key` otherwise; a
/// handle that is neither kept nor returned leaves the key reserved
/// until the wallet reloads.
#[derive(Debug)]
pub struct ReservedKey {
    pub index: Option<i64>,
    pub internal: bool,
    pub pubkey: Vec<u8>,
}

impl ReservedKey {
    pub fn key_id(&self) -> KeyId {
        hash160(&self.pubkey)
    }

    pub fn script_pubkey(&self) -> Vec<u8> {
        p2pkh_script(&self.key_id())
    }
}

pub(crate) fn current_unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct WalletCore<S: KeyValueStore> {
    pub(crate) network: Network,
    pub(crate) config: WalletConfig,
    pub(crate) db: WalletDb<S>,
    pub(crate) keystore: KeyStore,
    pub(crate) hd_chain: HdChain,
    pub(crate) keypool: KeyPool,
    pub(crate) txs: BTreeMap<Hash256, WalletTx>,
    /// Outpoint → every wallet transaction spending it.
    pub(crate) spends: BTreeMap<OutPoint, BTreeSet<Hash256>>,
    /// Key ids derived on the internal chain; drives change detection.
    pub(crate) internal_key_ids: BTreeSet<KeyId>,
    pub(crate) address_book: BTreeMap<Vec<u8>, AddressBookEntry>,
    pub(crate) account_entries: Vec<AccountingEntry>,
    pub(crate) account_entry_next: u64,
    pub(crate) order_pos_next: i64,
    pub(crate) locked_outpoints: HashSet<OutPoint>,
    pub(crate) last_block: Option<BlockLocation>,
    /// Heights of blocks holding tracked transactions; runtime state
    /// used to order insertions for `time_smart`.
    pub(crate) block_heights: BTreeMap<Hash256, i32>,
    /// Chain position persisted by the previous session; the embedder
    /// uses it to pick a rescan start after load.
    pub(crate) best_block_locator: Vec<Hash256>,
    pub(crate) next_resend: u64,
    /// Earliest known key birth; 1 forces a full rescan.
    pub(crate) time_first_key: u64,
    pub(crate) needs_rewrite: bool,
}

impl<S: KeyValueStore> WalletCore<S> {
    /// Creates a fresh wallet with a new HD seed and a filled keypool.
    pub fn create(store: S, network: Network, config: WalletConfig) -> Result<Self, WalletError> {
        let now = current_unix_seconds();
        let mut core = Self {
            network,
            config,
            db: WalletDb::new(store),
            keystore: KeyStore::new(),
            hd_chain: HdChain::default(),
            keypool: KeyPool::new(),
            txs: BTreeMap::new(),
            spends: BTreeMap::new(),
            internal_key_ids: BTreeSet::new(),
            address_book: BTreeMap::new(),
            account_entries: Vec::new(),
            account_entry_next: 0,
            order_pos_next: 0,
            locked_outpoints: HashSet::new(),
            last_block: None,
            block_heights: BTreeMap::new(),
            best_block_locator: Vec::new(),
            next_resend: 0,
            time_first_key: now,
            needs_rewrite: false,
        };

        let seed = generate_secret_key()?;
        let seed_pubkey = pubkey_for_secret(&seed);
        let seed_id = core.keystore.add_key(seed, seed_pubkey)?;
        core.keystore.set_metadata(
            seed_id,
            KeyMetadata {
                create_time: now,
                hd_origin: None,
            },
        );
        core.hd_chain = HdChain {
            version: HD_CHAIN_VERSION,
            seed_id,
            external_counter: 0,
            internal_counter: 0,
        };

        let mut batch = DbBatch::new();
        batch.put_version(WALLET_VERSION);
        batch.put_min_version(MIN_SUPPORTED_VERSION);
        batch.put_hd_chain(&core.hd_chain);
        batch.put_default_key(&seed_pubkey.serialize());
        batch.put_key(
            &seed_pubkey.serialize(),
            &core
                .keystore
                .plain_secret(&seed_id)
                .ok_or(WalletError::InvalidData("seed secret missing"))?,
        );
        batch.put_key_meta(
            &seed_id,
            &KeyMetadata {
                create_time: now,
                hd_origin: None,
            },
        );
        batch.put_order_pos_next(0);
        core.db.commit(batch)?;

        core.top_up_keypool()?;
        log_info!("created new wallet, keypool size {}", core.config.keypool_size);
        Ok(core)
    }

    /// Rebuilds in-memory state from the record bag a load produced.
    pub fn load(store: S, network: Network, config: WalletConfig) -> Result<Self, WalletError> {
        let db = WalletDb::new(store);
        let loaded = db.load()?;
        let LoadedWallet {
            version: _,
            min_version: _,
            best_block,
            order_pos_next,
            default_key: _,
            keys,
            crypted_keys,
            master_keys,
            key_meta,
            watch_scripts,
            watch_meta,
            cscripts,
            pool,
            hd_chain,
            txs,
            names,
            purposes,
            dest_data,
            accounts: _,
            account_entries,
            skipped,
        } = loaded;

        let mut keystore = KeyStore::new();
        for (id, envelope) in master_keys {
            keystore.add_master_key(id, envelope);
        }
        for (pubkey, secret) in keys {
            let secret_key = SecretKey::from_slice(&secret)
                .map_err(|_| WalletError::InvalidData("invalid stored secret"))?;
            let pubkey_key = PublicKey::from_slice(&pubkey)
                .map_err(|_| WalletError::InvalidData("invalid stored pubkey"))?;
            keystore.add_key(secret_key, pubkey_key)?;
        }
        for (pubkey, ciphertext) in crypted_keys {
            keystore.add_crypted_key(pubkey, ciphertext)?;
        }
        let mut watch_known_time: BTreeMap<Vec<u8>, u64> = BTreeMap::new();
        for (script, meta) in watch_meta {
            watch_known_time.insert(script, meta.create_time);
        }
        let mut time_first_key = u64::MAX;
        for script in watch_scripts {
            // Watch-only material with unknown birth forces a scan
            // from the beginning of the chain.
            if !watch_known_time.contains_key(&script) {
                time_first_key = 1;
            } else {
                time_first_key = time_first_key.min(watch_known_time[&script]);
            }
            keystore.add_watch_script(script);
        }
        for script in cscripts {
            keystore.add_redeem_script(script);
        }
        let mut internal_key_ids = BTreeSet::new();
        for (key_id, meta) in key_meta {
            if meta.create_time != 0 {
                time_first_key = time_first_key.min(meta.create_time);
            } else {
                time_first_key = 1;
            }
            if matches!(meta.hd_origin, Some((true, _))) {
                internal_key_ids.insert(key_id);
            }
            keystore.set_metadata(key_id, meta);
        }
        if time_first_key == u64::MAX {
            time_first_key = current_unix_seconds();
        }

        let mut keypool = KeyPool::new();
        for (index, entry) in pool {
            let key_id = hash160(&entry.pubkey);
            keypool.load_entry(index, key_id, entry);
        }

        let mut core = Self {
            network,
            config,
            db,
            keystore,
            hd_chain: hd_chain.unwrap_or_default(),
            keypool,
            txs: BTreeMap::new(),
            spends: BTreeMap::new(),
            internal_key_ids,
            address_book: BTreeMap::new(),
            account_entries,
            account_entry_next: 0,
            order_pos_next,
            locked_outpoints: HashSet::new(),
            last_block: None,
            block_heights: BTreeMap::new(),
            best_block_locator: best_block,
            next_resend: 0,
            time_first_key,
            needs_rewrite: skipped > 0,
        };
        core.account_entry_next = core.account_entries.len() as u64;

        for (destination, label) in names {
            core.address_book.entry(destination).or_default().label = label;
        }
        for (destination, purpose) in purposes {
            core.address_book.entry(destination).or_default().purpose = purpose;
        }
        for ((destination, data_key), value) in dest_data {
            core.address_book
                .entry(destination)
                .or_default()
                .dest_data
                .insert(data_key, value);
        }

        for (txid, wtx) in txs {
            if wtx.txid() != txid {
                log_warn!("dropping wallet tx whose payload does not match its id");
                core.needs_rewrite = true;
                continue;
            }
            core.index_spends(&wtx);
            if wtx.order_pos >= core.order_pos_next {
                core.order_pos_next = wtx.order_pos + 1;
            }
            core.txs.insert(txid, wtx);
        }

        if core.needs_rewrite {
            log_warn!("wallet load skipped {skipped} records; database rewrite recommended");
        }
        Ok(core)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn tx_count(&self) -> usize {
        self.txs.len()
    }

    pub fn needs_rewrite(&self) -> bool {
        self.needs_rewrite
    }

    pub fn time_first_key(&self) -> u64 {
        self.time_first_key
    }

    /// Best-block locator recorded by the previous session.
    pub fn best_block_locator(&self) -> &[Hash256] {
        &self.best_block_locator
    }

    pub fn transaction(&self, txid: &Hash256) -> Option<&WalletTx> {
        self.txs.get(txid)
    }

    /// Ids of every tracked transaction, in id order.
    pub fn tx_ids(&self) -> Vec<Hash256> {
        self.txs.keys().copied().collect()
    }

    pub(crate) fn block_height(&self, hash: &Hash256) -> Option<i32> {
        self.block_heights.get(hash).copied()
    }

    pub(crate) fn record_block_height(&mut self, hash: Hash256, height: i32) {
        self.block_heights.insert(hash, height);
    }

    pub(crate) fn forget_block_height(&mut self, hash: &Hash256) {
        self.block_heights.remove(hash);
    }

    // ----- spend index -----

    pub(crate) fn index_spends(&mut self, wtx: &WalletTx) {
        if wtx.is_coinbase() {
            return;
        }
        let txid = wtx.txid();
        for input in &wtx.tx.inputs {
            self.spends.entry(input.prevout).or_default().insert(txid);
        }
    }

    pub fn spenders_of(&self, outpoint: &OutPoint) -> Option<&BTreeSet<Hash256>> {
        self.spends.get(outpoint)
    }

    /// After a second spender appears for an outpoint, merge metadata
    /// across the group so whichever copy confirms carries it all.
    pub(crate) fn sync_conflict_metadata(&mut self, outpoint: &OutPoint) {
        let Some(group) = self.spends.get(outpoint) else {
            return;
        };
        if group.len() < 2 {
            return;
        }
        let members: Vec<Hash256> = group.iter().copied().collect();

        let mut merged_values: BTreeMap<String, String> = BTreeMap::new();
        let mut min_order_pos = i64::MAX;
        let mut any_from_me = false;
        for txid in &members {
            if let Some(wtx) = self.txs.get(txid) {
                for (key, value) in &wtx.map_value {
                    merged_values.entry(key.clone()).or_insert_with(|| value.clone());
                }
                if wtx.order_pos >= 0 {
                    min_order_pos = min_order_pos.min(wtx.order_pos);
                }
                any_from_me |= wtx.from_me;
            }
        }
        if min_order_pos == i64::MAX {
            min_order_pos = -1;
        }

        let mut batch = DbBatch::new();
        for txid in &members {
            if let Some(wtx) = self.txs.get_mut(txid) {
                for (key, value) in &merged_values {
                    wtx.map_value.entry(key.clone()).or_insert_with(|| value.clone());
                }
                wtx.order_pos = min_order_pos;
                wtx.from_me = any_from_me;
                batch.put_tx(txid, wtx);
            }
        }
        if let Err(err) = self.db.commit(batch) {
            log_warn!("failed to persist conflict metadata sync: {err}");
        }
    }

    /// Is some spender of this outpoint still effective?
    pub(crate) fn is_spent(&self, outpoint: &OutPoint, chain: &dyn ChainView) -> bool {
        let Some(group) = self.spends.get(outpoint) else {
            return false;
        };
        group.iter().any(|txid| match self.txs.get(txid) {
            Some(wtx) => match wtx.state {
                TxState::InBlock { block, .. } => chain.depth_in_main_chain(&block) >= 1,
                TxState::Unconfirmed => true,
                TxState::Abandoned | TxState::Conflicted { .. } => false,
            },
            None => false,
        })
    }

    /// Transitive spenders of `txid`'s outputs, including `txid`.
    fn forward_closure(&self, txid: Hash256) -> Vec<Hash256> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([txid]);
        let mut out = Vec::new();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            out.push(current);
            let output_count = self
                .txs
                .get(&current)
                .map(|wtx| wtx.tx.outputs.len())
                .unwrap_or(0);
            for vout in 0..output_count as u32 {
                if let Some(spenders) = self.spends.get(&OutPoint::new(current, vout)) {
                    queue.extend(spenders.iter().copied());
                }
            }
        }
        out
    }

    /// Marks `txid` and every wallet descendant as conflicting with
    /// the chain at `block`. Every member of the forward closure is
    /// re-pointed, so a deeper conflicting block observed during a
    /// reorg replaces an earlier, shallower one.
    pub fn mark_conflicted(&mut self, block: Hash256, txid: Hash256) {
        let mut batch = DbBatch::new();
        let mut affected = 0usize;
        for member in self.forward_closure(txid) {
            let Some(wtx) = self.txs.get_mut(&member) else {
                continue;
            };
            let already = matches!(wtx.state, TxState::Conflicted { block: marked } if marked == block);
            if !already {
                wtx.state = TxState::Conflicted { block };
                wtx.mark_dirty();
                batch.put_tx(&member, wtx);
                affected += 1;
            }
        }
        if affected > 0 {
            log_info!("marked {affected} wallet transaction(s) conflicted");
            if let Err(err) = self.db.commit(batch) {
                log_warn!("failed to persist conflict marks: {err}");
            }
            self.dirty_parents_of(txid);
        }
    }

    /// Abandons a stuck transaction, freeing its inputs. Refused when
    /// the transaction or any descendant has confirmed, or while it
    /// still sits in the mempool.
    pub fn abandon_transaction(
        &mut self,
        chain: &dyn ChainView,
        txid: Hash256,
    ) -> Result<(), WalletError> {
        let wtx = self.txs.get(&txid).ok_or(WalletError::NotMine)?;
        if wtx.in_mempool {
            return Err(WalletError::NotAbandonable);
        }
        if self.tx_depth(&txid, chain) > 0 {
            return Err(WalletError::NotAbandonable);
        }
        let closure = self.forward_closure(txid);
        for member in &closure {
            if self.tx_depth(member, chain) > 0 {
                return Err(WalletError::NotAbandonable);
            }
        }

        let mut batch = DbBatch::new();
        for member in closure {
            let Some(wtx) = self.txs.get_mut(&member) else {
                continue;
            };
            if matches!(wtx.state, TxState::Unconfirmed | TxState::Conflicted { .. }) || member == txid
            {
                wtx.state = TxState::Abandoned;
                wtx.mark_dirty();
                batch.put_tx(&member, wtx);
            }
        }
        self.db.commit(batch)?;
        self.dirty_parents_of(txid);
        Ok(())
    }

    /// Records a replaced-by link in both directions.
    pub fn mark_replaced(&mut self, old_txid: Hash256, new_txid: Hash256) -> Result<(), WalletError> {
        if !self.txs.contains_key(&new_txid) {
            return Err(WalletError::NotMine);
        }
        let mut batch = DbBatch::new();
        {
            let old = self.txs.get_mut(&old_txid).ok_or(WalletError::NotMine)?;
            old.map_value
                .insert("replaced_by_txid".to_string(), hex_txid(&new_txid));
            old.mark_dirty();
            batch.put_tx(&old_txid, old);
        }
        {
            let new = self
                .txs
                .get_mut(&new_txid)
                .ok_or(WalletError::NotMine)?;
            new.map_value
                .insert("replaces_txid".to_string(), hex_txid(&old_txid));
            batch.put_tx(&new_txid, new);
        }
        self.db.commit(batch)?;
        Ok(())
    }

    /// Confirmation depth of a wallet transaction; negative depth of
    /// the conflicting block for conflicted ones.
    pub fn tx_depth(&self, txid: &Hash256, chain: &dyn ChainView) -> i32 {
        match self.txs.get(txid).map(|wtx| wtx.state) {
            Some(TxState::InBlock { block, .. }) => chain.depth_in_main_chain(&block).max(0),
            Some(TxState::Conflicted { block }) => -chain.depth_in_main_chain(&block),
            _ => 0,
        }
    }

    /// Invalidate balance caches on every wallet parent this tx spends.
    pub(crate) fn dirty_parents_of(&mut self, txid: Hash256) {
        let parents: Vec<Hash256> = match self.txs.get(&txid) {
            Some(wtx) => wtx.tx.inputs.iter().map(|input| input.prevout.txid).collect(),
            None => return,
        };
        for parent in parents {
            if let Some(parent_tx) = self.txs.get_mut(&parent) {
                parent_tx.mark_dirty();
            }
        }
        if let Some(wtx) = self.txs.get_mut(&txid) {
            wtx.mark_dirty();
        }
    }

    // ----- keypool -----

    /// Derives keys until both chains hold the configured count.
    pub fn top_up_keypool(&mut self) -> Result<(), WalletError> {
        let now = current_unix_seconds();
        self.keystore.maybe_relock(now);
        if !self.keystore.can_sign() {
            return Err(WalletError::Locked);
        }
        let target = self.config.keypool_size;
        let mut batch = DbBatch::new();
        let mut added = 0usize;

        let mut external_pending = target.saturating_sub(self.keypool.external_size());
        let mut internal_pending = target.saturating_sub(self.keypool.internal_size());
        while external_pending > 0 || internal_pending > 0 {
            let internal = internal_pending >= external_pending;
            self.derive_pool_key(internal, now, &mut batch)?;
            if internal {
                internal_pending -= 1;
            } else {
                external_pending -= 1;
            }
            added += 1;
        }

        if added > 0 {
            batch.put_hd_chain(&self.hd_chain);
            self.db.commit(batch)?;
            log_info!("keypool topped up with {added} keys");
        }
        Ok(())
    }

    fn derive_pool_key(
        &mut self,
        internal: bool,
        now: u64,
        batch: &mut DbBatch,
    ) -> Result<(), WalletError> {
        let seed = self.keystore.secret_key(&self.hd_chain.seed_id)?;
        let counter = if internal {
            &mut self.hd_chain.internal_counter
        } else {
            &mut self.hd_chain.external_counter
        };
        let index = *counter;
        *counter = counter
            .checked_add(1)
            .ok_or(WalletError::InvalidData("hd counter exhausted"))?;

        let (secret, pubkey) = derive_child_key(&seed.secret_bytes(), internal, index)?;
        let key_id = self.keystore.add_key(secret, pubkey)?;
        let meta = KeyMetadata {
            create_time: now,
            hd_origin: Some((internal, index)),
        };
        self.keystore.set_metadata(key_id, meta.clone());
        if internal {
            self.internal_key_ids.insert(key_id);
        }
        self.time_first_key = self.time_first_key.min(now);

        let pubkey_bytes = pubkey.serialize();
        match self.keystore.plain_secret(&key_id) {
            Some(plain) => batch.put_key(&pubkey_bytes, &plain),
            None => {
                let blob = self
                    .keystore
                    .crypted_blob(&key_id)
                    .ok_or(WalletError::InvalidData("missing key material"))?
                    .to_vec();
                batch.put_crypted_key(&pubkey_bytes, &blob);
            }
        }
        batch.put_key_meta(&key_id, &meta);

        let entry = KeyPoolEntry {
            time_created: now,
            pubkey: pubkey_bytes.to_vec(),
            internal,
        };
        let pool_index = self.keypool.push(key_id, entry.clone());
        batch.put_pool(pool_index, &entry);
        Ok(())
    }

    /// Hands out the next pool key of the requested chain. When the
    /// pool is dry, derives a fresh key directly (which needs the
    /// wallet unlocked).
    pub fn reserve_key(&mut self, internal: bool) -> Result<ReservedKey, WalletError> {
        if self.keystore.can_sign() {
            // Best effort; a dry pool is handled below.
            let _ = self.top_up_keypool();
        }
        if let Some((index, entry)) = self.keypool.reserve(internal) {
            return Ok(ReservedKey {
                index: Some(index),
                internal,
                pubkey: entry.pubkey,
            });
        }

        if !self.keystore.can_sign() {
            return Err(WalletError::Locked);
        }
        let now = current_unix_seconds();
        let mut batch = DbBatch::new();
        self.derive_pool_key(internal, now, &mut batch)?;
        batch.put_hd_chain(&self.hd_chain);
        self.db.commit(batch)?;
        let (index, entry) = self
            .keypool
            .reserve(internal)
            .ok_or(WalletError::InvalidData("keypool refill failed"))?;
        Ok(ReservedKey {
            index: Some(index),
            internal,
            pubkey: entry.pubkey,
        })
    }

    /// Permanently consumes a reserved key.
    pub fn keep_key(&mut self, reserved: &ReservedKey) -> Result<(), WalletError> {
        if let Some(index) = reserved.index {
            self.keypool.keep(index);
            let mut batch = DbBatch::new();
            batch.erase_pool(index);
            self.db.commit(batch)?;
        }
        Ok(())
    }

    /// Puts a reserved key back for the next caller.
    pub fn return_key(&mut self, reserved: ReservedKey) {
        if let Some(index) = reserved.index {
            self.keypool.unreserve(index, reserved.internal);
        }
    }

    /// Drops every pool entry at or below the entry holding `key_id`.
    /// Invoked when the chain shows that key receiving funds: the
    /// user has already handed out addresses that far into the pool.
    pub(crate) fn mark_pool_key_used(&mut self, key_id: &KeyId) {
        let Some(index) = self.keypool.index_of_key(key_id) else {
            return;
        };
        let removed = self.keypool.mark_used_up_to(index);
        if removed.is_empty() {
            return;
        }
        let mut batch = DbBatch::new();
        for entry_index in &removed {
            batch.erase_pool(*entry_index);
        }
        if let Err(err) = self.db.commit(batch) {
            log_warn!("failed to erase used keypool entries: {err}");
        } else {
            log_info!("keypool consumed up to index {index} ({} entries)", removed.len());
        }
        if self.keystore.can_sign() {
            let _ = self.top_up_keypool();
        }
    }

    pub fn keypool_sizes(&self) -> (usize, usize) {
        (self.keypool.external_size(), self.keypool.internal_size())
    }

    pub fn oldest_pool_key_time(&self) -> Option<u64> {
        self.keypool.oldest_key_time()
    }

    /// A fresh receive address, consumed from the external pool.
    pub fn new_address(&mut self, label: &str) -> Result<String, WalletError> {
        let reserved = self.reserve_key(false)?;
        self.keep_key(&reserved)?;
        let script = reserved.script_pubkey();
        let address = script_pubkey_to_address(&script, self.network)
            .ok_or(WalletError::InvalidData("unencodable address"))?;
        if !label.is_empty() {
            self.set_address_label(&script, label)?;
        }
        Ok(address)
    }

    // ----- key import / watch-only -----

    pub fn import_wif(&mut self, wif: &str) -> Result<String, WalletError> {
        let (secret_bytes, _compressed) = wif_to_secret_key(wif, self.network)
            .map_err(|_| WalletError::InvalidData("invalid WIF key"))?;
        let secret = SecretKey::from_slice(&secret_bytes)
            .map_err(|_| WalletError::InvalidData("invalid secret key"))?;
        let pubkey = pubkey_for_secret(&secret);
        let key_id = self.keystore.add_key(secret, pubkey)?;
        // Imported keys have no known birth; rescans must go deep.
        let meta = KeyMetadata {
            create_time: 0,
            hd_origin: None,
        };
        self.keystore.set_metadata(key_id, meta.clone());
        self.time_first_key = 1;

        let pubkey_bytes = pubkey.serialize();
        let mut batch = DbBatch::new();
        match self.keystore.plain_secret(&key_id) {
            Some(plain) => batch.put_key(&pubkey_bytes, &plain),
            None => {
                let blob = self
                    .keystore
                    .crypted_blob(&key_id)
                    .ok_or(WalletError::InvalidData("missing key material"))?
                    .to_vec();
                batch.put_crypted_key(&pubkey_bytes, &blob);
            }
        }
        batch.put_key_meta(&key_id, &meta);
        self.db.commit(batch)?;

        script_pubkey_to_address(&p2pkh_script(&key_id), self.network)
            .ok_or(WalletError::InvalidData("unencodable address"))
    }

    pub fn import_watch_script(&mut self, script: Vec<u8>) -> Result<(), WalletError> {
        let mut batch = DbBatch::new();
        batch.put_watch_script(&script);
        self.keystore.add_watch_script(script);
        self.time_first_key = 1;
        self.db.commit(batch)?;
        Ok(())
    }

    pub fn import_redeem_script(&mut self, script: Vec<u8>) -> Result<(), WalletError> {
        let script_id = self.keystore.add_redeem_script(script.clone());
        let mut batch = DbBatch::new();
        batch.put_cscript(&script_id, &script);
        self.db.commit(batch)?;
        Ok(())
    }

    // ----- encryption -----

    pub fn encrypt_wallet(&mut self, passphrase: &str) -> Result<(), WalletError> {
        let now = current_unix_seconds();
        let timeout = self.config.unlock_timeout_secs;
        let (envelope_id, envelope, rewritten) = self.keystore.encrypt(passphrase, now, timeout)?;

        let mut batch = DbBatch::new();
        batch.put_master_key(envelope_id, &envelope);
        for (_key_id, pubkey, ciphertext) in &rewritten {
            batch.erase_key(pubkey);
            batch.put_crypted_key(pubkey, ciphertext);
        }
        self.db.commit(batch)?;
        self.db.flush(false)?;
        log_info!("wallet encrypted ({} keys rewritten)", rewritten.len());
        Ok(())
    }

    pub fn unlock(&mut self, passphrase: &str) -> Result<(), WalletError> {
        let now = current_unix_seconds();
        self.keystore
            .unlock(passphrase, now, self.config.unlock_timeout_secs)
    }

    pub fn lock(&mut self) {
        self.keystore.lock();
    }

    pub fn change_passphrase(&mut self, old: &str, new: &str) -> Result<(), WalletError> {
        let now = current_unix_seconds();
        let (envelope_id, envelope) =
            self.keystore
                .change_passphrase(old, new, now, self.config.unlock_timeout_secs)?;
        let mut batch = DbBatch::new();
        batch.put_master_key(envelope_id, &envelope);
        self.db.commit(batch)?;
        self.db.flush(false)?;
        Ok(())
    }

    pub fn is_encrypted(&self) -> bool {
        self.keystore.is_encrypted()
    }

    // ----- address book -----

    pub fn set_address_label(&mut self, destination: &[u8], label: &str) -> Result<(), WalletError> {
        let mut batch = DbBatch::new();
        batch.put_name(destination, label);
        self.db.commit(batch)?;
        self.address_book
            .entry(destination.to_vec())
            .or_default()
            .label = label.to_string();
        Ok(())
    }

    pub fn set_address_purpose(
        &mut self,
        destination: &[u8],
        purpose: &str,
    ) -> Result<(), WalletError> {
        let mut batch = DbBatch::new();
        batch.put_purpose(destination, purpose);
        self.db.commit(batch)?;
        self.address_book
            .entry(destination.to_vec())
            .or_default()
            .purpose = purpose.to_string();
        Ok(())
    }

    pub fn set_dest_data(
        &mut self,
        destination: &[u8],
        data_key: &str,
        value: &[u8],
    ) -> Result<(), WalletError> {
        let mut batch = DbBatch::new();
        batch.put_dest_data(destination, data_key, value);
        self.db.commit(batch)?;
        self.address_book
            .entry(destination.to_vec())
            .or_default()
            .dest_data
            .insert(data_key.to_string(), value.to_vec());
        Ok(())
    }

    pub fn address_book_entry(&self, destination: &[u8]) -> Option<&AddressBookEntry> {
        self.address_book.get(destination)
    }

    // ----- accounting entries -----

    pub fn add_accounting_entry(&mut self, mut entry: AccountingEntry) -> Result<(), WalletError> {
        entry.order_pos = self.next_order_pos()?;
        let mut batch = DbBatch::new();
        batch.put_account_entry(self.account_entry_next, &entry);
        self.db.commit(batch)?;
        self.account_entry_next += 1;
        self.account_entries.push(entry);
        Ok(())
    }

    // ----- locked coins -----

    pub fn lock_coin(&mut self, outpoint: OutPoint) {
        self.locked_outpoints.insert(outpoint);
    }

    pub fn unlock_coin(&mut self, outpoint: &OutPoint) {
        self.locked_outpoints.remove(outpoint);
    }

    pub fn list_locked_coins(&self) -> Vec<OutPoint> {
        self.locked_outpoints.iter().copied().collect()
    }

    // ----- ordering -----

    pub(crate) fn next_order_pos(&mut self) -> Result<i64, WalletError> {
        let position = self.order_pos_next;
        self.order_pos_next += 1;
        let mut batch = DbBatch::new();
        batch.put_order_pos_next(self.order_pos_next);
        self.db.commit(batch)?;
        Ok(position)
    }

    pub fn flush(&self, shutdown: bool) -> Result<(), WalletError> {
        self.db.flush(shutdown)
    }

    /// Replays every live record back into the database in one batch.
    /// This is the recovery path after a load reported skipped
    /// records: whatever failed to decode is simply not rewritten.
    pub fn rewrite_database(&mut self) -> Result<(), WalletError> {
        let mut batch = DbBatch::new();
        batch.put_version(WALLET_VERSION);
        batch.put_min_version(MIN_SUPPORTED_VERSION);
        batch.put_order_pos_next(self.order_pos_next);
        batch.put_hd_chain(&self.hd_chain);
        if let Some(last) = self.last_block {
            batch.put_best_block(&[last.hash]);
        }

        for (id, envelope) in self.keystore.master_keys() {
            batch.put_master_key(*id, envelope);
        }
        let key_ids: Vec<KeyId> = self.keystore.key_ids().copied().collect();
        for key_id in key_ids {
            let Some(pubkey) = self.keystore.pubkey_bytes(&key_id).map(|p| p.to_vec()) else {
                continue;
            };
            match self.keystore.plain_secret(&key_id) {
                Some(plain) => batch.put_key(&pubkey, &plain),
                None => {
                    if let Some(blob) = self.keystore.crypted_blob(&key_id) {
                        batch.put_crypted_key(&pubkey, &blob.to_vec());
                    }
                }
            }
            if let Some(meta) = self.keystore.metadata(&key_id) {
                batch.put_key_meta(&key_id, meta);
            }
        }
        for script in self.keystore.watch_scripts() {
            batch.put_watch_script(script);
        }
        for (script_id, script) in self.keystore.redeem_scripts() {
            batch.put_cscript(script_id, script);
        }
        for (index, entry) in self.keypool.entries() {
            batch.put_pool(*index, entry);
        }
        for (txid, wtx) in &self.txs {
            batch.put_tx(txid, wtx);
        }
        for (destination, entry) in &self.address_book {
            if !entry.label.is_empty() {
                batch.put_name(destination, &entry.label);
            }
            if !entry.purpose.is_empty() {
                batch.put_purpose(destination, &entry.purpose);
            }
            for (data_key, value) in &entry.dest_data {
                batch.put_dest_data(destination, data_key, value);
            }
        }
        for (counter, entry) in self.account_entries.iter().enumerate() {
            batch.put_account_entry(counter as u64, entry);
        }

        self.db.commit(batch)?;
        self.db.flush(false)?;
        self.needs_rewrite = false;
        log_info!("wallet database rewritten from live state");
        Ok(())
    }
}

fn generate_secret_key() -> Result<SecretKey, WalletError> {
    let mut rng = rand::rngs::OsRng;
    let mut bytes = [0u8; 32];
    for _ in 0..100 {
        rng.fill_bytes(&mut bytes);
        if let Ok(secret) = SecretKey::from_slice(&bytes) {
            return Ok(secret);
        }
    }
    Err(WalletError::InvalidData("failed to generate secret key"))
}

fn hex_txid(txid: &Hash256) -> String {
    vaultd_consensus::hash256_to_hex(txid)
}

/// The coarse wallet lock plus the fine rescan state around it.
/// Chain callbacks, user operations, and the balance views all pass
/// through `core`'s mutex, matching the single-critical-section model.
pub struct Wallet<S: KeyValueStore> {
    core: Mutex<WalletCore<S>>,
    synced_cv: Condvar,
    pub(crate) scanning: AtomicBool,
    pub(crate) abort_rescan: AtomicBool,
    pub(crate) scanning_lock: Mutex<()>,
}

impl<S: KeyValueStore> Wallet<S> {
    pub fn create(store: S, network: Network, config: WalletConfig) -> Result<Self, WalletError> {
        Ok(Self::wrap(WalletCore::create(store, network, config)?))
    }

    pub fn load(store: S, network: Network, config: WalletConfig) -> Result<Self, WalletError> {
        Ok(Self::wrap(WalletCore::load(store, network, config)?))
    }

    fn wrap(core: WalletCore<S>) -> Self {
        Self {
            core: Mutex::new(core),
            synced_cv: Condvar::new(),
            scanning: AtomicBool::new(false),
            abort_rescan: AtomicBool::new(false),
            scanning_lock: Mutex::new(()),
        }
    }

    /// Runs `op` under the wallet lock.
    pub fn with_core<R>(&self, op: impl FnOnce(&mut WalletCore<S>) -> R) -> R {
        let mut guard = self.core.lock().expect("wallet lock");
        op(&mut guard)
    }

    pub(crate) fn notify_synced(&self) {
        self.synced_cv.notify_all();
    }

    /// Blocks until the classifier has processed up to the tip that
    /// was current at entry. Must be called without the wallet lock.
    pub fn wait_until_synced_to_current_chain(&self, chain: &dyn ChainView) {
        let Some(tip) = chain.tip() else {
            return;
        };
        let mut guard = self.core.lock().expect("wallet lock");
        while guard.last_block.map(|block| block.hash) != Some(tip.hash) {
            guard = self.synced_cv.wait(guard).expect("wallet lock");
        }
    }

    pub fn abort_rescan(&self) {
        self.abort_rescan.store(true, Ordering::SeqCst);
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    pub fn params(&self) -> &'static vaultd_consensus::ChainParams {
        chain_params(self.with_core(|core| core.network))
    }
}

/// Process-wide coordinator for open wallets. Owned by the embedding
/// node; nothing here is global state.
pub struct WalletRegistry<S: KeyValueStore> {
    wallets: Vec<std::sync::Arc<Wallet<S>>>,
}

impl<S: KeyValueStore> WalletRegistry<S> {
    pub fn new() -> Self {
        Self {
            wallets: Vec::new(),
        }
    }

    pub fn register(&mut self, wallet: std::sync::Arc<Wallet<S>>) {
        self.wallets.push(wallet);
    }

    pub fn wallets(&self) -> &[std::sync::Arc<Wallet<S>>] {
        &self.wallets
    }

    /// Flushes every wallet; called once at shutdown.
    pub fn shutdown(&mut self) -> Result<(), WalletError> {
        for wallet in &self.wallets {
            wallet.with_core(|core| core.flush(true))?;
        }
        self.wallets.clear();
        Ok(())
    }
}
