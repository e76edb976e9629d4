//! Chain event processing: classifying relevant transactions,
//! keeping block linkage current across reorgs, rescanning, and
//! rebroadcasting our own unconfirmed transactions.

use std::sync::atomic::Ordering;

use rand::Rng;
use vaultd_consensus::Hash256;
use vaultd_log::{log_debug, log_info, log_warn};
use vaultd_primitives::block::Block;
use vaultd_primitives::transaction::Transaction;
use vaultd_storage::KeyValueStore;

use crate::chain::{BlockLocation, BroadcastSink, ChainView};
use crate::db::DbBatch;
use crate::error::WalletError;
use crate::wallet::{current_unix_seconds, Wallet, WalletCore};
use crate::wtx::{TxState, WalletTx, ISMINE_ALL};

/// Exclusive right to run a rescan. Construct through
/// [`Wallet::reserve_rescan`]; dropping it releases the right.
pub struct RescanReserver<'a> {
    scanning: &'a std::sync::atomic::AtomicBool,
}

impl Drop for RescanReserver<'_> {
    fn drop(&mut self) {
        self.scanning.store(false, Ordering::SeqCst);
    }
}

impl<S: KeyValueStore> WalletCore<S> {
    /// Decides relevance and upserts the wallet copy. Returns true
    /// when the transaction is (now) tracked. `height` is the chain
    /// height of the enclosing block, when there is one.
    pub(crate) fn add_if_involves_me(
        &mut self,
        tx: &Transaction,
        state: TxState,
        block_time: Option<u32>,
        height: Option<i32>,
        update: bool,
    ) -> bool {
        let txid = tx.txid();
        let existing = self.txs.contains_key(&txid);
        if existing && !update {
            return true;
        }

        let mut relevant = existing;
        if !relevant {
            relevant = tx
                .outputs
                .iter()
                .any(|out| self.is_mine_output(&out.script_pubkey).matches(ISMINE_ALL));
        }
        if !relevant && !tx.is_coinbase() {
            relevant = tx
                .inputs
                .iter()
                .any(|input| self.spenders_of(&input.prevout).is_some())
                || tx.inputs.iter().any(|input| {
                    self.transaction(&input.prevout.txid)
                        .and_then(|parent| parent.tx.outputs.get(input.prevout.vout as usize))
                        .map(|out| self.is_mine_output(&out.script_pubkey).matches(ISMINE_ALL))
                        .unwrap_or(false)
                });
        }
        if !relevant {
            return false;
        }

        if let Err(err) = self.upsert_tx(tx, state, block_time, height) {
            // A malformed record must not stop the classifier from
            // processing its peers.
            log_warn!("failed to record wallet transaction: {err}");
            return false;
        }
        true
    }

    fn upsert_tx(
        &mut self,
        tx: &Transaction,
        state: TxState,
        block_time: Option<u32>,
        height: Option<i32>,
    ) -> Result<(), WalletError> {
        let txid = tx.txid();
        let now = current_unix_seconds();

        if let Some(wtx) = self.txs.get_mut(&txid) {
            if wtx.state != state {
                wtx.state = state;
                wtx.mark_dirty();
                let mut batch = DbBatch::new();
                batch.put_tx(&txid, wtx);
                self.db.commit(batch)?;
                self.dirty_parents_of(txid);
            }
            if matches!(state, TxState::InBlock { .. }) {
                self.note_keys_seen_on_chain(&txid);
            }
            return Ok(());
        }

        let position = match state {
            TxState::InBlock { index, .. } => height.map(|height| (height, index)),
            _ => None,
        };
        let mut wtx = WalletTx::new(tx.clone());
        wtx.state = state;
        wtx.time_received = now;
        wtx.time_smart = self.compute_time_smart(position, block_time, now);
        wtx.order_pos = self.next_order_pos()?;

        // From-me is decided against our own inputs, which wants the
        // record in the table; insert first, then classify.
        self.index_spends(&wtx);
        self.txs.insert(txid, wtx);
        let from_me = self.tx_debit(&txid, ISMINE_ALL) > 0;
        if let Some(wtx) = self.txs.get_mut(&txid) {
            wtx.from_me = from_me;
        }

        // A second spender of any of these outpoints is a conflict;
        // merge metadata across each affected group.
        let conflicted_outpoints: Vec<_> = tx
            .inputs
            .iter()
            .map(|input| input.prevout)
            .filter(|outpoint| {
                self.spenders_of(outpoint)
                    .map(|group| group.len() > 1)
                    .unwrap_or(false)
            })
            .collect();
        for outpoint in conflicted_outpoints {
            self.sync_conflict_metadata(&outpoint);
        }

        let mut batch = DbBatch::new();
        if let Some(wtx) = self.txs.get(&txid) {
            batch.put_tx(&txid, wtx);
        }
        self.db.commit(batch)?;
        self.dirty_parents_of(txid);

        if matches!(state, TxState::InBlock { .. }) {
            self.note_keys_seen_on_chain(&txid);
        }
        log_debug!("wallet recorded transaction {}", hex_prefix(&txid));
        Ok(())
    }

    /// Consumes keypool entries whose keys the chain now shows in use.
    fn note_keys_seen_on_chain(&mut self, txid: &Hash256) {
        let key_ids: Vec<_> = match self.txs.get(txid) {
            Some(wtx) => wtx
                .tx
                .outputs
                .iter()
                .filter_map(|out| vaultd_script::pubkey_hash_from_script_pubkey(&out.script_pubkey))
                .collect(),
            None => return,
        };
        for key_id in key_ids {
            self.mark_pool_key_used(&key_id);
        }
    }

    /// Stable insertion timestamp: the block-time-adjusted receive
    /// time, clamped between the newest entry at an earlier chain
    /// position and the oldest entry at a later one, so timestamp
    /// order matches chain order even for out-of-order insertions
    /// during a rescan or reorg.
    fn compute_time_smart(
        &self,
        position: Option<(i32, i32)>,
        block_time: Option<u32>,
        now: u64,
    ) -> u64 {
        let candidate = match block_time {
            Some(block_time) => u64::from(block_time).min(now),
            None => now,
        };
        let Some(position) = position else {
            // Pending transactions append at the end of the order:
            // wall time, never before anything already recorded.
            let latest = self
                .txs
                .values()
                .map(|wtx| wtx.time_smart)
                .max()
                .unwrap_or(0);
            return candidate.max(latest);
        };

        let mut max_prev = 0u64;
        let mut min_next: Option<u64> = None;
        for wtx in self.txs.values() {
            if wtx.time_smart == 0 {
                continue;
            }
            let earlier = match wtx.state {
                TxState::InBlock { block, index } => match self.block_height(&block) {
                    Some(height) => (height, index) <= position,
                    // Linkage predating this session sorts as earlier.
                    None => true,
                },
                // Pending, conflicted, and abandoned entries follow
                // every mined one.
                _ => false,
            };
            if earlier {
                max_prev = max_prev.max(wtx.time_smart);
            } else {
                min_next = Some(min_next.map_or(wtx.time_smart, |m| m.min(wtx.time_smart)));
            }
        }

        let mut smart = candidate.max(max_prev);
        if let Some(min_next) = min_next {
            smart = smart.min(min_next).max(max_prev.min(min_next));
        }
        smart
    }
}

impl<S: KeyValueStore> Wallet<S> {
    /// Attempts to take the exclusive scanning right.
    pub fn reserve_rescan(&self) -> Result<RescanReserver<'_>, WalletError> {
        let _guard = self.scanning_lock.lock().expect("scanning lock");
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(WalletError::RescanInProgress);
        }
        self.abort_rescan.store(false, Ordering::SeqCst);
        Ok(RescanReserver {
            scanning: &self.scanning,
        })
    }

    pub fn on_tx_added_to_mempool(&self, tx: &Transaction) {
        self.with_core(|core| {
            let tracked = core.add_if_involves_me(tx, TxState::Unconfirmed, None, None, true);
            if tracked {
                if let Some(wtx) = core.txs.get_mut(&tx.txid()) {
                    wtx.in_mempool = true;
                }
            }
        });
    }

    pub fn on_tx_removed_from_mempool(&self, txid: &Hash256) {
        self.with_core(|core| {
            if let Some(wtx) = core.txs.get_mut(txid) {
                wtx.in_mempool = false;
            }
        });
    }

    pub fn on_block_connected(&self, block: &Block, height: i32, conflicted: &[Hash256]) {
        self.with_core(|core| {
            let block_hash = block.hash();
            core.record_block_height(block_hash, height);
            for txid in conflicted {
                core.mark_conflicted(block_hash, *txid);
            }
            for (position, tx) in block.transactions.iter().enumerate() {
                let state = TxState::InBlock {
                    block: block_hash,
                    index: position as i32,
                };
                core.add_if_involves_me(tx, state, Some(block.header.time), Some(height), true);
                // Whatever the block confirmed is no longer pending.
                if let Some(wtx) = core.txs.get_mut(&tx.txid()) {
                    wtx.in_mempool = false;
                }
            }
            // Only blocks holding our transactions stay in the
            // ordering index.
            let relevant = block
                .transactions
                .iter()
                .any(|tx| core.txs.contains_key(&tx.txid()));
            if !relevant {
                core.forget_block_height(&block_hash);
            }
            core.last_block = Some(BlockLocation {
                hash: block_hash,
                height,
                time: block.header.time,
            });
            let mut batch = DbBatch::new();
            batch.put_best_block(&[block_hash]);
            if let Err(err) = core.db.commit(batch) {
                log_warn!("failed to persist best block: {err}");
            }
        });
        self.notify_synced();
    }

    pub fn on_block_disconnected(&self, block: &Block) {
        self.with_core(|core| {
            core.forget_block_height(&block.hash());
            let mut batch = DbBatch::new();
            for tx in &block.transactions {
                let txid = tx.txid();
                if let Some(wtx) = core.txs.get_mut(&txid) {
                    wtx.state = TxState::Unconfirmed;
                    wtx.mark_dirty();
                    batch.put_tx(&txid, wtx);
                }
            }
            if !batch.is_empty() {
                if let Err(err) = core.db.commit(batch) {
                    log_warn!("failed to persist disconnect updates: {err}");
                }
            }
            core.last_block = core.last_block.take().map(|last| BlockLocation {
                hash: block.header.prev_block,
                height: last.height - 1,
                time: last.time,
            });
        });
        self.notify_synced();
    }

    /// Walks `[start, stop]` through the chain view classifying every
    /// transaction. Returns the last height actually processed; an
    /// early return after `abort_rescan` is a legitimate outcome the
    /// caller must record.
    pub fn rescan(
        &self,
        chain: &dyn ChainView,
        start: i32,
        stop: i32,
        _reserver: &RescanReserver<'_>,
    ) -> Result<i32, WalletError> {
        let mut last_processed = start.saturating_sub(1);
        log_info!("rescanning blocks {start}..={stop}");
        for height in start..=stop {
            if self.abort_rescan.load(Ordering::SeqCst) {
                log_info!("rescan aborted at height {last_processed}");
                return Ok(last_processed);
            }
            let Some(block) = chain.block_at_height(height) else {
                break;
            };
            let block_hash = block.hash();
            self.with_core(|core| {
                core.record_block_height(block_hash, height);
                for (position, tx) in block.transactions.iter().enumerate() {
                    let state = TxState::InBlock {
                        block: block_hash,
                        index: position as i32,
                    };
                    core.add_if_involves_me(tx, state, Some(block.header.time), Some(height), false);
                }
                let relevant = block
                    .transactions
                    .iter()
                    .any(|tx| core.txs.contains_key(&tx.txid()));
                if !relevant {
                    core.forget_block_height(&block_hash);
                }
            });
            last_processed = height;
        }
        log_info!("rescan finished at height {last_processed}");
        Ok(last_processed)
    }

    /// Periodic rebroadcast of our own unconfirmed transactions. The
    /// round interval is re-sampled uniformly each pass so peers
    /// cannot fingerprint the wallet by its cadence. Rounds only run
    /// once the best block is at least five minutes old.
    pub fn resend_transactions(&self, best_block_time: u64, sink: &dyn BroadcastSink) {
        let now = current_unix_seconds();
        if now.saturating_sub(best_block_time) < 5 * 60 {
            return;
        }
        let due = self.with_core(|core| {
            if core.next_resend == 0 {
                core.next_resend = now + sample_resend_delay(&core.config);
                return None;
            }
            if now < core.next_resend {
                return None;
            }
            core.next_resend = now + sample_resend_delay(&core.config);

            let candidates: Vec<(Hash256, Transaction, bool)> = core
                .txs
                .values()
                .filter(|wtx| wtx.from_me)
                .filter(|wtx| matches!(wtx.state, TxState::Unconfirmed))
                .filter(|wtx| wtx.time_received + 5 * 60 <= best_block_time)
                .map(|wtx| (wtx.txid(), wtx.tx.clone(), wtx.in_mempool))
                .collect();
            Some(candidates)
        });

        let Some(candidates) = due else {
            return;
        };
        let mut relayed = 0usize;
        for (txid, tx, in_mempool) in candidates {
            let acceptable = in_mempool || sink.accept_to_memory_pool(&tx, i64::MAX).is_ok();
            if acceptable && sink.broadcast(&tx) {
                relayed += 1;
            } else {
                log_debug!("rebroadcast skipped for {}", hex_prefix(&txid));
            }
        }
        if relayed > 0 {
            log_info!("rebroadcast {relayed} wallet transaction(s)");
        }
    }
}

fn sample_resend_delay(config: &crate::config::WalletConfig) -> u64 {
    let low = config.resend_interval_min_secs;
    let high = config.resend_interval_max_secs.max(low + 1);
    rand::thread_rng().gen_range(low..high)
}

fn hex_prefix(hash: &Hash256) -> String {
    let mut out = vaultd_consensus::hash256_to_hex(hash);
    out.truncate(12);
    out
}
