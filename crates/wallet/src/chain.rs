//! Boundary contracts toward the chain client.
//!
//! The wallet never validates blocks or tracks the UTXO set; it sees
//! the chain through `ChainView` and hands finished transactions to a
//! `BroadcastSink`. The four event entry points on the wallet are
//! invoked by the chain client in source order.

use vaultd_consensus::Hash256;
use vaultd_primitives::block::Block;
use vaultd_primitives::transaction::Transaction;

/// Position of a block in the index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockLocation {
    pub hash: Hash256,
    pub height: i32,
    pub time: u32,
}

pub trait ChainView {
    fn tip(&self) -> Option<BlockLocation>;

    fn block_at_height(&self, height: i32) -> Option<Block>;

    fn location_of(&self, hash: &Hash256) -> Option<BlockLocation>;

    /// Confirmation depth of `hash` relative to the tip; 0 when the
    /// block is unknown or not on the main chain.
    fn depth_in_main_chain(&self, hash: &Hash256) -> i32;

    fn coinbase_maturity(&self) -> i32;
}

pub trait BroadcastSink {
    /// Hands the transaction to the relay layer.
    fn broadcast(&self, tx: &Transaction) -> bool;

    /// Submits to the local mempool; `Err` carries the reject reason.
    fn accept_to_memory_pool(&self, tx: &Transaction, absurd_fee_limit: i64)
        -> Result<(), String>;
}

/// Chain events in the order the source produced them.
#[derive(Clone, Debug)]
pub enum ChainEvent {
    TxAddedToMempool(Transaction),
    TxRemovedFromMempool(Hash256),
    BlockConnected {
        block: Block,
        height: i32,
        /// Mempool transactions displaced by this block.
        conflicted: Vec<Hash256>,
    },
    BlockDisconnected(Block),
}
