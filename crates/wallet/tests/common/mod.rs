//! In-test chain: a linear block list implementing the chain-view
//! boundary plus a recording broadcast sink.

use std::cell::RefCell;
use std::sync::Arc;

use vaultd_consensus::{Hash256, Network, ZERO_HASH};
use vaultd_primitives::block::{Block, BlockHeader};
use vaultd_primitives::outpoint::OutPoint;
use vaultd_primitives::transaction::{Transaction, TxIn, TxOut};
use vaultd_storage::MemoryStore;
use vaultd_wallet::{BlockLocation, BroadcastSink, ChainView, Wallet, WalletConfig};

pub type TestWallet = Wallet<Arc<MemoryStore>>;

pub fn test_config() -> WalletConfig {
    WalletConfig {
        keypool_size: 5,
        ..WalletConfig::default()
    }
}

pub fn new_wallet() -> (TestWallet, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let wallet =
        Wallet::create(Arc::clone(&store), Network::Regtest, test_config()).expect("create wallet");
    (wallet, store)
}

pub struct ChainSim {
    blocks: RefCell<Vec<Block>>,
    pub broadcasts: RefCell<Vec<Hash256>>,
    pub reject_mempool: RefCell<bool>,
}

impl ChainSim {
    pub fn new() -> Self {
        let genesis = Block {
            header: BlockHeader {
                version: 1,
                prev_block: ZERO_HASH,
                merkle_root: ZERO_HASH,
                time: 1_600_000_000,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            transactions: Vec::new(),
        };
        Self {
            blocks: RefCell::new(vec![genesis]),
            broadcasts: RefCell::new(Vec::new()),
            reject_mempool: RefCell::new(false),
        }
    }

    pub fn height(&self) -> i32 {
        self.blocks.borrow().len() as i32 - 1
    }

    fn next_block(&self, transactions: Vec<Transaction>) -> Block {
        let blocks = self.blocks.borrow();
        let prev = blocks.last().expect("genesis");
        Block {
            header: BlockHeader {
                version: 1,
                prev_block: prev.hash(),
                merkle_root: ZERO_HASH,
                time: prev.header.time + 60,
                bits: prev.header.bits,
                nonce: 0,
            },
            transactions,
        }
    }

    /// Mines a block and delivers the connect event.
    pub fn mine(
        &self,
        wallet: &TestWallet,
        transactions: Vec<Transaction>,
        conflicted: &[Hash256],
    ) -> Block {
        let block = self.next_block(transactions);
        self.blocks.borrow_mut().push(block.clone());
        wallet.on_block_connected(&block, self.height(), conflicted);
        block
    }

    /// Mines empty blocks until the chain reaches `target_height`.
    pub fn mine_until(&self, wallet: &TestWallet, target_height: i32) {
        while self.height() < target_height {
            self.mine(wallet, Vec::new(), &[]);
        }
    }

    /// Pops the tip and delivers the disconnect event.
    pub fn disconnect_tip(&self, wallet: &TestWallet) -> Block {
        let block = self.blocks.borrow_mut().pop().expect("tip");
        wallet.on_block_disconnected(&block);
        block
    }
}

impl ChainView for ChainSim {
    fn tip(&self) -> Option<BlockLocation> {
        let blocks = self.blocks.borrow();
        let tip = blocks.last()?;
        Some(BlockLocation {
            hash: tip.hash(),
            height: blocks.len() as i32 - 1,
            time: tip.header.time,
        })
    }

    fn block_at_height(&self, height: i32) -> Option<Block> {
        self.blocks.borrow().get(usize::try_from(height).ok()?).cloned()
    }

    fn location_of(&self, hash: &Hash256) -> Option<BlockLocation> {
        let blocks = self.blocks.borrow();
        blocks.iter().enumerate().find_map(|(height, block)| {
            (block.hash() == *hash).then(|| BlockLocation {
                hash: *hash,
                height: height as i32,
                time: block.header.time,
            })
        })
    }

    fn depth_in_main_chain(&self, hash: &Hash256) -> i32 {
        let blocks = self.blocks.borrow();
        let tip_height = blocks.len() as i32 - 1;
        blocks
            .iter()
            .position(|block| block.hash() == *hash)
            .map(|height| tip_height - height as i32 + 1)
            .unwrap_or(0)
    }

    fn coinbase_maturity(&self) -> i32 {
        100
    }
}

impl BroadcastSink for ChainSim {
    fn broadcast(&self, tx: &Transaction) -> bool {
        self.broadcasts.borrow_mut().push(tx.txid());
        true
    }

    fn accept_to_memory_pool(&self, _tx: &Transaction, _absurd_fee_limit: i64) -> Result<(), String> {
        if *self.reject_mempool.borrow() {
            Err("rejected".to_string())
        } else {
            Ok(())
        }
    }
}

/// A funding transaction from outside the wallet: spends a synthetic
/// outpoint nobody owns and pays `value` to `script_pubkey`.
pub fn faucet_tx(salt: u8, value: i64, script_pubkey: Vec<u8>) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn::from_outpoint(OutPoint::new([salt; 32], 0))],
        outputs: vec![TxOut {
            value,
            script_pubkey,
        }],
        lock_time: 0,
    }
}

/// A p2pkh script for a key that is not in any wallet.
pub fn external_script(salt: u8) -> Vec<u8> {
    vaultd_script::p2pkh_script(&[salt; 20])
}

pub fn address_script(address: &str) -> Vec<u8> {
    vaultd_primitives::address::address_to_script_pubkey(address, Network::Regtest)
        .expect("decode address")
}
