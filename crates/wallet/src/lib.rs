//! Wallet core: keys, transactions, balances, and coin control for a
//! transparent UTXO chain. The chain itself is consumed through the
//! [`chain::ChainView`] boundary; nothing here validates blocks.

pub mod balance;
pub mod builder;
pub mod chain;
pub mod coinselect;
pub mod config;
pub mod db;
pub mod error;
pub mod hdchain;
pub mod keystore;
pub mod sync;
pub mod wallet;
pub mod wtx;

pub use builder::{CoinControl, CreatedTransaction, Recipient};
pub use chain::{BlockLocation, BroadcastSink, ChainEvent, ChainView};
pub use coinselect::{
    select_coins, select_coins_bnb, select_coins_knapsack, CoinSelectionParams, EligibilityFilter,
    OutputCandidate, Selection,
};
pub use config::WalletConfig;
pub use error::WalletError;
pub use hdchain::{derive_child_key, HdChain, KeyPool, KeyPoolEntry};
pub use keystore::{KeyId, KeyMetadata, KeyStore, KeyStoreState, MasterKeyEnvelope};
pub use sync::RescanReserver;
pub use wallet::{AddressBookEntry, ReservedKey, Wallet, WalletCore, WalletRegistry};
pub use wtx::{
    AccountingEntry, IsMineFilter, TxState, WalletTx, ABANDON_HASH, ISMINE_ALL, ISMINE_NO,
    ISMINE_SPENDABLE, ISMINE_WATCH_ONLY,
};
