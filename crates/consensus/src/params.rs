//! Chain parameter definitions.

use crate::money::Amount;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    /// Confirmations a coinbase output needs before it is spendable.
    pub coinbase_maturity: i32,
    pub pubkey_address_prefix: u8,
    pub script_address_prefix: u8,
    pub secret_key_prefix: u8,
    /// Floor relay fee rate in base units per 1000 bytes.
    pub min_relay_fee_per_kb: Amount,
    /// Hard ceiling on the fee of any wallet-built transaction.
    pub max_tx_fee: Amount,
}

pub fn chain_params(network: Network) -> &'static ChainParams {
    match network {
        Network::Mainnet => &MAINNET,
        Network::Testnet => &TESTNET,
        Network::Regtest => &REGTEST,
    }
}

static MAINNET: ChainParams = ChainParams {
    network: Network::Mainnet,
    coinbase_maturity: 100,
    pubkey_address_prefix: 0x00,
    script_address_prefix: 0x05,
    secret_key_prefix: 0x80,
    min_relay_fee_per_kb: 1000,
    max_tx_fee: 10 * crate::money::COIN,
};

static TESTNET: ChainParams = ChainParams {
    network: Network::Testnet,
    coinbase_maturity: 100,
    pubkey_address_prefix: 0x6f,
    script_address_prefix: 0xc4,
    secret_key_prefix: 0xef,
    min_relay_fee_per_kb: 1000,
    max_tx_fee: 10 * crate::money::COIN,
};

static REGTEST: ChainParams = ChainParams {
    network: Network::Regtest,
    coinbase_maturity: 100,
    pubkey_address_prefix: 0x6f,
    script_address_prefix: 0xc4,
    secret_key_prefix: 0xef,
    min_relay_fee_per_kb: 1000,
    max_tx_fee: 10 * crate::money::COIN,
};
