use vaultd_consensus::Amount;

/// Tunables supplied by the embedding node.
#[derive(Clone, Debug)]
pub struct WalletConfig {
    /// Keys kept pre-generated on each chain of the keypool.
    pub keypool_size: usize,
    /// Fee rate in base units per 1000 bytes used when the caller
    /// does not supply one.
    pub pay_tx_fee_per_kb: Amount,
    /// Fee rate assumed for far-future change spends.
    pub long_term_fee_per_kb: Amount,
    /// Seconds an unlock lasts before the wallet relocks itself.
    pub unlock_timeout_secs: u64,
    /// Bounds of the uniformly sampled resend interval, in seconds.
    pub resend_interval_min_secs: u64,
    pub resend_interval_max_secs: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            keypool_size: 100,
            pay_tx_fee_per_kb: 1000,
            long_term_fee_per_kb: 1000,
            unlock_timeout_secs: 600,
            resend_interval_min_secs: 12 * 60,
            resend_interval_max_secs: 36 * 60,
        }
    }
}
