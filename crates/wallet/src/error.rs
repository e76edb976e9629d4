use vaultd_primitives::encoding::DecodeError;
use vaultd_storage::StoreError;

#[derive(Debug)]
pub enum WalletError {
    /// The referenced key, script, or output does not belong to this wallet.
    NotMine,
    /// A key is already present with different material.
    AlreadyExists,
    /// The operation needs a private key while the wallet is locked.
    Locked,
    BadPassphrase,
    AlreadyEncrypted,
    InsufficientFunds,
    DustOutput,
    FeeTooHigh,
    FeeEstimationFailed,
    SigningFailed(&'static str),
    NotAbandonable,
    RescanInProgress,
    /// Unrecoverable database damage; the only fatal kind.
    DatabaseCorrupt(&'static str),
    /// The database replayed with skipped records and should be compacted.
    NeedRewrite,
    Conflicted,
    Store(StoreError),
    Decode(DecodeError),
    InvalidData(&'static str),
}

impl std::fmt::Display for WalletError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalletError::NotMine => write!(f, "not a wallet key or output"),
            WalletError::AlreadyExists => write!(f, "key already exists with different material"),
            WalletError::Locked => write!(f, "wallet is locked"),
            WalletError::BadPassphrase => write!(f, "incorrect passphrase"),
            WalletError::AlreadyEncrypted => write!(f, "wallet is already encrypted"),
            WalletError::InsufficientFunds => write!(f, "insufficient funds"),
            WalletError::DustOutput => write!(f, "output value is dust"),
            WalletError::FeeTooHigh => write!(f, "fee exceeds the configured ceiling"),
            WalletError::FeeEstimationFailed => write!(f, "fee targeting did not converge"),
            WalletError::SigningFailed(message) => write!(f, "signing failed: {message}"),
            WalletError::NotAbandonable => write!(f, "transaction cannot be abandoned"),
            WalletError::RescanInProgress => write!(f, "a rescan is already running"),
            WalletError::DatabaseCorrupt(message) => write!(f, "wallet database corrupt: {message}"),
            WalletError::NeedRewrite => write!(f, "wallet database needs rewrite"),
            WalletError::Conflicted => write!(f, "transaction conflicts with the chain"),
            WalletError::Store(err) => write!(f, "{err}"),
            WalletError::Decode(err) => write!(f, "{err}"),
            WalletError::InvalidData(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for WalletError {}

impl From<StoreError> for WalletError {
    fn from(err: StoreError) -> Self {
        WalletError::Store(err)
    }
}

impl From<DecodeError> for WalletError {
    fn from(err: DecodeError) -> Self {
        WalletError::Decode(err)
    }
}
