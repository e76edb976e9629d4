//! Standard script handling and transparent-input signature hashing.

pub mod secp;
pub mod sighash;
pub mod standard;

pub use secp::secp256k1_ctx;
pub use sighash::{signature_hash, SighashError, SighashType, SIGHASH_ALL};
pub use standard::{
    classify_script_pubkey, p2pkh_script, p2pkh_script_sig, p2sh_hash_from_script_pubkey,
    p2sh_script_pubkey, parse_multisig, pubkey_from_script_pubkey, pubkey_hash_from_script_pubkey,
    push_data, ScriptType,
};
