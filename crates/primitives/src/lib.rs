//! Core transaction/block types and consensus serialization.

pub mod address;
pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod transaction;

pub use address::{
    address_to_script_pubkey, script_pubkey_to_address, secret_key_to_wif, wif_to_secret_key,
    AddressError,
};
pub use block::{Block, BlockHeader};
pub use encoding::{decode_all, encode_to_vec, Decodable, DecodeError, Decoder, Encodable, Encoder};
pub use hash::{hash160, hmac_sha512, sha256, sha256d};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
