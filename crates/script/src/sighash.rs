//! Signature hashing for transparent inputs.

use vaultd_consensus::Hash256;
use vaultd_primitives::encoding::{Encodable, Encoder};
use vaultd_primitives::hash::sha256d;
use vaultd_primitives::transaction::Transaction;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SighashType(pub u32);

impl SighashType {
    pub fn all() -> Self {
        Self(SIGHASH_ALL)
    }

    pub fn base_type(self) -> u32 {
        self.0 & 0x1f
    }

    pub fn has_anyone_can_pay(self) -> bool {
        (self.0 & SIGHASH_ANYONECANPAY) != 0
    }
}

#[derive(Debug)]
pub enum SighashError {
    InputIndexOutOfRange,
    MissingOutput,
}

impl std::fmt::Display for SighashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SighashError::InputIndexOutOfRange => write!(f, "input index out of range"),
            SighashError::MissingOutput => write!(f, "no matching output for SIGHASH_SINGLE"),
        }
    }
}

impl std::error::Error for SighashError {}

/// Digest committed to by the signature on `input_index`.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    sighash_type: SighashType,
) -> Result<Hash256, SighashError> {
    if input_index >= tx.inputs.len() {
        return Err(SighashError::InputIndexOutOfRange);
    }
    let hash_single = sighash_type.base_type() == SIGHASH_SINGLE;
    let hash_none = sighash_type.base_type() == SIGHASH_NONE;
    if hash_single && input_index >= tx.outputs.len() {
        return Err(SighashError::MissingOutput);
    }
    let anyone_can_pay = sighash_type.has_anyone_can_pay();

    let mut encoder = Encoder::new();
    encoder.write_i32_le(tx.version);

    let input_count = if anyone_can_pay { 1 } else { tx.inputs.len() };
    encoder.write_compact_size(input_count as u64);
    for idx in 0..input_count {
        let actual_index = if anyone_can_pay { input_index } else { idx };
        let input = &tx.inputs[actual_index];
        input.prevout.encode(&mut encoder);
        let is_signing = actual_index == input_index;
        if is_signing {
            encoder.write_var_bytes(script_code);
        } else {
            encoder.write_compact_size(0);
        }
        if !is_signing && (hash_single || hash_none) {
            encoder.write_u32_le(0);
        } else {
            encoder.write_u32_le(input.sequence);
        }
    }

    let output_count = if hash_none {
        0
    } else if hash_single {
        input_index + 1
    } else {
        tx.outputs.len()
    };
    encoder.write_compact_size(output_count as u64);
    for idx in 0..output_count {
        if hash_single && idx != input_index {
            encoder.write_i64_le(-1);
            encoder.write_compact_size(0);
        } else {
            tx.outputs[idx].encode(&mut encoder);
        }
    }

    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(sighash_type.0);
    Ok(sha256d(&encoder.into_inner()))
}
