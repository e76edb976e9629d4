//! Standard script classification and construction.

use secp256k1::PublicKey;

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    P2Pk,
    P2Pkh,
    P2Sh,
    Multisig,
    Unknown,
}

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    if is_p2pkh(script) {
        ScriptType::P2Pkh
    } else if is_p2sh(script) {
        ScriptType::P2Sh
    } else if is_p2pk(script) {
        ScriptType::P2Pk
    } else if parse_multisig(script).is_some() {
        ScriptType::Multisig
    } else {
        ScriptType::Unknown
    }
}

pub fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

pub fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

pub fn is_p2pk(script: &[u8]) -> bool {
    let key_len = match script.first().copied() {
        Some(len @ 33) => len,
        Some(len @ 65) => len,
        _ => return false,
    };
    let expected_len = key_len as usize + 2;
    script.len() == expected_len && script[script.len() - 1] == OP_CHECKSIG
}

/// Key hash paid by a P2PKH output, if the script is one.
pub fn pubkey_hash_from_script_pubkey(script: &[u8]) -> Option<[u8; 20]> {
    if !is_p2pkh(script) {
        return None;
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&script[3..23]);
    Some(hash)
}

pub fn p2sh_hash_from_script_pubkey(script: &[u8]) -> Option<[u8; 20]> {
    if !is_p2sh(script) {
        return None;
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&script[2..22]);
    Some(hash)
}

/// Bare public key of a P2PK output, if the script is one.
pub fn pubkey_from_script_pubkey(script: &[u8]) -> Option<PublicKey> {
    if !is_p2pk(script) {
        return None;
    }
    PublicKey::from_slice(&script[1..script.len() - 1]).ok()
}

pub fn p2pkh_script(key_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(0x14);
    script.extend_from_slice(key_hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

pub fn p2sh_script_pubkey(script_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.push(OP_HASH160);
    script.push(0x14);
    script.extend_from_slice(script_hash);
    script.push(OP_EQUAL);
    script
}

/// Minimal push of `data` onto the stack.
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => script.push(0x00),
        len @ 1..=0x4b => {
            script.push(len as u8);
            script.extend_from_slice(data);
        }
        len @ 0x4c..=0xff => {
            script.push(0x4c);
            script.push(len as u8);
            script.extend_from_slice(data);
        }
        len => {
            script.push(0x4d);
            script.extend_from_slice(&(len as u16).to_le_bytes());
            script.extend_from_slice(data);
        }
    }
}

/// ScriptSig spending a P2PKH output: push(sig ‖ hashtype) push(pubkey).
pub fn p2pkh_script_sig(signature_with_hashtype: &[u8], pubkey: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(signature_with_hashtype.len() + pubkey.len() + 4);
    push_data(&mut script, signature_with_hashtype);
    push_data(&mut script, pubkey);
    script
}

/// Parses an m-of-n bare multisig script, returning (required, keys).
pub fn parse_multisig(script: &[u8]) -> Option<(usize, Vec<PublicKey>)> {
    if script.len() < 4 || script[script.len() - 1] != OP_CHECKMULTISIG {
        return None;
    }
    let required = decode_small_int(script[0])?;
    let key_count = decode_small_int(script[script.len() - 2])?;
    if required == 0 || required > key_count {
        return None;
    }

    let mut keys = Vec::with_capacity(key_count);
    let mut cursor = 1usize;
    for _ in 0..key_count {
        let len = *script.get(cursor)? as usize;
        if len != 33 && len != 65 {
            return None;
        }
        cursor += 1;
        let bytes = script.get(cursor..cursor + len)?;
        keys.push(PublicKey::from_slice(bytes).ok()?);
        cursor += len;
    }
    if cursor != script.len() - 2 {
        return None;
    }
    Some((required, keys))
}

fn decode_small_int(opcode: u8) -> Option<usize> {
    if (OP_1..=OP_16).contains(&opcode) {
        Some((opcode - OP_1 + 1) as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secp::secp256k1_ctx;
    use secp256k1::SecretKey;

    fn test_pubkey(byte: u8) -> PublicKey {
        let secret = SecretKey::from_slice(&[byte; 32]).expect("secret key");
        PublicKey::from_secret_key(secp256k1_ctx(), &secret)
    }

    #[test]
    fn classify_standard_scripts() {
        let p2pkh = p2pkh_script(&[5u8; 20]);
        assert_eq!(classify_script_pubkey(&p2pkh), ScriptType::P2Pkh);
        assert_eq!(pubkey_hash_from_script_pubkey(&p2pkh), Some([5u8; 20]));

        let p2sh = p2sh_script_pubkey(&[6u8; 20]);
        assert_eq!(classify_script_pubkey(&p2sh), ScriptType::P2Sh);
        assert_eq!(p2sh_hash_from_script_pubkey(&p2sh), Some([6u8; 20]));

        assert_eq!(classify_script_pubkey(&[0x6a]), ScriptType::Unknown);
    }

    #[test]
    fn p2pk_roundtrip() {
        let pubkey = test_pubkey(3);
        let mut script = Vec::new();
        push_data(&mut script, &pubkey.serialize());
        script.push(0xac);
        assert_eq!(classify_script_pubkey(&script), ScriptType::P2Pk);
        assert_eq!(pubkey_from_script_pubkey(&script), Some(pubkey));
    }

    #[test]
    fn multisig_parse() {
        let key_a = test_pubkey(1);
        let key_b = test_pubkey(2);
        let mut script = vec![0x52]; // OP_2
        push_data(&mut script, &key_a.serialize());
        push_data(&mut script, &key_b.serialize());
        script.push(0x52); // OP_2
        script.push(0xae);
        let (required, keys) = parse_multisig(&script).expect("multisig");
        assert_eq!(required, 2);
        assert_eq!(keys, vec![key_a, key_b]);
        assert_eq!(classify_script_pubkey(&script), ScriptType::Multisig);
    }

    #[test]
    fn script_sig_layout() {
        let sig = vec![0x30; 71];
        let pubkey = test_pubkey(4).serialize();
        let script = p2pkh_script_sig(&sig, &pubkey);
        assert_eq!(script[0] as usize, sig.len());
        assert_eq!(script[1 + sig.len()] as usize, pubkey.len());
        assert_eq!(script.len(), 2 + sig.len() + pubkey.len());
    }
}
