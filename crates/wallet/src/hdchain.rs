//! Hierarchical-deterministic key derivation and the keypool.
//!
//! Child keys are derived from a 32-byte master seed with the BIP32
//! hardened-CKD construction at `m/44'/c'/n'`, chain `c` being 0 for
//! external (receive) keys and 1 for internal (change) keys. Every
//! derivation is hardened, so only the seed is needed and the result
//! is bit-exact across implementations.
//!
//! The keypool holds already-derived, not-yet-handed-out keys. An
//! address only leaves the pool permanently (`keep`) once the
//! transaction using it is persisted; a crash in between leaves the
//! key in the pool and no reuse can occur.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use secp256k1::{PublicKey, Scalar, SecretKey};
use vaultd_primitives::hash::hmac_sha512;
use vaultd_script::secp256k1_ctx;
use zeroize::Zeroize;

use crate::error::WalletError;
use crate::keystore::KeyId;

const BIP32_SEED_KEY: &[u8] = b"Bitcoin seed";
const HARDENED: u32 = 0x8000_0000;
const PURPOSE: u32 = 44;

/// Persistent HD state: which seed and how far each chain has run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HdChain {
    pub version: u32,
    /// Key id of the seed key (its hash160), identifying the seed.
    pub seed_id: KeyId,
    pub external_counter: u32,
    pub internal_counter: u32,
}

pub const HD_CHAIN_VERSION: u32 = 1;

/// Derives the child private key for (`internal`, `index`).
pub fn derive_child_key(
    seed: &[u8; 32],
    internal: bool,
    index: u32,
) -> Result<(SecretKey, PublicKey), WalletError> {
    if index >= HARDENED {
        return Err(WalletError::InvalidData("hd counter exhausted"));
    }
    let mut master = hmac_sha512(BIP32_SEED_KEY, seed);
    let (mut key, mut chain_code) = split_extended(&master);
    master.zeroize();

    let chain = u32::from(internal);
    for level in [PURPOSE | HARDENED, chain | HARDENED, index | HARDENED] {
        let mut data = Vec::with_capacity(37);
        data.push(0x00);
        data.extend_from_slice(&key.secret_bytes());
        data.extend_from_slice(&level.to_be_bytes());
        let mut extended = hmac_sha512(&chain_code, &data);
        data.zeroize();

        let (tweak_bytes, next_chain_code) = split_extended(&extended);
        let tweak = Scalar::from_be_bytes(tweak_bytes.secret_bytes())
            .map_err(|_| WalletError::InvalidData("hd tweak out of range"))?;
        key = key
            .add_tweak(&tweak)
            .map_err(|_| WalletError::InvalidData("hd child key invalid"))?;
        chain_code = next_chain_code;
        extended.zeroize();
    }

    let pubkey = PublicKey::from_secret_key(secp256k1_ctx(), &key);
    Ok((key, pubkey))
}

fn split_extended(extended: &[u8; 64]) -> (SecretKey, [u8; 32]) {
    let key = SecretKey::from_slice(&extended[..32])
        .expect("hmac output is a valid scalar with overwhelming probability");
    let mut chain_code = [0u8; 32];
    chain_code.copy_from_slice(&extended[32..]);
    (key, chain_code)
}

/// One pre-generated pool key as persisted under `pool`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPoolEntry {
    pub time_created: u64,
    pub pubkey: Vec<u8>,
    pub internal: bool,
}

#[derive(Default)]
pub struct KeyPool {
    entries: BTreeMap<i64, KeyPoolEntry>,
    external: BTreeSet<i64>,
    internal: BTreeSet<i64>,
    by_key: HashMap<KeyId, i64>,
    next_index: i64,
}

impl KeyPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn external_size(&self) -> usize {
        self.external.len()
    }

    pub fn internal_size(&self) -> usize {
        self.internal.len()
    }

    pub fn next_index(&self) -> i64 {
        self.next_index
    }

    /// Installs an entry loaded from the database.
    pub fn load_entry(&mut self, index: i64, key_id: KeyId, entry: KeyPoolEntry) {
        if entry.internal {
            self.internal.insert(index);
        } else {
            self.external.insert(index);
        }
        self.by_key.insert(key_id, index);
        self.entries.insert(index, entry);
        if index >= self.next_index {
            self.next_index = index + 1;
        }
    }

    /// Adds a freshly derived key, returning its pool index.
    pub fn push(&mut self, key_id: KeyId, entry: KeyPoolEntry) -> i64 {
        let index = self.next_index;
        self.next_index += 1;
        self.load_entry(index, key_id, entry);
        index
    }

    /// Pops the lowest-indexed entry of the requested chain, falling
    /// back to the other chain when that one is exhausted.
    pub fn reserve(&mut self, internal: bool) -> Option<(i64, KeyPoolEntry)> {
        let index = {
            let (wanted, fallback) = if internal {
                (&self.internal, &self.external)
            } else {
                (&self.external, &self.internal)
            };
            wanted.first().or_else(|| fallback.first()).copied()?
        };
        self.external.remove(&index);
        self.internal.remove(&index);
        let entry = self.entries.get(&index).cloned()?;
        Some((index, entry))
    }

    /// Permanently consumes a reserved index.
    pub fn keep(&mut self, index: i64) -> Option<KeyPoolEntry> {
        let entry = self.entries.remove(&index)?;
        self.external.remove(&index);
        self.internal.remove(&index);
        self.by_key.retain(|_, mapped| *mapped != index);
        Some(entry)
    }

    /// Puts a reserved index back so the next `reserve` can return it.
    pub fn unreserve(&mut self, index: i64, internal: bool) {
        if !self.entries.contains_key(&index) {
            return;
        }
        if internal {
            self.internal.insert(index);
        } else {
            self.external.insert(index);
        }
    }

    /// Drops every entry with index ≤ `index`. Called when the chain
    /// shows a pool key being paid, meaning the user already handed
    /// out everything up to that point.
    pub fn mark_used_up_to(&mut self, index: i64) -> Vec<i64> {
        let removed: Vec<i64> = self
            .entries
            .range(..=index)
            .map(|(entry_index, _)| *entry_index)
            .collect();
        for entry_index in &removed {
            self.keep(*entry_index);
        }
        removed
    }

    pub fn index_of_key(&self, key_id: &KeyId) -> Option<i64> {
        self.by_key.get(key_id).copied()
    }

    /// Creation time of the oldest remaining entry; drives rescan
    /// depth after an import.
    pub fn oldest_key_time(&self) -> Option<u64> {
        self.entries
            .first_key_value()
            .map(|(_, entry)| entry.time_created)
    }

    pub fn indices(&self) -> impl Iterator<Item = &i64> {
        self.entries.keys()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&i64, &KeyPoolEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultd_primitives::hash::hash160;

    #[test]
    fn derivation_is_deterministic() {
        let seed = [0x5a; 32];
        let (key_a, pub_a) = derive_child_key(&seed, false, 3).expect("derive");
        let (key_b, pub_b) = derive_child_key(&seed, false, 3).expect("derive again");
        assert_eq!(key_a, key_b);
        assert_eq!(pub_a, pub_b);
    }

    #[test]
    fn chains_and_counters_diverge() {
        let seed = [0x5a; 32];
        let (_, external) = derive_child_key(&seed, false, 0).expect("external");
        let (_, internal) = derive_child_key(&seed, true, 0).expect("internal");
        let (_, next) = derive_child_key(&seed, false, 1).expect("next");
        assert_ne!(external, internal);
        assert_ne!(external, next);
    }

    fn entry(internal: bool, time: u64) -> KeyPoolEntry {
        KeyPoolEntry {
            time_created: time,
            pubkey: vec![2u8; 33],
            internal,
        }
    }

    #[test]
    fn reserve_prefers_requested_chain() {
        let mut pool = KeyPool::new();
        pool.push(hash160(b"a"), entry(false, 10));
        pool.push(hash160(b"b"), entry(true, 11));

        let (index, reserved) = pool.reserve(true).expect("reserve internal");
        assert!(reserved.internal);
        assert_eq!(index, 1);
        pool.unreserve(index, true);

        let (index, reserved) = pool.reserve(false).expect("reserve external");
        assert!(!reserved.internal);
        assert_eq!(index, 0);
    }

    #[test]
    fn reserve_falls_back_to_other_chain() {
        let mut pool = KeyPool::new();
        pool.push(hash160(b"a"), entry(false, 10));
        let (index, reserved) = pool.reserve(true).expect("fallback");
        assert!(!reserved.internal);
        assert_eq!(index, 0);
        assert!(pool.reserve(true).is_none());
    }

    #[test]
    fn unreserve_restores_same_index() {
        let mut pool = KeyPool::new();
        pool.push(hash160(b"a"), entry(false, 10));
        pool.push(hash160(b"b"), entry(false, 11));
        let (first, _) = pool.reserve(false).expect("reserve");
        pool.unreserve(first, false);
        let (again, _) = pool.reserve(false).expect("re-reserve");
        assert_eq!(first, again);
    }

    #[test]
    fn keep_removes_for_good() {
        let mut pool = KeyPool::new();
        pool.push(hash160(b"a"), entry(false, 10));
        let (index, _) = pool.reserve(false).expect("reserve");
        pool.keep(index);
        pool.unreserve(index, false);
        assert!(pool.reserve(false).is_none());
    }

    #[test]
    fn mark_used_drops_prefix() {
        let mut pool = KeyPool::new();
        for byte in 0..5u8 {
            pool.push(hash160(&[byte]), entry(false, 10 + u64::from(byte)));
        }
        let removed = pool.mark_used_up_to(2);
        assert_eq!(removed, vec![0, 1, 2]);
        assert_eq!(pool.external_size(), 2);
        assert_eq!(pool.oldest_key_time(), Some(13));
    }

    #[test]
    fn disjoint_chains() {
        let mut pool = KeyPool::new();
        pool.push(hash160(b"a"), entry(false, 1));
        pool.push(hash160(b"b"), entry(true, 2));
        let external: BTreeSet<i64> = pool.external.iter().copied().collect();
        let internal: BTreeSet<i64> = pool.internal.iter().copied().collect();
        assert!(external.is_disjoint(&internal));
    }
}
