//! Typed record layer over the key/value store.
//!
//! Every record key is the compact-size-prefixed type tag followed by
//! the record's own key material, so one flat namespace holds the
//! whole wallet. Multi-record transitions go through `DbBatch` and
//! commit atomically.

use std::collections::BTreeMap;

use vaultd_consensus::Hash256;
use vaultd_log::{log_debug, log_warn};
use vaultd_primitives::encoding::{decode_all, encode_to_vec, Decoder, Encoder};
use vaultd_storage::{KeyValueStore, WriteBatch};

use crate::error::WalletError;
use crate::hdchain::{HdChain, KeyPoolEntry};
use crate::keystore::{KeyId, KeyMetadata, MasterKeyEnvelope};
use crate::wtx::{AccountingEntry, WalletTx};

pub const REC_VERSION: &str = "version";
pub const REC_MIN_VERSION: &str = "minversion";
pub const REC_BEST_BLOCK: &str = "bestblock";
pub const REC_ORDER_POS_NEXT: &str = "orderposnext";
pub const REC_DEFAULT_KEY: &str = "defaultkey";
pub const REC_KEY: &str = "key";
pub const REC_CRYPTED_KEY: &str = "ckey";
pub const REC_MASTER_KEY: &str = "mkey";
pub const REC_KEY_META: &str = "keymeta";
pub const REC_WATCH: &str = "watchs";
pub const REC_WATCH_META: &str = "watchmeta";
pub const REC_CSCRIPT: &str = "cscript";
pub const REC_POOL: &str = "pool";
pub const REC_HD_CHAIN: &str = "hdchain";
pub const REC_TX: &str = "tx";
pub const REC_NAME: &str = "name";
pub const REC_PURPOSE: &str = "purpose";
pub const REC_DEST_DATA: &str = "destdata";
pub const REC_ACCOUNT: &str = "acc";
pub const REC_ACCOUNT_ENTRY: &str = "acentry";

pub const WALLET_VERSION: i32 = 160_000;
pub const MIN_SUPPORTED_VERSION: i32 = 60_000;

fn record_key(prefix: &str, payload: &[u8]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_var_str(prefix);
    encoder.write_bytes(payload);
    encoder.into_inner()
}

fn encode_master_key(envelope: &MasterKeyEnvelope) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_u32_le(envelope.mem_kib);
    encoder.write_u32_le(envelope.iters);
    encoder.write_u32_le(envelope.parallelism);
    encoder.write_bytes(&envelope.salt);
    encoder.write_bytes(&envelope.nonce);
    encoder.write_var_bytes(&envelope.ciphertext);
    encoder.into_inner()
}

fn decode_master_key(bytes: &[u8]) -> Result<MasterKeyEnvelope, WalletError> {
    let mut decoder = Decoder::new(bytes);
    let envelope = MasterKeyEnvelope {
        mem_kib: decoder.read_u32_le()?,
        iters: decoder.read_u32_le()?,
        parallelism: decoder.read_u32_le()?,
        salt: decoder.read_fixed::<16>()?,
        nonce: decoder.read_fixed::<12>()?,
        ciphertext: decoder.read_var_bytes()?,
    };
    Ok(envelope)
}

fn encode_key_meta(meta: &KeyMetadata) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_u64_le(meta.create_time);
    match meta.hd_origin {
        Some((internal, counter)) => {
            encoder.write_u8(1);
            encoder.write_bool(internal);
            encoder.write_u32_le(counter);
        }
        None => encoder.write_u8(0),
    }
    encoder.into_inner()
}

fn decode_key_meta(bytes: &[u8]) -> Result<KeyMetadata, WalletError> {
    let mut decoder = Decoder::new(bytes);
    let create_time = decoder.read_u64_le()?;
    let hd_origin = match decoder.read_u8()? {
        0 => None,
        _ => {
            let internal = decoder.read_bool()?;
            let counter = decoder.read_u32_le()?;
            Some((internal, counter))
        }
    };
    Ok(KeyMetadata {
        create_time,
        hd_origin,
    })
}

fn encode_pool_entry(entry: &KeyPoolEntry) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_u64_le(entry.time_created);
    encoder.write_var_bytes(&entry.pubkey);
    encoder.write_bool(entry.internal);
    encoder.into_inner()
}

fn decode_pool_entry(bytes: &[u8]) -> Result<KeyPoolEntry, WalletError> {
    let mut decoder = Decoder::new(bytes);
    Ok(KeyPoolEntry {
        time_created: decoder.read_u64_le()?,
        pubkey: decoder.read_var_bytes()?,
        internal: decoder.read_bool()?,
    })
}

fn encode_hd_chain(chain: &HdChain) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_u32_le(chain.version);
    encoder.write_bytes(&chain.seed_id);
    encoder.write_u32_le(chain.external_counter);
    encoder.write_u32_le(chain.internal_counter);
    encoder.into_inner()
}

fn decode_hd_chain(bytes: &[u8]) -> Result<HdChain, WalletError> {
    let mut decoder = Decoder::new(bytes);
    Ok(HdChain {
        version: decoder.read_u32_le()?,
        seed_id: decoder.read_fixed::<20>()?,
        external_counter: decoder.read_u32_le()?,
        internal_counter: decoder.read_u32_le()?,
    })
}

/// Typed writes staged for one atomic commit.
#[derive(Default)]
pub struct DbBatch {
    inner: WriteBatch,
}

impl DbBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn put_version(&mut self, version: i32) {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(version);
        self.inner
            .put(record_key(REC_VERSION, &[]), encoder.into_inner());
    }

    pub fn put_min_version(&mut self, version: i32) {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(version);
        self.inner
            .put(record_key(REC_MIN_VERSION, &[]), encoder.into_inner());
    }

    pub fn put_best_block(&mut self, locator: &[Hash256]) {
        let mut encoder = Encoder::new();
        encoder.write_compact_size(locator.len() as u64);
        for hash in locator {
            encoder.write_hash(hash);
        }
        self.inner
            .put(record_key(REC_BEST_BLOCK, &[]), encoder.into_inner());
    }

    pub fn put_order_pos_next(&mut self, next: i64) {
        let mut encoder = Encoder::new();
        encoder.write_i64_le(next);
        self.inner
            .put(record_key(REC_ORDER_POS_NEXT, &[]), encoder.into_inner());
    }

    pub fn put_default_key(&mut self, pubkey: &[u8]) {
        let mut encoder = Encoder::new();
        encoder.write_var_bytes(pubkey);
        self.inner
            .put(record_key(REC_DEFAULT_KEY, &[]), encoder.into_inner());
    }

    pub fn put_key(&mut self, pubkey: &[u8], secret: &[u8; 32]) {
        let mut payload = Encoder::new();
        payload.write_var_bytes(pubkey);
        let mut value = Encoder::new();
        value.write_var_bytes(secret);
        self.inner.put(
            record_key(REC_KEY, &payload.into_inner()),
            value.into_inner(),
        );
    }

    pub fn erase_key(&mut self, pubkey: &[u8]) {
        let mut payload = Encoder::new();
        payload.write_var_bytes(pubkey);
        self.inner.delete(record_key(REC_KEY, &payload.into_inner()));
    }

    pub fn put_crypted_key(&mut self, pubkey: &[u8], ciphertext: &[u8]) {
        let mut payload = Encoder::new();
        payload.write_var_bytes(pubkey);
        let mut value = Encoder::new();
        value.write_var_bytes(ciphertext);
        self.inner.put(
            record_key(REC_CRYPTED_KEY, &payload.into_inner()),
            value.into_inner(),
        );
    }

    pub fn put_master_key(&mut self, id: u32, envelope: &MasterKeyEnvelope) {
        let mut payload = Encoder::new();
        payload.write_u32_le(id);
        self.inner.put(
            record_key(REC_MASTER_KEY, &payload.into_inner()),
            encode_master_key(envelope),
        );
    }

    pub fn put_key_meta(&mut self, key_id: &KeyId, meta: &KeyMetadata) {
        self.inner
            .put(record_key(REC_KEY_META, key_id), encode_key_meta(meta));
    }

    pub fn put_watch_script(&mut self, script: &[u8]) {
        let mut payload = Encoder::new();
        payload.write_var_bytes(script);
        self.inner
            .put(record_key(REC_WATCH, &payload.into_inner()), vec![1u8]);
    }

    pub fn put_watch_meta(&mut self, script: &[u8], meta: &KeyMetadata) {
        let mut payload = Encoder::new();
        payload.write_var_bytes(script);
        self.inner.put(
            record_key(REC_WATCH_META, &payload.into_inner()),
            encode_key_meta(meta),
        );
    }

    pub fn put_cscript(&mut self, script_id: &KeyId, script: &[u8]) {
        let mut value = Encoder::new();
        value.write_var_bytes(script);
        self.inner
            .put(record_key(REC_CSCRIPT, script_id), value.into_inner());
    }

    pub fn put_pool(&mut self, index: i64, entry: &KeyPoolEntry) {
        self.inner.put(
            record_key(REC_POOL, &index.to_be_bytes()),
            encode_pool_entry(entry),
        );
    }

    pub fn erase_pool(&mut self, index: i64) {
        self.inner.delete(record_key(REC_POOL, &index.to_be_bytes()));
    }

    pub fn put_hd_chain(&mut self, chain: &HdChain) {
        self.inner
            .put(record_key(REC_HD_CHAIN, &[]), encode_hd_chain(chain));
    }

    pub fn put_tx(&mut self, txid: &Hash256, wtx: &WalletTx) {
        self.inner
            .put(record_key(REC_TX, txid), encode_to_vec(wtx));
    }

    pub fn erase_tx(&mut self, txid: &Hash256) {
        self.inner.delete(record_key(REC_TX, txid));
    }

    pub fn put_name(&mut self, destination: &[u8], label: &str) {
        let mut payload = Encoder::new();
        payload.write_var_bytes(destination);
        let mut value = Encoder::new();
        value.write_var_str(label);
        self.inner.put(
            record_key(REC_NAME, &payload.into_inner()),
            value.into_inner(),
        );
    }

    pub fn erase_name(&mut self, destination: &[u8]) {
        let mut payload = Encoder::new();
        payload.write_var_bytes(destination);
        self.inner.delete(record_key(REC_NAME, &payload.into_inner()));
    }

    pub fn put_purpose(&mut self, destination: &[u8], purpose: &str) {
        let mut payload = Encoder::new();
        payload.write_var_bytes(destination);
        let mut value = Encoder::new();
        value.write_var_str(purpose);
        self.inner.put(
            record_key(REC_PURPOSE, &payload.into_inner()),
            value.into_inner(),
        );
    }

    pub fn erase_purpose(&mut self, destination: &[u8]) {
        let mut payload = Encoder::new();
        payload.write_var_bytes(destination);
        self.inner
            .delete(record_key(REC_PURPOSE, &payload.into_inner()));
    }

    pub fn put_dest_data(&mut self, destination: &[u8], data_key: &str, value: &[u8]) {
        let mut payload = Encoder::new();
        payload.write_var_bytes(destination);
        payload.write_var_str(data_key);
        let mut encoded = Encoder::new();
        encoded.write_var_bytes(value);
        self.inner.put(
            record_key(REC_DEST_DATA, &payload.into_inner()),
            encoded.into_inner(),
        );
    }

    pub fn put_account(&mut self, account: &str, pubkey: &[u8]) {
        let mut payload = Encoder::new();
        payload.write_var_str(account);
        let mut value = Encoder::new();
        value.write_var_bytes(pubkey);
        self.inner.put(
            record_key(REC_ACCOUNT, &payload.into_inner()),
            value.into_inner(),
        );
    }

    pub fn put_account_entry(&mut self, counter: u64, entry: &AccountingEntry) {
        let mut payload = Encoder::new();
        payload.write_var_str(&entry.account);
        payload.write_bytes(&counter.to_be_bytes());
        self.inner.put(
            record_key(REC_ACCOUNT_ENTRY, &payload.into_inner()),
            encode_to_vec(entry),
        );
    }
}

/// Everything a load pass recovered, before the wallet assembles its
/// in-memory state. Records may arrive in any order, so this is a
/// plain bag of parts.
#[derive(Default)]
pub struct LoadedWallet {
    pub version: i32,
    pub min_version: i32,
    pub best_block: Vec<Hash256>,
    pub order_pos_next: i64,
    pub default_key: Vec<u8>,
    pub keys: Vec<(Vec<u8>, [u8; 32])>,
    pub crypted_keys: Vec<(Vec<u8>, Vec<u8>)>,
    pub master_keys: Vec<(u32, MasterKeyEnvelope)>,
    pub key_meta: Vec<(KeyId, KeyMetadata)>,
    pub watch_scripts: Vec<Vec<u8>>,
    pub watch_meta: Vec<(Vec<u8>, KeyMetadata)>,
    pub cscripts: Vec<Vec<u8>>,
    pub pool: Vec<(i64, KeyPoolEntry)>,
    pub hd_chain: Option<HdChain>,
    pub txs: Vec<(Hash256, WalletTx)>,
    pub names: BTreeMap<Vec<u8>, String>,
    pub purposes: BTreeMap<Vec<u8>, String>,
    pub dest_data: BTreeMap<(Vec<u8>, String), Vec<u8>>,
    pub accounts: BTreeMap<String, Vec<u8>>,
    pub account_entries: Vec<AccountingEntry>,
    /// Count of records skipped because they failed to decode.
    pub skipped: usize,
}

pub struct WalletDb<S: KeyValueStore> {
    store: S,
}

impl<S: KeyValueStore> WalletDb<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn commit(&self, batch: DbBatch) -> Result<(), WalletError> {
        self.store.write_batch(&batch.inner)?;
        Ok(())
    }

    pub fn flush(&self, shutdown: bool) -> Result<(), WalletError> {
        self.store.flush(shutdown)?;
        Ok(())
    }

    /// Streams every record into a `LoadedWallet`. Single bad records
    /// are logged and skipped; the caller checks `skipped` and reacts
    /// with `NeedRewrite`.
    pub fn load(&self) -> Result<LoadedWallet, WalletError> {
        let mut loaded = LoadedWallet {
            version: WALLET_VERSION,
            ..LoadedWallet::default()
        };

        for (key, value) in self.store.scan_prefix(&[])? {
            if let Err(err) = self.load_record(&key, &value, &mut loaded) {
                log_warn!("skipping undecodable wallet record: {err}");
                loaded.skipped += 1;
            }
        }

        if loaded.min_version > WALLET_VERSION {
            return Err(WalletError::DatabaseCorrupt(
                "wallet requires a newer client version",
            ));
        }
        log_debug!(
            "wallet load: {} txs, {} keys, {} pool entries, {} skipped",
            loaded.txs.len(),
            loaded.keys.len() + loaded.crypted_keys.len(),
            loaded.pool.len(),
            loaded.skipped
        );
        Ok(loaded)
    }

    fn load_record(
        &self,
        key: &[u8],
        value: &[u8],
        loaded: &mut LoadedWallet,
    ) -> Result<(), WalletError> {
        let mut key_decoder = Decoder::new(key);
        let prefix = key_decoder.read_var_str()?;
        let mut value_decoder = Decoder::new(value);

        match prefix.as_str() {
            REC_VERSION => loaded.version = value_decoder.read_i32_le()?,
            REC_MIN_VERSION => loaded.min_version = value_decoder.read_i32_le()?,
            REC_BEST_BLOCK => {
                let count = value_decoder.read_compact_size()?;
                let mut locator = Vec::with_capacity(count.min(64) as usize);
                for _ in 0..count {
                    locator.push(value_decoder.read_hash()?);
                }
                loaded.best_block = locator;
            }
            REC_ORDER_POS_NEXT => loaded.order_pos_next = value_decoder.read_i64_le()?,
            REC_DEFAULT_KEY => loaded.default_key = value_decoder.read_var_bytes()?,
            REC_KEY => {
                let pubkey = key_decoder.read_var_bytes()?;
                let secret = value_decoder.read_var_bytes()?;
                let secret: [u8; 32] = secret
                    .try_into()
                    .map_err(|_| WalletError::InvalidData("bad stored key length"))?;
                loaded.keys.push((pubkey, secret));
            }
            REC_CRYPTED_KEY => {
                let pubkey = key_decoder.read_var_bytes()?;
                let ciphertext = value_decoder.read_var_bytes()?;
                loaded.crypted_keys.push((pubkey, ciphertext));
            }
            REC_MASTER_KEY => {
                let id = key_decoder.read_u32_le()?;
                loaded.master_keys.push((id, decode_master_key(value)?));
            }
            REC_KEY_META => {
                let key_id = key_decoder.read_fixed::<20>()?;
                loaded.key_meta.push((key_id, decode_key_meta(value)?));
            }
            REC_WATCH => loaded.watch_scripts.push(key_decoder.read_var_bytes()?),
            REC_WATCH_META => {
                let script = key_decoder.read_var_bytes()?;
                loaded.watch_meta.push((script, decode_key_meta(value)?));
            }
            REC_CSCRIPT => {
                let _script_id = key_decoder.read_fixed::<20>()?;
                loaded.cscripts.push(value_decoder.read_var_bytes()?);
            }
            REC_POOL => {
                let index = i64::from_be_bytes(key_decoder.read_fixed::<8>()?);
                loaded.pool.push((index, decode_pool_entry(value)?));
            }
            REC_HD_CHAIN => loaded.hd_chain = Some(decode_hd_chain(value)?),
            REC_TX => {
                let txid = key_decoder.read_hash()?;
                let wtx: WalletTx = decode_all(value)?;
                loaded.txs.push((txid, wtx));
            }
            REC_NAME => {
                let destination = key_decoder.read_var_bytes()?;
                loaded.names.insert(destination, value_decoder.read_var_str()?);
            }
            REC_PURPOSE => {
                let destination = key_decoder.read_var_bytes()?;
                loaded
                    .purposes
                    .insert(destination, value_decoder.read_var_str()?);
            }
            REC_DEST_DATA => {
                let destination = key_decoder.read_var_bytes()?;
                let data_key = key_decoder.read_var_str()?;
                loaded
                    .dest_data
                    .insert((destination, data_key), value_decoder.read_var_bytes()?);
            }
            REC_ACCOUNT => {
                let account = key_decoder.read_var_str()?;
                loaded.accounts.insert(account, value_decoder.read_var_bytes()?);
            }
            REC_ACCOUNT_ENTRY => {
                let account = key_decoder.read_var_str()?;
                let _counter = u64::from_be_bytes(key_decoder.read_fixed::<8>()?);
                let mut entry: AccountingEntry = decode_all(value)?;
                entry.account = account;
                loaded.account_entries.push(entry);
            }
            _ => return Err(WalletError::InvalidData("unknown record prefix")),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultd_storage::MemoryStore;

    #[test]
    fn scalar_records_roundtrip() {
        let db = WalletDb::new(MemoryStore::new());
        let mut batch = DbBatch::new();
        batch.put_version(WALLET_VERSION);
        batch.put_min_version(MIN_SUPPORTED_VERSION);
        batch.put_order_pos_next(42);
        batch.put_best_block(&[[8u8; 32], [9u8; 32]]);
        db.commit(batch).expect("commit");

        let loaded = db.load().expect("load");
        assert_eq!(loaded.version, WALLET_VERSION);
        assert_eq!(loaded.min_version, MIN_SUPPORTED_VERSION);
        assert_eq!(loaded.order_pos_next, 42);
        assert_eq!(loaded.best_block, vec![[8u8; 32], [9u8; 32]]);
        assert_eq!(loaded.skipped, 0);
    }

    #[test]
    fn pool_records_keep_index_order() {
        let db = WalletDb::new(MemoryStore::new());
        let mut batch = DbBatch::new();
        for index in [5i64, 1, 3] {
            batch.put_pool(
                index,
                &KeyPoolEntry {
                    time_created: 100 + index as u64,
                    pubkey: vec![2u8; 33],
                    internal: index % 2 == 1,
                },
            );
        }
        db.commit(batch).expect("commit");

        let loaded = db.load().expect("load");
        let indices: Vec<i64> = loaded.pool.iter().map(|(index, _)| *index).collect();
        assert_eq!(indices, vec![1, 3, 5]);
    }

    #[test]
    fn corrupt_record_is_skipped_not_fatal() {
        let store = MemoryStore::new();
        {
            use vaultd_storage::KeyValueStore;
            // A tx record with a truncated value.
            store.put(&record_key(REC_TX, &[7u8; 32]), &[1, 2, 3]).expect("put");
        }
        let db = WalletDb::new(store);
        let mut batch = DbBatch::new();
        batch.put_order_pos_next(1);
        db.commit(batch).expect("commit");

        let loaded = db.load().expect("load");
        assert_eq!(loaded.skipped, 1);
        assert_eq!(loaded.order_pos_next, 1);
        assert!(loaded.txs.is_empty());
    }

    #[test]
    fn master_key_envelope_roundtrip() {
        let db = WalletDb::new(MemoryStore::new());
        let envelope = MasterKeyEnvelope {
            mem_kib: 65_536,
            iters: 3,
            parallelism: 1,
            salt: [7u8; 16],
            nonce: [8u8; 12],
            ciphertext: vec![9u8; 48],
        };
        let mut batch = DbBatch::new();
        batch.put_master_key(1, &envelope);
        db.commit(batch).expect("commit");

        let loaded = db.load().expect("load");
        assert_eq!(loaded.master_keys.len(), 1);
        let (id, decoded) = &loaded.master_keys[0];
        assert_eq!(*id, 1);
        assert_eq!(decoded.salt, envelope.salt);
        assert_eq!(decoded.ciphertext, envelope.ciphertext);
    }
}
