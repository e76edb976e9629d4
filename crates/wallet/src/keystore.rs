//! Key material: plaintext or encrypted private keys, watch-only
//! scripts, redeem scripts, and the passphrase-wrapped master key.

use std::collections::{BTreeMap, BTreeSet};

use argon2::{Algorithm as Argon2Algorithm, Argon2, Params as Argon2Params, Version as Argon2Version};
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, KeyInit};
use rand::RngCore;
use secp256k1::{PublicKey, SecretKey};
use vaultd_primitives::hash::{hash160, sha256d};
use vaultd_script::secp256k1_ctx;
use zeroize::Zeroize;

use crate::error::WalletError;

pub type KeyId = [u8; 20];

pub const MASTER_KEY_BYTES: usize = 32;
const KDF_SALT_BYTES: usize = 16;
const AEAD_NONCE_BYTES: usize = 12;
const MASTER_KEY_AAD: &[u8] = b"vaultd master key";

const KDF_DEFAULT_MEM_KIB: u32 = 19 * 1024;
const KDF_DEFAULT_ITERS: u32 = 2;
const KDF_DEFAULT_PARALLELISM: u32 = 1;

/// Passphrase-wrapped master key as persisted under `mkey`.
#[derive(Clone)]
pub struct MasterKeyEnvelope {
    pub mem_kib: u32,
    pub iters: u32,
    pub parallelism: u32,
    pub salt: [u8; KDF_SALT_BYTES],
    pub nonce: [u8; AEAD_NONCE_BYTES],
    pub ciphertext: Vec<u8>,
}

#[derive(Clone)]
enum KeySecret {
    Plain([u8; 32]),
    Crypted(Vec<u8>),
}

#[derive(Clone)]
struct StoredKey {
    pubkey: Vec<u8>,
    secret: KeySecret,
}

/// Per-key metadata persisted under `keymeta`/`watchmeta`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyMetadata {
    /// Unix creation time; 0 means unknown and forces a deep rescan.
    pub create_time: u64,
    /// HD origin as (internal chain?, counter); `None` for imports.
    pub hd_origin: Option<(bool, u32)>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyStoreState {
    Unencrypted,
    Locked,
    Unlocked,
}

#[derive(Default)]
pub struct KeyStore {
    keys: BTreeMap<KeyId, StoredKey>,
    metadata: BTreeMap<KeyId, KeyMetadata>,
    redeem_scripts: BTreeMap<KeyId, Vec<u8>>,
    watch_scripts: BTreeSet<Vec<u8>>,
    master_keys: BTreeMap<u32, MasterKeyEnvelope>,
    session_key: Option<[u8; MASTER_KEY_BYTES]>,
    relock_at: u64,
}

impl Drop for KeyStore {
    fn drop(&mut self) {
        self.wipe_session();
    }
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> KeyStoreState {
        if self.master_keys.is_empty() {
            KeyStoreState::Unencrypted
        } else if self.session_key.is_some() {
            KeyStoreState::Unlocked
        } else {
            KeyStoreState::Locked
        }
    }

    pub fn is_encrypted(&self) -> bool {
        !self.master_keys.is_empty()
    }

    pub fn can_sign(&self) -> bool {
        self.state() != KeyStoreState::Locked
    }

    pub fn relock_deadline(&self) -> u64 {
        self.relock_at
    }

    /// Relocks when the unlock window has expired.
    pub fn maybe_relock(&mut self, now: u64) {
        if self.session_key.is_some() && self.relock_at != 0 && now >= self.relock_at {
            self.lock();
        }
    }

    pub fn add_key(&mut self, secret: SecretKey, pubkey: PublicKey) -> Result<KeyId, WalletError> {
        let pubkey_bytes = pubkey.serialize().to_vec();
        let key_id = hash160(&pubkey_bytes);
        if let Some(existing) = self.keys.get(&key_id) {
            let matches = match &existing.secret {
                KeySecret::Plain(bytes) => bytes[..] == secret.secret_bytes(),
                // An encrypted duplicate is accepted as-is; the AEAD
                // tag catches mismatches at decrypt time.
                KeySecret::Crypted(_) => true,
            };
            if !matches {
                return Err(WalletError::AlreadyExists);
            }
            return Ok(key_id);
        }

        let stored_secret = match self.state() {
            KeyStoreState::Unencrypted => KeySecret::Plain(secret.secret_bytes()),
            KeyStoreState::Locked => return Err(WalletError::Locked),
            KeyStoreState::Unlocked => {
                let master = self.session_key.as_ref().ok_or(WalletError::Locked)?;
                KeySecret::Crypted(encrypt_key_secret(master, &pubkey_bytes, &secret.secret_bytes())?)
            }
        };
        self.keys.insert(
            key_id,
            StoredKey {
                pubkey: pubkey_bytes,
                secret: stored_secret,
            },
        );
        Ok(key_id)
    }

    /// Installs an encrypted key while loading a locked wallet.
    pub fn add_crypted_key(&mut self, pubkey: Vec<u8>, ciphertext: Vec<u8>) -> Result<KeyId, WalletError> {
        if PublicKey::from_slice(&pubkey).is_err() {
            return Err(WalletError::InvalidData("invalid stored pubkey"));
        }
        let key_id = hash160(&pubkey);
        self.keys.insert(
            key_id,
            StoredKey {
                pubkey,
                secret: KeySecret::Crypted(ciphertext),
            },
        );
        Ok(key_id)
    }

    pub fn add_master_key(&mut self, id: u32, envelope: MasterKeyEnvelope) {
        self.master_keys.insert(id, envelope);
    }

    pub fn set_metadata(&mut self, key_id: KeyId, meta: KeyMetadata) {
        self.metadata.insert(key_id, meta);
    }

    pub fn metadata(&self, key_id: &KeyId) -> Option<&KeyMetadata> {
        self.metadata.get(key_id)
    }

    pub fn have_key(&self, key_id: &KeyId) -> bool {
        self.keys.contains_key(key_id)
    }

    pub fn pubkey_bytes(&self, key_id: &KeyId) -> Option<&[u8]> {
        self.keys.get(key_id).map(|key| key.pubkey.as_slice())
    }

    pub fn key_ids(&self) -> impl Iterator<Item = &KeyId> {
        self.keys.keys()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Private key for `key_id`, decrypting through the session key
    /// when the store is encrypted.
    pub fn secret_key(&self, key_id: &KeyId) -> Result<SecretKey, WalletError> {
        let stored = self.keys.get(key_id).ok_or(WalletError::NotMine)?;
        match &stored.secret {
            KeySecret::Plain(bytes) => {
                SecretKey::from_slice(bytes).map_err(|_| WalletError::InvalidData("invalid stored key"))
            }
            KeySecret::Crypted(ciphertext) => {
                let master = self.session_key.as_ref().ok_or(WalletError::Locked)?;
                let mut plain = decrypt_key_secret(master, &stored.pubkey, ciphertext)?;
                let key = SecretKey::from_slice(&plain)
                    .map_err(|_| WalletError::InvalidData("invalid decrypted key"));
                plain.zeroize();
                key
            }
        }
    }

    /// Stored ciphertext for an encrypted key, for persistence.
    pub fn crypted_blob(&self, key_id: &KeyId) -> Option<&[u8]> {
        match &self.keys.get(key_id)?.secret {
            KeySecret::Crypted(ciphertext) => Some(ciphertext.as_slice()),
            KeySecret::Plain(_) => None,
        }
    }

    /// Plaintext secret bytes, available only while unencrypted.
    pub fn plain_secret(&self, key_id: &KeyId) -> Option<[u8; 32]> {
        match &self.keys.get(key_id)?.secret {
            KeySecret::Plain(bytes) => Some(*bytes),
            KeySecret::Crypted(_) => None,
        }
    }

    pub fn add_redeem_script(&mut self, script: Vec<u8>) -> KeyId {
        let script_id = hash160(&script);
        self.redeem_scripts.insert(script_id, script);
        script_id
    }

    pub fn redeem_script(&self, script_id: &KeyId) -> Option<&[u8]> {
        self.redeem_scripts.get(script_id).map(|s| s.as_slice())
    }

    pub fn redeem_scripts(&self) -> impl Iterator<Item = (&KeyId, &Vec<u8>)> {
        self.redeem_scripts.iter()
    }

    pub fn add_watch_script(&mut self, script: Vec<u8>) {
        self.watch_scripts.insert(script);
    }

    pub fn is_watched(&self, script: &[u8]) -> bool {
        self.watch_scripts.contains(script)
    }

    pub fn watch_scripts(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.watch_scripts.iter()
    }

    /// Encrypts every plaintext key under a fresh master key wrapped
    /// with `passphrase`. Returns the envelope id and the re-encrypted
    /// key set so the caller can persist both in one batch.
    pub fn encrypt(
        &mut self,
        passphrase: &str,
        now: u64,
        unlock_timeout: u64,
    ) -> Result<(u32, MasterKeyEnvelope, Vec<(KeyId, Vec<u8>, Vec<u8>)>), WalletError> {
        if self.is_encrypted() {
            return Err(WalletError::AlreadyEncrypted);
        }

        let mut master = [0u8; MASTER_KEY_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut master);

        let mut salt = [0u8; KDF_SALT_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; AEAD_NONCE_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let mut kdf_key = derive_kdf_key(
            passphrase,
            &salt,
            KDF_DEFAULT_MEM_KIB,
            KDF_DEFAULT_ITERS,
            KDF_DEFAULT_PARALLELISM,
        )?;
        let cipher = ChaCha20Poly1305::new(kdf_key.as_slice().into());
        let ciphertext = cipher
            .encrypt(
                nonce.as_slice().into(),
                Payload {
                    msg: &master,
                    aad: MASTER_KEY_AAD,
                },
            )
            .map_err(|_| WalletError::InvalidData("master key encryption failed"))?;
        kdf_key.zeroize();

        let envelope = MasterKeyEnvelope {
            mem_kib: KDF_DEFAULT_MEM_KIB,
            iters: KDF_DEFAULT_ITERS,
            parallelism: KDF_DEFAULT_PARALLELISM,
            salt,
            nonce,
            ciphertext,
        };

        let mut rewritten = Vec::with_capacity(self.keys.len());
        for (key_id, stored) in self.keys.iter_mut() {
            let KeySecret::Plain(mut plain) = stored.secret.clone() else {
                return Err(WalletError::InvalidData("crypted key in plaintext store"));
            };
            let ciphertext = encrypt_key_secret(&master, &stored.pubkey, &plain)?;
            plain.zeroize();
            if let KeySecret::Plain(bytes) = &mut stored.secret {
                bytes.zeroize();
            }
            stored.secret = KeySecret::Crypted(ciphertext.clone());
            rewritten.push((*key_id, stored.pubkey.clone(), ciphertext));
        }

        let envelope_id = 1u32;
        self.master_keys.insert(envelope_id, envelope.clone());
        self.session_key = Some(master);
        self.relock_at = if unlock_timeout == 0 { 0 } else { now.saturating_add(unlock_timeout) };
        Ok((envelope_id, envelope, rewritten))
    }

    /// Tries `passphrase` against every stored master key. All
    /// envelopes are attempted even after a match so failure cost
    /// does not depend on which one was correct.
    pub fn unlock(&mut self, passphrase: &str, now: u64, unlock_timeout: u64) -> Result<(), WalletError> {
        if !self.is_encrypted() {
            return Ok(());
        }
        let mut recovered: Option<[u8; MASTER_KEY_BYTES]> = None;
        for envelope in self.master_keys.values() {
            let mut kdf_key = derive_kdf_key(
                passphrase,
                &envelope.salt,
                envelope.mem_kib,
                envelope.iters,
                envelope.parallelism,
            )?;
            let cipher = ChaCha20Poly1305::new(kdf_key.as_slice().into());
            let attempt = cipher.decrypt(
                envelope.nonce.as_slice().into(),
                Payload {
                    msg: &envelope.ciphertext,
                    aad: MASTER_KEY_AAD,
                },
            );
            kdf_key.zeroize();
            if let Ok(mut plain) = attempt {
                if plain.len() == MASTER_KEY_BYTES && recovered.is_none() {
                    let mut master = [0u8; MASTER_KEY_BYTES];
                    master.copy_from_slice(&plain);
                    recovered = Some(master);
                }
                plain.zeroize();
            }
        }

        match recovered {
            Some(master) => {
                self.wipe_session();
                self.session_key = Some(master);
                self.relock_at = if unlock_timeout == 0 {
                    0
                } else {
                    now.saturating_add(unlock_timeout)
                };
                Ok(())
            }
            None => Err(WalletError::BadPassphrase),
        }
    }

    pub fn lock(&mut self) {
        self.wipe_session();
        self.relock_at = 0;
    }

    /// Re-wraps the master key under `new`. The per-key ciphertexts
    /// stay valid because the master key itself does not change.
    pub fn change_passphrase(
        &mut self,
        old: &str,
        new: &str,
        now: u64,
        unlock_timeout: u64,
    ) -> Result<(u32, MasterKeyEnvelope), WalletError> {
        let was_locked = self.session_key.is_none();
        self.unlock(old, now, unlock_timeout)?;
        let master = *self.session_key.as_ref().ok_or(WalletError::BadPassphrase)?;

        let mut salt = [0u8; KDF_SALT_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; AEAD_NONCE_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let mut kdf_key = derive_kdf_key(
            new,
            &salt,
            KDF_DEFAULT_MEM_KIB,
            KDF_DEFAULT_ITERS,
            KDF_DEFAULT_PARALLELISM,
        )?;
        let cipher = ChaCha20Poly1305::new(kdf_key.as_slice().into());
        let ciphertext = cipher
            .encrypt(
                nonce.as_slice().into(),
                Payload {
                    msg: &master,
                    aad: MASTER_KEY_AAD,
                },
            )
            .map_err(|_| WalletError::InvalidData("master key encryption failed"))?;
        kdf_key.zeroize();

        let envelope = MasterKeyEnvelope {
            mem_kib: KDF_DEFAULT_MEM_KIB,
            iters: KDF_DEFAULT_ITERS,
            parallelism: KDF_DEFAULT_PARALLELISM,
            salt,
            nonce,
            ciphertext,
        };
        let envelope_id = self.master_keys.keys().next_back().copied().unwrap_or(0) + 1;
        self.master_keys.clear();
        self.master_keys.insert(envelope_id, envelope.clone());
        if was_locked {
            self.lock();
        }
        Ok((envelope_id, envelope))
    }

    pub fn master_keys(&self) -> impl Iterator<Item = (&u32, &MasterKeyEnvelope)> {
        self.master_keys.iter()
    }

    fn wipe_session(&mut self) {
        if let Some(key) = self.session_key.as_mut() {
            key.zeroize();
        }
        self.session_key = None;
    }
}

fn derive_kdf_key(
    passphrase: &str,
    salt: &[u8; KDF_SALT_BYTES],
    mem_kib: u32,
    iters: u32,
    parallelism: u32,
) -> Result<[u8; MASTER_KEY_BYTES], WalletError> {
    let params = Argon2Params::new(mem_kib, iters, parallelism, Some(MASTER_KEY_BYTES))
        .map_err(|_| WalletError::InvalidData("invalid kdf parameters"))?;
    let argon = Argon2::new(Argon2Algorithm::Argon2id, Argon2Version::V0x13, params);
    let mut out = [0u8; MASTER_KEY_BYTES];
    argon
        .hash_password_into(passphrase.as_bytes(), salt, &mut out)
        .map_err(|_| WalletError::InvalidData("kdf failed"))?;
    Ok(out)
}

/// Per-key AEAD: the nonce is derived from the pubkey so the record
/// is self-contained, and the pubkey doubles as associated data.
fn key_nonce(pubkey: &[u8]) -> [u8; AEAD_NONCE_BYTES] {
    let digest = sha256d(pubkey);
    let mut nonce = [0u8; AEAD_NONCE_BYTES];
    nonce.copy_from_slice(&digest[..AEAD_NONCE_BYTES]);
    nonce
}

fn encrypt_key_secret(
    master: &[u8; MASTER_KEY_BYTES],
    pubkey: &[u8],
    secret: &[u8; 32],
) -> Result<Vec<u8>, WalletError> {
    let cipher = ChaCha20Poly1305::new(master.as_slice().into());
    cipher
        .encrypt(
            key_nonce(pubkey).as_slice().into(),
            Payload {
                msg: secret,
                aad: pubkey,
            },
        )
        .map_err(|_| WalletError::InvalidData("key encryption failed"))
}

fn decrypt_key_secret(
    master: &[u8; MASTER_KEY_BYTES],
    pubkey: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, WalletError> {
    let cipher = ChaCha20Poly1305::new(master.as_slice().into());
    cipher
        .decrypt(
            key_nonce(pubkey).as_slice().into(),
            Payload {
                msg: ciphertext,
                aad: pubkey,
            },
        )
        .map_err(|_| WalletError::BadPassphrase)
}

/// Derives the public key for a secret on the shared context.
pub fn pubkey_for_secret(secret: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(secp256k1_ctx(), secret)
}
