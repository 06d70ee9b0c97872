// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::primitives::{Hash256, LedgerAddress, Record, TxPublicKey, TxSignature};
use chacha20poly1305::aead::{Aead, NewAead};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signer, SigningKey};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use zeroize::Zeroize;

const KEYSTORE_SALT_PREFIX: &str = "podium.keystore.";

/// Signing identity under which records are written to the ledger.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    address: LedgerAddress,
}

impl Identity {
    #[must_use]
    pub fn generate() -> Self {
        let mut secret: [u8; 32] = rand::thread_rng().gen();
        let identity = Self::from_secret_bytes(&secret);
        secret.zeroize();
        identity
    }

    #[must_use]
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        let public_key = signing_key.verifying_key().to_bytes();
        let address = LedgerAddress(Hash256::hash_from_slice(public_key, "identity").0);

        Self {
            signing_key,
            address,
        }
    }

    /// Address owned by this identity
    #[must_use]
    pub fn address(&self) -> LedgerAddress {
        self.address
    }

    #[must_use]
    pub fn public_key(&self) -> TxPublicKey {
        self.signing_key.verifying_key().to_bytes()
    }

    #[must_use]
    pub fn sign(&self, message: &[u8]) -> TxSignature {
        self.signing_key.sign(message).to_bytes()
    }

    /// Encrypts the secret key of this identity with the given password.
    ///
    /// `context` salts the key derivation, usually the user id.
    pub fn encrypt(&self, password: &str, context: &str) -> Result<EncryptedEntry, WalletErr> {
        let mut key = password_key(password, context);
        let mut secret = self.signing_key.to_bytes();
        let entry = EncryptedEntry::xchacha20poly1305(&key, &secret);
        key.zeroize();
        secret.zeroize();
        entry
    }

    pub fn decrypt(
        entry: &EncryptedEntry,
        password: &str,
        context: &str,
    ) -> Result<Self, WalletErr> {
        let mut key = password_key(password, context);
        let decrypted = entry.decrypt(&key);
        key.zeroize();
        let mut decrypted = decrypted?;

        if decrypted.len() != 32 {
            decrypted.zeroize();
            return Err(WalletErr::InvalidKey);
        }

        let mut secret = [0; 32];
        secret.copy_from_slice(&decrypted);
        let identity = Self::from_secret_bytes(&secret);
        secret.zeroize();
        decrypted.zeroize();
        Ok(identity)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Stretches a password into a 256bit symmetric key.
fn password_key(password: &str, context: &str) -> [u8; 32] {
    let salt = format!("{KEYSTORE_SALT_PREFIX}{context}");
    let mut pass_hash = argon2rs::argon2d_simple(password, &salt);
    let mut key = [0; 32];
    let mut hasher = blake3::Hasher::new();
    hasher.update(&pass_hash);
    let mut out = hasher.finalize_xof();
    out.fill(&mut key);
    pass_hash.zeroize();
    key
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum EncryptionAlgo {
    XChaCha20Poly1305,
}

/// Encrypted entry that can be stored as a ledger record
#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct EncryptedEntry {
    /// Encryption algorithm
    algo: EncryptionAlgo,

    /// Hex encoded nonce
    nonce: String,

    /// Hex encoded ciphertext
    ciphertext: String,
}

impl fmt::Debug for EncryptedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedEntry")
            .field("algo", &self.algo)
            .field("nonce", &self.nonce)
            .field("data", &"[ENCRYPTED]")
            .finish()
    }
}

impl EncryptedEntry {
    /// Creates an encrypted entry from data with key using XChacha20Poly1305
    pub fn xchacha20poly1305(key: &[u8; 32], data: &[u8]) -> Result<Self, WalletErr> {
        let mut rng = rand::thread_rng();
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
        let nonce_bytes: [u8; 24] = rng.gen();
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, data)
            .map_err(|_| WalletErr::Encryption)?;

        Ok(EncryptedEntry {
            algo: EncryptionAlgo::XChaCha20Poly1305,
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
        })
    }

    /// Decrypts the ciphertext using the provided key
    pub fn decrypt(&self, key: &[u8; 32]) -> Result<Vec<u8>, WalletErr> {
        match self.algo {
            EncryptionAlgo::XChaCha20Poly1305 => {
                let nonce_bytes = hex::decode(&self.nonce).map_err(|_| WalletErr::Malformed)?;
                if nonce_bytes.len() != 24 {
                    return Err(WalletErr::Malformed);
                }
                let ciphertext =
                    hex::decode(&self.ciphertext).map_err(|_| WalletErr::Malformed)?;
                let cipher = XChaCha20Poly1305::new(Key::from_slice(key));

                cipher
                    .decrypt(XNonce::from_slice(&nonce_bytes), ciphertext.as_ref())
                    .map_err(|_| WalletErr::Decryption)
            }
        }
    }

    /// Ledger payload holding this entry
    #[must_use]
    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "record": "keystore",
            "type": "keystore",
            "algo": self.algo,
            "nonce": self.nonce,
            "ciphertext": self.ciphertext,
        })
    }

    pub fn from_record(record: &Record) -> Result<Self, WalletErr> {
        if record.record() != Some("keystore") {
            return Err(WalletErr::Malformed);
        }

        serde_json::from_value(Value::Object(record.fields.clone()))
            .map_err(|_| WalletErr::Malformed)
    }

    /// Compact string form used to carry an identity over http
    pub fn to_blob(&self) -> Result<String, WalletErr> {
        serde_json::to_string(self).map_err(|_| WalletErr::Malformed)
    }

    pub fn from_blob(blob: &str) -> Result<Self, WalletErr> {
        serde_json::from_str(blob).map_err(|_| WalletErr::Malformed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WalletErr {
    /// Encryption failure
    Encryption,

    /// Wrong key or tampered ciphertext
    Decryption,

    /// Decrypted material is not a valid secret key
    InvalidKey,

    /// Entry could not be parsed
    Malformed,
}

impl fmt::Display for WalletErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encryption => write!(f, "encryption failure"),
            Self::Decryption => write!(f, "decryption failure"),
            Self::InvalidKey => write!(f, "invalid secret key"),
            Self::Malformed => write!(f, "malformed keystore entry"),
        }
    }
}
