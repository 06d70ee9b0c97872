// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::primitives::{Hash256, LedgerAddress};
use crate::wallet::Identity;
use chrono::prelude::*;
use ed25519_dalek::{Signature as Ed25519Signature, VerifyingKey as Ed25519VerifyingKey};

pub type TxSignature = [u8; 64];
pub type TxPublicKey = [u8; 32];

/// Payload transaction addressed to every member of `addresses` at once.
#[derive(Clone, Debug, PartialEq)]
pub struct Transaction {
    pub(crate) addresses: Vec<LedgerAddress>,
    pub(crate) app_id: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) timestamp: i64,
    pub(crate) signer: Option<TxPublicKey>,
    pub(crate) signature: Option<TxSignature>,
    pub(crate) hash: Option<Hash256>,
}

impl Transaction {
    #[must_use]
    pub fn new_payload(addresses: Vec<LedgerAddress>, app_id: &str, payload: Vec<u8>) -> Self {
        let mut tx = Self {
            addresses,
            app_id: app_id.to_owned(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
            signer: None,
            signature: None,
            hash: None,
        };
        tx.compute_hash();
        tx
    }

    #[must_use]
    pub fn addresses(&self) -> &[LedgerAddress] {
        &self.addresses
    }

    #[must_use]
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub fn hash(&self) -> Option<&Hash256> {
        self.hash.as_ref()
    }

    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Canonical bytes covered by the signature. Every variable length field is length prefixed.
    #[must_use]
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            8 + self.addresses.len() * 32 + self.app_id.len() + self.payload.len() + 24,
        );
        buf.extend_from_slice(&(self.addresses.len() as u64).to_le_bytes());
        for address in &self.addresses {
            buf.extend_from_slice(address.as_bytes());
        }
        buf.extend_from_slice(&(self.app_id.len() as u64).to_le_bytes());
        buf.extend_from_slice(self.app_id.as_bytes());
        buf.extend_from_slice(&(self.payload.len() as u64).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    pub fn compute_hash(&mut self) {
        self.hash = Some(Hash256::hash_from_slice(self.signing_bytes(), "transaction"));
    }

    pub fn sign(&mut self, identity: &Identity) {
        self.compute_hash();
        self.signer = Some(identity.public_key());
        self.signature = Some(identity.sign(&self.signing_bytes()));
    }

    pub fn verify(&self) -> Result<(), TxVerifyErr> {
        let signer = self.signer.ok_or(TxVerifyErr::Unsigned)?;
        let signature = self.signature.ok_or(TxVerifyErr::Unsigned)?;

        if self.addresses.is_empty() {
            return Err(TxVerifyErr::NoAddresses);
        }

        let public_key =
            Ed25519VerifyingKey::from_bytes(&signer).map_err(|_| TxVerifyErr::InvalidPublicKey)?;
        public_key
            .verify_strict(&self.signing_bytes(), &Ed25519Signature::from_bytes(&signature))
            .map_err(|_| TxVerifyErr::InvalidSignature)
    }
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum TxVerifyErr {
    Unsigned,
    NoAddresses,
    InvalidPublicKey,
    InvalidSignature,
}
