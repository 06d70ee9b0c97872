// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Deterministic per-purpose ledger addresses.
//!
//! Every application record kind lives at its own address, derived from a
//! purpose prefix and the owning user. Two processes deriving the address for
//! the same purpose and owner always agree on it.

use crate::primitives::{Hash256, LedgerAddress};

fn derive(purpose: &str, owner: &str) -> LedgerAddress {
    LedgerAddress::from_seed(&format!("podium-{purpose}-{owner}"))
}

/// Public profile fields of the user
#[must_use]
pub fn for_profile_of(address: &LedgerAddress) -> LedgerAddress {
    derive("profile-of", &address.to_base58())
}

/// POD token transactions of the user
#[must_use]
pub fn for_pod_transactions_of(address: &LedgerAddress) -> LedgerAddress {
    derive("pod-transactions-of", &address.to_base58())
}

/// AUD token transactions of the user
#[must_use]
pub fn for_aud_transactions_of(address: &LedgerAddress) -> LedgerAddress {
    derive("aud-transactions-of", &address.to_base58())
}

#[must_use]
pub fn for_integrity_of(address: &LedgerAddress) -> LedgerAddress {
    derive("integrity-of", &address.to_base58())
}

#[must_use]
pub fn for_permissions_of(address: &LedgerAddress) -> LedgerAddress {
    derive("permissions-of", &address.to_base58())
}

/// Ownership record binding a user id to an address
#[must_use]
pub fn for_profile_with_id(id: &str) -> LedgerAddress {
    derive("profile-with-id", id)
}

#[must_use]
pub fn for_posts_by(address: &LedgerAddress) -> LedgerAddress {
    derive("posts-by", &address.to_base58())
}

/// Follow edges pointing away from the user
#[must_use]
pub fn for_users_following(address: &LedgerAddress) -> LedgerAddress {
    derive("users-following", &address.to_base58())
}

/// Follow edges pointing at the user
#[must_use]
pub fn for_users_followed_by(address: &LedgerAddress) -> LedgerAddress {
    derive("users-followed-by", &address.to_base58())
}

/// Encrypted keystore of the user. The password takes part in the derivation
/// so the address cannot be found from the id alone.
#[must_use]
pub fn for_keystore_of(id: &str, password: &str) -> LedgerAddress {
    let secret = Hash256::hash_from_slice(format!("{}:{id}{password}", id.len()), "keystore");
    derive("keystore-of", &secret.to_hex())
}
