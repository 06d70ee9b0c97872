// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::ledger::LedgerErr;
use crate::media::StorageErr;
use crate::wallet::WalletErr;
use std::fmt;

/// Code reported when the ledger or server cannot be reached.
pub const CODE_CONNECTION: u16 = 0;

/// Code reported when a read observed nothing before its deadline.
pub const CODE_TIMEOUT: u16 = 2;

/// Code reported when a user id is already taken.
pub const CODE_DUPLICATE_USER: u16 = 3;

/// Code reported when a read-only instance attempts a write.
pub const CODE_PERMISSION: u16 = 101;

#[derive(Debug, Clone, PartialEq)]
pub enum PodiumErr {
    /// No node serving the address could be reached
    Connection(LedgerErr),

    /// Hard deadline elapsed without observing any record
    Timeout,

    /// Subscription fault after data may have flowed
    Stream(LedgerErr),

    /// Write attempted with no destination addresses
    EmptyTarget,

    /// Transaction refused by the ledger
    Submission(LedgerErr),

    DuplicateUser,

    /// Write attempted without the required rights
    Permission,

    /// Server specific numeric error
    Coded(u16),

    Storage(StorageErr),

    Wallet(WalletErr),

    /// Record payload could not be built or interpreted
    Payload(String),
}

impl PodiumErr {
    /// Numeric code of the error, if it carries one across the http boundary.
    #[must_use]
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Connection(_) => Some(CODE_CONNECTION),
            Self::Timeout => Some(CODE_TIMEOUT),
            Self::DuplicateUser => Some(CODE_DUPLICATE_USER),
            Self::Permission => Some(CODE_PERMISSION),
            Self::Coded(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for PodiumErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(err) => write!(f, "connection error: {err}"),
            Self::Timeout => write!(f, "timed out waiting for ledger records"),
            Self::Stream(err) => write!(f, "{err}"),
            Self::EmptyTarget => write!(f, "write has no destination addresses"),
            Self::Submission(err) => write!(f, "submission failed: {err}"),
            Self::DuplicateUser => write!(f, "user id already taken"),
            Self::Permission => write!(f, "permission denied"),
            Self::Coded(code) => write!(f, "server error {code}"),
            Self::Storage(err) => write!(f, "object storage error: {err}"),
            Self::Wallet(err) => write!(f, "wallet error: {err}"),
            Self::Payload(reason) => write!(f, "invalid payload: {reason}"),
        }
    }
}

impl std::error::Error for PodiumErr {}

impl From<StorageErr> for PodiumErr {
    fn from(other: StorageErr) -> Self {
        Self::Storage(other)
    }
}

impl From<WalletErr> for PodiumErr {
    fn from(other: WalletErr) -> Self {
        Self::Wallet(other)
    }
}

impl From<serde_json::Error> for PodiumErr {
    fn from(other: serde_json::Error) -> Self {
        Self::Payload(other.to_string())
    }
}
