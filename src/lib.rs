// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! # Podium
//! Synchronization engine of the Podium social network over an append only ledger.
//!
//! The ledger never tells a reader that it has seen everything at an address.
//! Podium turns its endless per address streams into the primitives an
//! application needs:
//!
//! * **Writes**: a record is signed, submitted and confirmed at one or more
//!   addresses at once. Failures are reported per address.
//! * **History reads**: a subscription is considered complete once it goes
//!   quiet for a while, or times out if nothing ever arrives.
//! * **Channels**: live subscriptions are deduplicated per address and close
//!   themselves after a period without traffic.
//!
//! On top of these sits a thin user layer (account creation, sign in, minting
//! and search) and an optional http interface serving remote clients.

pub mod engine;
pub mod error;
pub mod global;
pub mod ledger;
pub mod media;
pub mod paths;
pub mod podium;
pub mod primitives;
pub mod server;
pub mod settings;
pub mod wallet;

pub use crate::error::PodiumErr;
pub use crate::podium::{Podium, PodiumConfig, Universe};
