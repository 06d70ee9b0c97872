// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Ledger synchronization engine.
//!
//! Writes fan records out to addresses, history reads infer completion of a
//! stream that never ends, and channels keep deduplicated live subscriptions
//! that expire on inactivity.

mod channel;
mod history;
mod timer;
mod writer;

pub use crate::engine::channel::*;
pub use crate::engine::history::*;
pub use crate::engine::timer::*;
pub use crate::engine::writer::*;
