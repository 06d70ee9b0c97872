// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use chrono::prelude::*;
use lazy_static::*;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

lazy_static! {
    /// Set once the process has been asked to terminate
    pub static ref EXIT_SIGNAL: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
}

/// Process start time in milliseconds since the unix epoch
pub static STARTUP_TIME: AtomicI64 = AtomicI64::new(0);

/// Initialize globals
pub fn init() {
    STARTUP_TIME.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    lazy_static::initialize(&EXIT_SIGNAL);
}

/// Milliseconds elapsed since `init`
pub fn uptime_ms() -> i64 {
    Utc::now().timestamp_millis() - STARTUP_TIME.load(Ordering::Relaxed)
}

/// Asks every long running task to wind down.
pub fn request_exit() {
    EXIT_SIGNAL.store(true, Ordering::Relaxed);
}
